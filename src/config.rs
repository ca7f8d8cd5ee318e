use anyhow::Result;
use bevy::math::DVec2;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Settings of the quadtree streaming engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Upper bound of the shared tile cache in bytes.
    pub cache_bytes: usize,
    /// Number of evictions after which the cache compacts itself.
    pub max_cleanup_count: usize,
    /// Minimum number of screen pixels covered by a single mesh cell before a node is split.
    pub min_pixels_per_cell: f64,
    pub worker_threads: usize,
    /// Loads children on background workers instead of blocking the update.
    pub async_loading: bool,
    pub surface_color: [f32; 4],
    /// Color of vertices without elevation data.
    pub missing_color: [f32; 4],
    /// Ground size of one pixel of the finest level.
    pub pixel_scale: [f64; 2],
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            cache_bytes: 400_000_000,
            max_cleanup_count: 1000,
            min_pixels_per_cell: 4.0,
            worker_threads: 5,
            async_loading: true,
            surface_color: [0.8, 0.8, 0.8, 1.0],
            missing_color: [0.6, 0.0, 0.0, 1.0],
            pixel_scale: [1.0, 1.0],
        }
    }
}

impl StreamingConfig {
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(ron::from_str(&text)?)
    }

    pub fn save_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn pixel_scale(&self) -> DVec2 {
        DVec2::from_array(self.pixel_scale)
    }
}
