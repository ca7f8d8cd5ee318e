use crate::{
    formats::LayerProperties,
    pyramid::{
        read_layer_properties, tile_path, write_tile, CancellationToken, LayerKind, PyramidError,
        PyramidResult, Tile, TileData,
    },
};
use bevy::{
    log::{info, warn},
    math::{DVec2, DVec3},
};
use std::path::{Path, PathBuf};

/// Vector tiles are rasterized with this many pixels per elevation sample.
pub const VECTOR_TILE_SCALE: u32 = 4;

/// An orthographic view volume looking straight down onto the terrain.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct OrthoFrustum {
    /// Position of the camera in terrain space.
    pub center: DVec3,
    pub half_width: f64,
    pub half_length: f64,
    pub near: f64,
    pub far: f64,
}

/// An offscreen render target, onto which the vector features are drawn.
pub trait RenderSurface {
    fn width(&self) -> u32;

    fn length(&self) -> u32;

    /// Sets the color used for features without their own style and the feature attribute
    /// holding their elevation.
    fn set_style(&mut self, _default_color: u32, _elevation_attribute: Option<&str>) {}

    fn set_frustum(&mut self, frustum: OrthoFrustum);

    fn render(&mut self) -> PyramidResult<()>;

    /// The rendered colors packed as `0xRRGGBBAA`, row by row starting at the top left.
    fn read_pixels(&mut self) -> PyramidResult<Vec<u32>>;
}

/// The configuration of a [`VectorPyramidBuilder`].
#[derive(Clone, Debug)]
pub struct VectorBuildOptions {
    /// Directory of the elevation pyramid the vector pyramid is aligned with.
    pub elevation_directory: PathBuf,
    /// Size of one elevation sample in world units.
    pub pixel_scale: DVec2,
    pub default_color: u32,
    pub elevation_attribute: Option<String>,
    /// Name of the vector dataset, recorded as the source of the layer.
    pub source: Option<String>,
}

/// Rasterizes vector features into a color pyramid matching an existing elevation pyramid.
///
/// Every tile is rendered with [`VECTOR_TILE_SCALE`] times the resolution of the
/// elevation tiles, with the camera centered above the area of the corresponding elevation
/// tile.
pub struct VectorPyramidBuilder {
    directory: PathBuf,
    options: VectorBuildOptions,
    cancellation: CancellationToken,
}

impl VectorPyramidBuilder {
    pub fn new(directory: impl Into<PathBuf>, options: VectorBuildOptions) -> Self {
        Self {
            directory: directory.into(),
            options,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn build(&self, surface: &mut impl RenderSurface) -> PyramidResult<LayerProperties> {
        let elevation = read_layer_properties(&self.options.elevation_directory)?;

        let tile_width = elevation.tile_width * VECTOR_TILE_SCALE;
        let tile_length = elevation.tile_length * VECTOR_TILE_SCALE;

        if surface.width() != tile_width + 1 || surface.length() != tile_length + 1 {
            return Err(PyramidError::Render(format!(
                "surface of {} x {} pixels does not fit tiles of {} x {} pixels",
                surface.width(),
                surface.length(),
                tile_width + 1,
                tile_length + 1
            )));
        }

        let range = (elevation.maximum() - elevation.minimum()).max(f64::EPSILON);
        let near = range * 0.0001;
        let far = 2.0 * range;
        let camera_z = elevation.maximum() + 2.0 * near;

        let extent = DVec2::new(
            (elevation.tile_width * elevation.number_of_tiles) as f64,
            (elevation.tile_length * elevation.number_of_tiles) as f64,
        ) * self.options.pixel_scale;
        let left_edge = -extent.x / 2.0;
        let top_edge = extent.y / 2.0;

        surface.set_style(
            self.options.default_color,
            self.options.elevation_attribute.as_deref(),
        );

        let mut scale = self.options.pixel_scale / VECTOR_TILE_SCALE as f64;
        let mut tiles = elevation.number_of_tiles;

        for level in (0..elevation.number_of_levels).rev() {
            let column_step = tile_width as f64 * scale.x;
            let row_step = tile_length as f64 * scale.y;

            info!(
                "Rendering {tiles} x {tiles} vector tiles of level {} of {}.",
                level + 1,
                elevation.number_of_levels
            );

            for row in 0..tiles {
                for column in 0..tiles {
                    self.cancellation.check()?;

                    let frustum = OrthoFrustum {
                        center: DVec3::new(
                            left_edge + column_step * column as f64 + column_step / 2.0,
                            top_edge - row_step * row as f64 - row_step / 2.0,
                            camera_z,
                        ),
                        half_width: column_step / 2.0 + scale.x,
                        half_length: row_step / 2.0 + scale.y,
                        near,
                        far,
                    };

                    let pixels = render_tile(surface, frustum).unwrap_or_else(|error| {
                        warn!("Failed to render vector tile {column}, {row} of level {level}: {error}");
                        Vec::new()
                    });

                    let tile = Tile {
                        columns: tile_width + 1,
                        rows: tile_length + 1,
                        data: TileData::Rgba(pixels),
                    };

                    let path = tile_path(&self.directory, column, row, tiles, level);
                    write_tile(&path, LayerKind::ColorImage, &tile)?;
                }
            }

            tiles /= 2;
            scale *= 2.0;
        }

        let properties = LayerProperties {
            number_of_levels: elevation.number_of_levels,
            number_of_tiles: elevation.number_of_tiles,
            minimum_value: vec![0.0],
            maximum_value: vec![255.0],
            source: self.options.source.clone(),
            ..LayerProperties::new(LayerKind::ColorImage, tile_width, tile_length)
        };

        properties.save_file(self.directory.join(LayerProperties::FILE_NAME))?;

        Ok(properties)
    }
}

fn render_tile(surface: &mut impl RenderSurface, frustum: OrthoFrustum) -> PyramidResult<Vec<u32>> {
    surface.set_frustum(frustum);
    surface.render()?;

    let pixels = surface.read_pixels()?;
    let expected = (surface.width() * surface.length()) as usize;

    if pixels.len() != expected {
        return Err(PyramidError::Render(format!(
            "read {} pixels, expected {expected}",
            pixels.len()
        )));
    }

    Ok(pixels)
}
