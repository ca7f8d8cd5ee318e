use bevy::math::DVec3;
use serde::{Deserialize, Serialize};

/// The view used to decide how finely the quadtree is refined.
///
/// Positions are given in terrain space: x points east, y north and z up,
/// with the origin at the center of the terrain.
pub trait ViewCamera {
    fn location(&self) -> DVec3;

    fn look_at(&self) -> DVec3;

    /// The size of one screen pixel in world units at `distance` from the camera.
    /// Returns [`None`] if the distance lies outside of the clipping range.
    fn pixel_size_at(&self, distance: f64) -> Option<f64>;

    /// Whether the bounding sphere is completely outside of the view frustum.
    fn is_culled(&self, center: DVec3, radius: f64) -> bool;
}

/// Stepped zoom factors of a camera.
///
/// The first twenty steps zoom out in increments of a tenth, after which every step adds a
/// full magnification level.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MagnificationTable {
    factors: Vec<f64>,
}

impl MagnificationTable {
    pub const DEFAULT_INDEX: usize = 9;

    pub fn new(factors: Vec<f64>) -> Self {
        Self { factors }
    }

    pub fn factor(&self, index: usize) -> f64 {
        self.factors
            .get(index.min(self.factors.len().saturating_sub(1)))
            .copied()
            .unwrap_or(1.0)
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }
}

impl Default for MagnificationTable {
    fn default() -> Self {
        let mut factor = 0.0;
        let factors = (0..1020)
            .map(|index| {
                factor += if index < 20 { 0.1 } else { 1.0 };
                factor
            })
            .collect();

        Self { factors }
    }
}

/// A perspective camera with a symmetric frustum.
#[derive(Clone, Debug)]
pub struct PerspectiveCamera {
    pub location: DVec3,
    pub look_at: DVec3,
    /// Vertical field of view in radians.
    pub fov_y: f64,
    pub aspect: f64,
    /// Height of the viewport in pixels.
    pub viewport_height: f64,
    pub near: f64,
    pub far: f64,
    pub magnification: usize,
    pub magnification_table: MagnificationTable,
}

impl Default for PerspectiveCamera {
    fn default() -> Self {
        Self {
            location: DVec3::new(0.0, 0.0, 10.0),
            look_at: DVec3::ZERO,
            fov_y: 45f64.to_radians(),
            aspect: 1.0,
            viewport_height: 1080.0,
            near: 0.1,
            far: 1.0e7,
            magnification: MagnificationTable::DEFAULT_INDEX,
            magnification_table: MagnificationTable::default(),
        }
    }
}

impl PerspectiveCamera {
    pub fn new(location: DVec3, look_at: DVec3, viewport_height: f64) -> Self {
        Self {
            location,
            look_at,
            viewport_height,
            ..Default::default()
        }
    }

    fn direction(&self) -> DVec3 {
        (self.look_at - self.location).normalize_or(DVec3::NEG_Z)
    }

    /// Half angle of the cone enclosing the frustum.
    fn half_angle(&self) -> f64 {
        let tan_y = (self.fov_y / 2.0).tan() / self.magnification_table.factor(self.magnification);
        (tan_y * (1.0 + self.aspect * self.aspect).sqrt()).atan()
    }
}

impl ViewCamera for PerspectiveCamera {
    fn location(&self) -> DVec3 {
        self.location
    }

    fn look_at(&self) -> DVec3 {
        self.look_at
    }

    fn pixel_size_at(&self, distance: f64) -> Option<f64> {
        if distance > self.far || distance < self.near {
            return None;
        }

        let zoom = self.magnification_table.factor(self.magnification);
        let frustum_height = 2.0 * distance * (self.fov_y / 2.0).tan() / zoom;

        Some(frustum_height / self.viewport_height)
    }

    fn is_culled(&self, center: DVec3, radius: f64) -> bool {
        let offset = center - self.location;
        let depth = offset.dot(self.direction());

        if depth < -radius || depth - radius > self.far {
            return true;
        }

        let (sin, cos) = self.half_angle().sin_cos();
        let axis_distance = (offset - depth * self.direction()).length();

        axis_distance * cos - depth * sin > radius
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_magnification_table() {
        let table = MagnificationTable::default();

        assert_eq!(table.len(), 1020);
        assert!((table.factor(0) - 0.1).abs() < 1e-9);
        assert!((table.factor(MagnificationTable::DEFAULT_INDEX) - 1.0).abs() < 1e-9);
        assert!((table.factor(20) - 3.0).abs() < 1e-9);
        assert_eq!(table.factor(5000), table.factor(1019));
    }

    #[test]
    fn pixel_size_grows_with_distance() {
        let camera = PerspectiveCamera::default();

        let near = camera.pixel_size_at(10.0).unwrap();
        let far = camera.pixel_size_at(20.0).unwrap();

        assert!((far - 2.0 * near).abs() < 1e-12);
        assert!(camera.pixel_size_at(0.01).is_none());
        assert!(camera.pixel_size_at(1.0e8).is_none());
    }

    #[test]
    fn culling() {
        let camera = PerspectiveCamera::new(DVec3::new(0.0, 0.0, 100.0), DVec3::ZERO, 1000.0);

        assert!(!camera.is_culled(DVec3::ZERO, 1.0));
        assert!(camera.is_culled(DVec3::new(0.0, 0.0, 200.0), 1.0));
        assert!(camera.is_culled(DVec3::new(1000.0, 0.0, 0.0), 1.0));
        assert!(!camera.is_culled(DVec3::new(1000.0, 0.0, 0.0), 1000.0));
    }
}
