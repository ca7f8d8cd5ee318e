//! Addressing of quadtree nodes and the camera model driving the level of detail.

mod camera;
mod tile_address;

pub use crate::math::{
    camera::{MagnificationTable, PerspectiveCamera, ViewCamera},
    tile_address::{ParseTileAddressError, Quadrant, TileAddress},
};
