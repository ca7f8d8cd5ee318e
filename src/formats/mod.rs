//! Readers and writers of the files surrounding a tile pyramid.

mod properties;
pub mod tiff;

pub use crate::formats::{properties::LayerProperties, tiff::TiffSource};
