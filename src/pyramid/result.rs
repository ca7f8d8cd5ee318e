use crate::pyramid::LayerKind;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PyramidError {
    #[error("Cannot handle {kind} layer with {samples} samples per pixel.")]
    UnsupportedSamples { kind: LayerKind, samples: u32 },
    #[error("Cannot read {format} samples into a {kind} layer.")]
    UnsupportedSampleFormat {
        kind: LayerKind,
        format: &'static str,
    },
    #[error("Cannot build a pyramid for {0} layers.")]
    UnsupportedLayerKind(LayerKind),
    #[error("Tile size {tile} is larger than the padded raster size {padded}.")]
    TileTooLarge { tile: u32, padded: u32 },
    #[error("Raster of {width}x{length} samples is too large to pad into a pyramid.")]
    RasterTooLarge { width: u32, length: u32 },
    #[error("Tile data does not match the {0} layer.")]
    TileMismatch(LayerKind),
    #[error("Invalid layer properties: {0}")]
    Metadata(String),
    #[error("Layer properties file {0} not found.")]
    MissingMetadata(PathBuf),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("Image error")]
    Image(#[from] image::ImageError),
    #[error("TIFF error")]
    Tiff(#[from] tiff::TiffError),
    #[error("Offscreen rendering failed: {0}")]
    Render(String),
    #[error("The pyramid build was cancelled.")]
    Cancelled,
}

pub type PyramidResult<T> = Result<T, PyramidError>;
