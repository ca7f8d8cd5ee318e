//! This crate turns large elevation rasters into tile pyramids and streams them back into a
//! view dependent terrain mesh.
//!
//! # Background
//! There are two halves to the problem:
//!
//! ## How to store terrains of any size?
//! A raster covering a whole region does not fit into memory at full resolution, let alone
//! into a single mesh. Therefore it is preprocessed once into a pyramid of tiles, where each
//! level halves the resolution of the previous one, until the whole terrain fits into a
//! single tile. Texture layers (colors, gray scale images or vector overlays) are cut into
//! pyramids of the same layout, so that every elevation tile has a matching texture tile.
//! See the [`pyramid`] module for more information.
//!
//! ## Which tiles to display?
//! At runtime only the tiles close to the camera have to be shown at full resolution.
//! The [`QuadTreeEngine`](terrain_data::quadtree::QuadTreeEngine) refines a quadtree over the
//! pyramid every frame, loads the tiles it needs in the background and keeps recently used
//! tiles in a bounded cache. Leaves of different resolution are stitched together so that no
//! cracks appear between them.
//! See the [`terrain_data`] module for more information.

pub mod config;
pub mod formats;
pub mod math;
pub mod plugin;
pub mod pyramid;
pub mod terrain_data;

#[allow(missing_docs)]
pub mod prelude {
    #[doc(hidden)]
    pub use crate::{
        config::StreamingConfig,
        formats::{LayerProperties, TiffSource},
        math::{PerspectiveCamera, TileAddress, ViewCamera},
        plugin::{TerrainChanged, TerrainStreamingPlugin, TerrainViewer},
        pyramid::{
            raster::{RasterBuildOptions, RasterPyramidBuilder, RasterSamples},
            vector::{RenderSurface, VectorBuildOptions, VectorPyramidBuilder},
            LayerKind, PyramidError,
        },
        terrain_data::{
            mesh::MeshData,
            quadtree::{QuadTreeEngine, TerrainContext},
            tile_cache::TileCache,
            tile_loader::TileContent,
        },
    };
}
