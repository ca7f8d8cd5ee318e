use crate::{
    formats::LayerProperties,
    math::TileAddress,
    pyramid::{read_layer_properties, read_tile, LayerKind, Tile, TileData, TILE_EXTENSION},
    terrain_data::mesh::MeshData,
};
use anyhow::{anyhow, bail, Result};
use bevy::{
    image::Image,
    log::warn,
    math::DVec2,
    render::{
        render_asset::RenderAssetUsages,
        render_resource::{Extent3d, TextureDimension, TextureFormat},
    },
};
use bytemuck::cast_slice;
use std::path::{Path, PathBuf};

/// Read access to one layer of a tile pyramid on disk.
#[derive(Clone, Debug)]
pub struct PyramidReader {
    directory: PathBuf,
    properties: LayerProperties,
}

impl PyramidReader {
    pub fn open<P: AsRef<Path>>(directory: P) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        let properties = read_layer_properties(&directory)
            .map_err(|error| anyhow!("Failed to open the pyramid at {directory:?}: {error}"))?;

        Ok(Self {
            directory,
            properties,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn properties(&self) -> &LayerProperties {
        &self.properties
    }

    pub fn kind(&self) -> LayerKind {
        self.properties.layer_kind
    }

    /// Reads the tile at `address`.
    /// Tiles that were never written or that are empty placeholders yield [`None`].
    pub fn read(&self, address: &TileAddress) -> Result<Option<Tile>> {
        let path = address.path(&self.directory, TILE_EXTENSION);

        if !path.exists() {
            return Ok(None);
        }

        Ok(read_tile(&path, self.kind())?)
    }
}

/// The tile of a texture layer draped over a terrain mesh.
#[derive(Clone, Debug, PartialEq)]
pub struct TileTexture {
    pub kind: LayerKind,
    pub tile: Tile,
}

impl TileTexture {
    pub fn byte_size(&self) -> usize {
        self.tile.data.byte_size()
    }

    /// Converts the tile into a texture, keeping one texel per sample.
    pub fn to_image(&self) -> Image {
        let (data, format) = match &self.tile.data {
            TileData::Float(samples) => (cast_slice(samples).to_vec(), TextureFormat::R32Float),
            TileData::Rgba(samples) => (
                samples
                    .iter()
                    .flat_map(|color| color.to_be_bytes())
                    .collect(),
                TextureFormat::Rgba8Unorm,
            ),
            TileData::Gray(samples) => (samples.clone(), TextureFormat::R8Unorm),
        };

        Image::new(
            Extent3d {
                width: self.tile.columns,
                height: self.tile.rows,
                depth_or_array_layers: 1,
            },
            TextureDimension::D2,
            data,
            format,
            RenderAssetUsages::default(),
        )
    }
}

/// Everything a quadtree node displays: its mesh and one optional texture per texture layer.
#[derive(Clone, Debug)]
pub struct TileContent {
    pub mesh: MeshData,
    pub textures: Vec<Option<TileTexture>>,
}

impl TileContent {
    /// Whether the node has no elevation data and only displays a flat placeholder.
    pub fn is_no_data(&self) -> bool {
        self.mesh.is_empty()
    }
}

/// The extent of a terrain and its subdivision into tiles.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TerrainGeometry {
    pub tile_width: u32,
    pub tile_length: u32,
    /// Tiles per side at the finest level.
    pub tiles_per_side: u32,
    pub number_of_levels: u32,
    /// Size of a pixel of the finest level in world units.
    pub pixel_scale: DVec2,
}

impl TerrainGeometry {
    pub fn new(properties: &LayerProperties, pixel_scale: DVec2) -> Self {
        Self {
            tile_width: properties.tile_width,
            tile_length: properties.tile_length,
            tiles_per_side: properties.number_of_tiles,
            number_of_levels: properties.number_of_levels,
            pixel_scale,
        }
    }

    /// Size of the whole terrain in world units.
    pub fn extent(&self) -> DVec2 {
        DVec2::new(self.tile_width as f64, self.tile_length as f64)
            * self.tiles_per_side as f64
            * self.pixel_scale
    }

    pub fn pixel_size(&self, level: u32) -> DVec2 {
        self.pixel_scale * self.tiles_per_side as f64 / (1u64 << level) as f64
    }

    pub fn node_size(&self, level: u32) -> DVec2 {
        self.extent() / (1u64 << level) as f64
    }

    pub fn has_children(&self, level: u32) -> bool {
        level + 1 < self.number_of_levels
    }

    /// The estimated memory of a node, used to account for it in the tile cache.
    pub fn node_bytes(&self, texture_bytes: usize) -> usize {
        let (width, length) = (self.tile_width as usize, self.tile_length as usize);
        (width * length * 14 + 2 * width + 2 * length) * 4 + texture_bytes
    }
}

/// Loads the content of nodes from an elevation pyramid and any number of texture pyramids.
///
/// The loader is shared with the background workers, so it only holds immutable state.
#[derive(Clone, Debug)]
pub struct TileLoader {
    elevation: PyramidReader,
    layers: Vec<PyramidReader>,
    geometry: TerrainGeometry,
    surface_color: [f32; 4],
    missing_color: [f32; 4],
}

impl TileLoader {
    pub fn new(
        elevation: PyramidReader,
        layers: Vec<PyramidReader>,
        pixel_scale: DVec2,
        surface_color: [f32; 4],
        missing_color: [f32; 4],
    ) -> Result<Self> {
        let properties = elevation.properties();

        if properties.layer_kind != LayerKind::Elevation {
            bail!(
                "The pyramid at {:?} contains {} tiles instead of elevation tiles.",
                elevation.directory(),
                properties.layer_kind
            );
        }

        let geometry = TerrainGeometry::new(properties, pixel_scale);

        for layer in &layers {
            let layer_properties = layer.properties();

            if layer_properties.number_of_levels < geometry.number_of_levels {
                warn!(
                    "The texture pyramid at {:?} has only {} of {} levels.",
                    layer.directory(),
                    layer_properties.number_of_levels,
                    geometry.number_of_levels
                );
            }
        }

        Ok(Self {
            elevation,
            layers,
            geometry,
            surface_color,
            missing_color,
        })
    }

    pub fn geometry(&self) -> &TerrainGeometry {
        &self.geometry
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// The estimated memory of a node including the tiles of all texture layers.
    pub fn node_bytes(&self) -> usize {
        let samples = (self.geometry.tile_width as usize + 1) * (self.geometry.tile_length as usize + 1);
        let texture_bytes = self
            .layers
            .iter()
            .map(|layer| samples * layer.kind().bytes_per_sample())
            .sum();

        self.geometry.node_bytes(texture_bytes)
    }

    fn fill_value(&self) -> f32 {
        let properties = self.elevation.properties();
        properties
            .edge_fill_value
            .unwrap_or(properties.minimum() as f32)
    }

    /// The content of a node without any elevation data.
    pub fn no_data(&self, address: &TileAddress) -> TileContent {
        let pixel_size = self.geometry.pixel_size(address.level());

        TileContent {
            mesh: MeshData::empty(
                self.geometry.tile_width,
                self.geometry.tile_length,
                pixel_size.x,
                pixel_size.y,
                self.fill_value(),
                self.missing_color,
            ),
            textures: vec![None; self.layers.len()],
        }
    }

    /// Reads the tiles of the node and builds its mesh.
    ///
    /// A missing elevation tile yields a no data node, while unreadable texture tiles are
    /// skipped with a warning.
    pub fn load(&self, address: &TileAddress) -> Result<TileContent> {
        let Some(tile) = self.elevation.read(address)? else {
            return Ok(self.no_data(address));
        };

        let TerrainGeometry {
            tile_width,
            tile_length,
            ..
        } = self.geometry;

        if (tile.columns, tile.rows) != (tile_width + 1, tile_length + 1) {
            bail!(
                "The elevation tile {address} has {}x{} samples instead of {}x{}.",
                tile.columns,
                tile.rows,
                tile_width + 1,
                tile_length + 1
            );
        }

        let samples = tile
            .data
            .as_float()
            .ok_or_else(|| anyhow!("The elevation tile {address} does not contain float samples."))?;

        let pixel_size = self.geometry.pixel_size(address.level());
        let mesh = MeshData::new(
            samples,
            tile_width,
            tile_length,
            pixel_size.x,
            pixel_size.y,
            self.fill_value(),
            self.surface_color,
            self.missing_color,
        );

        let textures = if mesh.is_empty() {
            vec![None; self.layers.len()]
        } else {
            self.layers
                .iter()
                .map(|layer| self.load_texture(layer, address))
                .collect()
        };

        Ok(TileContent { mesh, textures })
    }

    fn load_texture(&self, layer: &PyramidReader, address: &TileAddress) -> Option<TileTexture> {
        match layer.read(address) {
            Ok(tile) => tile.map(|tile| TileTexture {
                kind: layer.kind(),
                tile,
            }),
            Err(error) => {
                warn!(
                    "Failed to read the texture tile {address} of {:?}: {error}",
                    layer.directory()
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pyramid::{
        raster::{RasterBuildOptions, RasterPyramidBuilder, RasterSamples},
        test::temp_directory,
    };
    use ndarray::Array2;
    use std::fs;

    fn build(directory: &Path, kind: LayerKind) {
        let mut source = match kind {
            LayerKind::ColorImage => {
                RasterSamples::Rgba(Array2::from_elem((32, 32), 0x20406080))
            }
            _ => RasterSamples::Float(Array2::from_shape_fn((32, 32), |(row, column)| {
                (row + column) as f32
            })),
        };

        RasterPyramidBuilder::new(
            directory,
            RasterBuildOptions {
                tile_size: 8,
                layer_kind: kind,
                ..Default::default()
            },
        )
        .build(&mut source)
        .unwrap();
    }

    #[test]
    fn geometry_of_a_pyramid() {
        let mut properties = LayerProperties::new(LayerKind::Elevation, 8, 8);
        properties.number_of_tiles = 4;
        properties.number_of_levels = 3;

        let geometry = TerrainGeometry::new(&properties, DVec2::new(2.0, 1.0));

        assert_eq!(geometry.extent(), DVec2::new(64.0, 32.0));
        assert_eq!(geometry.pixel_size(0), DVec2::new(8.0, 4.0));
        assert_eq!(geometry.pixel_size(2), DVec2::new(2.0, 1.0));
        assert_eq!(geometry.node_size(1), DVec2::new(32.0, 16.0));
        assert!(geometry.has_children(1));
        assert!(!geometry.has_children(2));
        assert_eq!(geometry.node_bytes(10), (8 * 8 * 14 + 32) * 4 + 10);
    }

    #[test]
    fn loads_meshes_and_textures() {
        let elevation = temp_directory("loader_elevation");
        let color = temp_directory("loader_color");
        build(&elevation, LayerKind::Elevation);
        build(&color, LayerKind::ColorImage);

        let loader = TileLoader::new(
            PyramidReader::open(&elevation).unwrap(),
            vec![PyramidReader::open(&color).unwrap()],
            DVec2::ONE,
            [1.0; 4],
            [1.0, 0.0, 0.0, 1.0],
        )
        .unwrap();

        let address: TileAddress = "/1/4".parse().unwrap();
        let content = loader.load(&address).unwrap();

        assert!(!content.is_no_data());
        assert_eq!(content.mesh.columns(), 9);
        assert_eq!(content.mesh.pixel_width(), 1.0);

        // the tile starts at column 8 and row 8 of the raster
        assert_eq!(content.mesh.elevation(0, 0), 16.0);
        assert_eq!(content.mesh.elevation(8, 8), 32.0);

        let texture = content.textures[0].as_ref().unwrap();
        assert_eq!(texture.kind, LayerKind::ColorImage);

        let image = texture.to_image();
        assert_eq!(image.texture_descriptor.format, TextureFormat::Rgba8Unorm);
        assert_eq!(image.width(), texture.tile.columns);
        assert_eq!(image.data[..4], [0x20, 0x40, 0x60, 0x80]);

        fs::remove_dir_all(elevation).unwrap();
        fs::remove_dir_all(color).unwrap();
    }

    #[test]
    fn missing_tiles_yield_no_data() {
        let elevation = temp_directory("loader_missing");
        build(&elevation, LayerKind::Elevation);

        let address: TileAddress = "/2/3".parse().unwrap();
        fs::remove_file(address.path(&elevation, TILE_EXTENSION)).unwrap();

        let loader = TileLoader::new(
            PyramidReader::open(&elevation).unwrap(),
            Vec::new(),
            DVec2::ONE,
            [1.0; 4],
            [1.0, 0.0, 0.0, 1.0],
        )
        .unwrap();

        let content = loader.load(&address).unwrap();
        assert!(content.is_no_data());
        assert_eq!(content.mesh.pixel_width(), 1.0);

        fs::remove_dir_all(elevation).unwrap();
    }

    #[test]
    fn rejects_texture_pyramids_as_elevation() {
        let color = temp_directory("loader_wrong_kind");
        build(&color, LayerKind::ColorImage);

        let result = TileLoader::new(
            PyramidReader::open(&color).unwrap(),
            Vec::new(),
            DVec2::ONE,
            [1.0; 4],
            [1.0; 4],
        );
        assert!(result.is_err());

        fs::remove_dir_all(color).unwrap();
    }
}
