//! Building of on disk tile pyramids.
//!
//! A pyramid stores one layer of a terrain at multiple resolutions.
//! Level zero consists of a single tile covering the whole terrain and each following level
//! doubles the resolution, until the finest level matches the resolution of the source data.
//! Every tile has a border of one sample on its right and bottom side, which it shares with
//! its neighbours, so that adjacent meshes and textures can be joined without seams.
//!
//! Tiles are stored as PNG images at `<layer>/<q1>/<q2>/.../0.png`, where each digit is a
//! [`Quadrant`](crate::math::Quadrant) of the [`TileAddress`] of the tile.
//! The metadata of the layer is stored next to them in [`LayerProperties::FILE_NAME`].

pub mod down_sample;
pub mod raster;
pub mod result;
pub mod vector;

pub use crate::pyramid::result::{PyramidError, PyramidResult};

use crate::{formats::LayerProperties, math::TileAddress};
use derive_more::Display;
use image::{DynamicImage, GrayImage, ImageFormat, RgbaImage};
use itertools::Itertools;
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

pub const TILE_EXTENSION: &str = "png";

/// How the samples of a layer are stored.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SampleEncoding {
    /// One 32 bit float per sample, `NaN` marks missing data.
    Float,
    /// One packed `0xRRGGBBAA` color per sample, zero marks missing data.
    Rgba,
    /// One byte per sample, zero marks missing data.
    Gray,
    /// The layer is derived at runtime and has no stored samples.
    None,
}

/// The kind of a terrain layer.
///
/// All behaviour that depends on the kind of layer is looked up through this type.
#[derive(Copy, Clone, Debug, Display, Hash, Eq, PartialEq)]
pub enum LayerKind {
    #[display("elevation")]
    Elevation,
    #[display("field")]
    Field,
    #[display("colorimage")]
    ColorImage,
    #[display("grayimage")]
    GrayImage,
    #[display("derivative")]
    Derivative,
    #[display("footprint")]
    Footprint,
    #[display("viewshed")]
    Viewshed,
    #[display("none")]
    None,
}

struct LayerKindInfo {
    encoding: SampleEncoding,
    buildable: bool,
}

impl LayerKind {
    pub const ALL: [LayerKind; 8] = [
        LayerKind::Elevation,
        LayerKind::Field,
        LayerKind::ColorImage,
        LayerKind::GrayImage,
        LayerKind::Derivative,
        LayerKind::Footprint,
        LayerKind::Viewshed,
        LayerKind::None,
    ];

    const fn info(self) -> LayerKindInfo {
        let (encoding, buildable) = match self {
            LayerKind::Elevation | LayerKind::Field => (SampleEncoding::Float, true),
            LayerKind::ColorImage => (SampleEncoding::Rgba, true),
            LayerKind::GrayImage => (SampleEncoding::Gray, true),
            LayerKind::Derivative
            | LayerKind::Footprint
            | LayerKind::Viewshed
            | LayerKind::None => (SampleEncoding::None, false),
        };

        LayerKindInfo {
            encoding,
            buildable,
        }
    }

    pub fn encoding(self) -> SampleEncoding {
        self.info().encoding
    }

    /// Whether a pyramid can be built from source samples for this kind of layer.
    pub fn can_build_pyramid(self) -> bool {
        self.info().buildable
    }

    pub fn is_float(self) -> bool {
        self.encoding() == SampleEncoding::Float
    }

    /// Image layers keep an extra sample of padding on their left and top side,
    /// which allows bilinear filtering across tile borders.
    pub fn is_image(self) -> bool {
        matches!(self.encoding(), SampleEncoding::Rgba | SampleEncoding::Gray)
    }

    pub fn bytes_per_sample(self) -> usize {
        match self.encoding() {
            SampleEncoding::Float | SampleEncoding::Rgba => 4,
            SampleEncoding::Gray => 1,
            SampleEncoding::None => 0,
        }
    }

    /// The value that padding and missing samples are filled with.
    pub fn fill_value(self) -> f32 {
        if self.is_float() {
            f32::NAN
        } else {
            0.0
        }
    }

    /// Whether the tile contains no valid sample at all.
    pub fn is_empty(self, data: &TileData) -> bool {
        match (self.encoding(), data) {
            (SampleEncoding::Float, TileData::Float(samples)) => samples.iter().all(|s| s.is_nan()),
            (SampleEncoding::Rgba, TileData::Rgba(samples)) => samples.iter().all(|&s| s == 0),
            (SampleEncoding::Gray, TileData::Gray(samples)) => samples.iter().all(|&s| s == 0),
            _ => false,
        }
    }

    pub fn encode(self, tile: &Tile) -> PyramidResult<DynamicImage> {
        let (width, height) = (tile.columns, tile.rows);

        let image = match (self.encoding(), &tile.data) {
            (SampleEncoding::Float, TileData::Float(samples)) => {
                let bytes = samples.iter().flat_map(|s| s.to_le_bytes()).collect_vec();
                RgbaImage::from_raw(width, height, bytes).map(DynamicImage::from)
            }
            (SampleEncoding::Rgba, TileData::Rgba(samples)) => {
                let bytes = samples.iter().flat_map(|s| s.to_be_bytes()).collect_vec();
                RgbaImage::from_raw(width, height, bytes).map(DynamicImage::from)
            }
            (SampleEncoding::Gray, TileData::Gray(samples)) => {
                GrayImage::from_raw(width, height, samples.clone()).map(DynamicImage::from)
            }
            _ => None,
        };

        image.ok_or(PyramidError::TileMismatch(self))
    }

    pub fn decode(self, image: DynamicImage) -> PyramidResult<Tile> {
        let (columns, rows) = (image.width(), image.height());

        let data = match self.encoding() {
            SampleEncoding::Float => TileData::Float(
                image
                    .into_rgba8()
                    .into_raw()
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            ),
            SampleEncoding::Rgba => TileData::Rgba(
                image
                    .into_rgba8()
                    .into_raw()
                    .chunks_exact(4)
                    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            ),
            SampleEncoding::Gray => TileData::Gray(image.into_luma8().into_raw()),
            SampleEncoding::None => return Err(PyramidError::TileMismatch(self)),
        };

        Ok(Tile {
            columns,
            rows,
            data,
        })
    }
}

impl FromStr for LayerKind {
    type Err = PyramidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LayerKind::ALL
            .into_iter()
            .find(|kind| kind.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PyramidError::Metadata(format!("unknown layer type `{s}`")))
    }
}

/// The typed samples of a tile.
#[derive(Clone, Debug, PartialEq)]
pub enum TileData {
    Float(Vec<f32>),
    Rgba(Vec<u32>),
    Gray(Vec<u8>),
}

impl TileData {
    pub fn len(&self) -> usize {
        match self {
            TileData::Float(samples) => samples.len(),
            TileData::Rgba(samples) => samples.len(),
            TileData::Gray(samples) => samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_float(&self) -> Option<&[f32]> {
        match self {
            TileData::Float(samples) => Some(samples),
            _ => None,
        }
    }

    pub fn byte_size(&self) -> usize {
        match self {
            TileData::Float(samples) => samples.len() * 4,
            TileData::Rgba(samples) => samples.len() * 4,
            TileData::Gray(samples) => samples.len(),
        }
    }
}

/// A tile of `columns` by `rows` samples, stored row by row starting at the top left.
#[derive(Clone, Debug, PartialEq)]
pub struct Tile {
    pub columns: u32,
    pub rows: u32,
    pub data: TileData,
}

impl Tile {
    pub fn float(columns: u32, rows: u32, samples: Vec<f32>) -> Self {
        Self {
            columns,
            rows,
            data: TileData::Float(samples),
        }
    }

    pub fn sample_f32(&self, column: u32, row: u32) -> Option<f32> {
        let index = (row * self.columns + column) as usize;
        self.data.as_float()?.get(index).copied()
    }
}

/// A flag that cooperatively cancels a running pyramid build.
///
/// Builders check it before every tile, so a cancelled build stops after the tile that is
/// currently written and leaves everything written so far on disk.
#[derive(Clone, Default, Debug)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> PyramidResult<()> {
        if self.is_cancelled() {
            Err(PyramidError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The file of the tile at `column` and `row` of a level with `tiles_per_side` tiles.
pub fn tile_path(
    directory: &Path,
    column: u32,
    row: u32,
    tiles_per_side: u32,
    level: u32,
) -> PathBuf {
    TileAddress::from_grid(column, row, tiles_per_side, level).path(directory, TILE_EXTENSION)
}

/// Writes the tile to `path`, creating the parent directories as needed.
/// Tiles without any valid sample are written as zero length placeholder files.
pub fn write_tile(path: &Path, kind: LayerKind, tile: &Tile) -> PyramidResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    if kind.is_empty(&tile.data) {
        fs::File::create(path)?;
    } else {
        kind.encode(tile)?.save_with_format(path, ImageFormat::Png)?;
    }

    Ok(())
}

/// Reads the tile at `path`. Placeholder files of empty tiles yield [`None`].
pub fn read_tile(path: &Path, kind: LayerKind) -> PyramidResult<Option<Tile>> {
    if fs::metadata(path)?.len() == 0 {
        return Ok(None);
    }

    let image = image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?;

    kind.decode(image).map(Some)
}

/// Reads the metadata of the layer stored in `directory`.
pub fn read_layer_properties(directory: &Path) -> PyramidResult<LayerProperties> {
    LayerProperties::load_file(directory.join(LayerProperties::FILE_NAME))
}

/// Removes the contents of the directory, creating it if necessary.
pub fn clear_directory(directory: &Path) -> PyramidResult<()> {
    if directory.exists() {
        fs::remove_dir_all(directory)?;
    }
    fs::create_dir_all(directory)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::{
        env,
        sync::atomic::{AtomicUsize, Ordering},
    };

    /// A fresh directory below the system temp directory.
    pub(crate) fn temp_directory(name: &str) -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        let directory = env::temp_dir().join(format!(
            "bevy_terrain_pyramid_{name}_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        clear_directory(&directory).unwrap();
        directory
    }

    #[test]
    fn layer_kind_names_round_trip() {
        for kind in LayerKind::ALL {
            assert_eq!(kind.to_string().parse::<LayerKind>().unwrap(), kind);
        }

        assert_eq!("ColorImage".parse::<LayerKind>().unwrap(), LayerKind::ColorImage);
        assert!("terrain".parse::<LayerKind>().is_err());
    }

    #[test]
    fn emptiness_per_kind() {
        let nan = TileData::Float(vec![f32::NAN; 4]);
        let partial = TileData::Float(vec![f32::NAN, 1.0, f32::NAN, f32::NAN]);

        assert!(LayerKind::Elevation.is_empty(&nan));
        assert!(LayerKind::Field.is_empty(&nan));
        assert!(!LayerKind::Elevation.is_empty(&partial));
        assert!(LayerKind::ColorImage.is_empty(&TileData::Rgba(vec![0; 4])));
        assert!(!LayerKind::ColorImage.is_empty(&TileData::Rgba(vec![0, 0xff, 0, 0])));
        assert!(LayerKind::GrayImage.is_empty(&TileData::Gray(vec![0; 4])));
        assert!(!LayerKind::GrayImage.is_empty(&TileData::Gray(vec![0, 3])));
        assert!(!LayerKind::Elevation.is_empty(&TileData::Gray(vec![0; 4])));
    }

    #[test]
    fn sample_sizes() {
        assert_eq!(LayerKind::Elevation.bytes_per_sample(), 4);
        assert_eq!(LayerKind::ColorImage.bytes_per_sample(), 4);
        assert_eq!(LayerKind::GrayImage.bytes_per_sample(), 1);
        assert_eq!(LayerKind::Viewshed.bytes_per_sample(), 0);
        assert!(LayerKind::Elevation.fill_value().is_nan());
        assert_eq!(LayerKind::GrayImage.fill_value(), 0.0);
        assert!(!LayerKind::Derivative.can_build_pyramid());
    }

    #[test]
    fn tiles_survive_the_disk() {
        let directory = temp_directory("tiles");

        let elevation = Tile::float(3, 2, vec![1.5, -2.0, f32::NAN, 1.0e6, 0.0, 7.25]);
        let color = Tile {
            columns: 2,
            rows: 1,
            data: TileData::Rgba(vec![0x11223344, 0xff00ffff]),
        };
        let gray = Tile {
            columns: 2,
            rows: 2,
            data: TileData::Gray(vec![0, 1, 128, 255]),
        };

        let path = directory.join("elevation.png");
        write_tile(&path, LayerKind::Elevation, &elevation).unwrap();
        let read = read_tile(&path, LayerKind::Elevation).unwrap().unwrap();
        let samples = read.data.as_float().unwrap();
        assert_eq!(samples[0], 1.5);
        assert!(samples[2].is_nan());
        assert_eq!(samples[3], 1.0e6);

        let path = directory.join("color.png");
        write_tile(&path, LayerKind::ColorImage, &color).unwrap();
        assert_eq!(read_tile(&path, LayerKind::ColorImage).unwrap(), Some(color));

        let path = directory.join("a/b/gray.png");
        write_tile(&path, LayerKind::GrayImage, &gray).unwrap();
        assert_eq!(read_tile(&path, LayerKind::GrayImage).unwrap(), Some(gray));

        fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn empty_tiles_are_placeholders() {
        let directory = temp_directory("placeholder");
        let path = tile_path(&directory, 1, 1, 2, 1);

        write_tile(&path, LayerKind::Elevation, &Tile::float(2, 1, vec![f32::NAN; 2])).unwrap();

        assert_eq!(path, directory.join("4").join("0.png"));
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert_eq!(read_tile(&path, LayerKind::Elevation).unwrap(), None);

        fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn tile_paths_are_unique() {
        let directory = Path::new("layer");
        let paths = (0..4)
            .cartesian_product(0..4)
            .map(|(column, row)| tile_path(directory, column, row, 4, 2))
            .collect_vec();

        assert_eq!(paths.iter().unique().count(), 16);
        assert_eq!(tile_path(directory, 0, 0, 1, 0), directory.join("0.png"));
    }

    #[test]
    fn cancellation() {
        let token = CancellationToken::new();
        let clone = token.clone();

        assert!(token.check().is_ok());
        clone.cancel();
        assert!(matches!(token.check(), Err(PyramidError::Cancelled)));
    }
}
