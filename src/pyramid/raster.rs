use crate::{
    formats::LayerProperties,
    pyramid::{
        down_sample::{mean_float, mean_gray, mean_rgba},
        tile_path, write_tile, CancellationToken, LayerKind, PyramidError, PyramidResult, Tile,
        TileData,
    },
};
use bevy::log::info;
use itertools::{iproduct, Itertools};
use ndarray::{s, Array2};
use rayon::prelude::*;
use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

/// The samples of a raster, stored row by row starting at the top left.
#[derive(Clone, Debug)]
pub enum RasterSamples {
    Float(Array2<f32>),
    /// Colors packed as `0xRRGGBBAA`.
    Rgba(Array2<u32>),
    Gray(Array2<u8>),
}

impl RasterSamples {
    /// Width and length of the raster.
    pub fn dimensions(&self) -> (u32, u32) {
        let (rows, columns) = match self {
            RasterSamples::Float(samples) => samples.dim(),
            RasterSamples::Rgba(samples) => samples.dim(),
            RasterSamples::Gray(samples) => samples.dim(),
        };

        (columns as u32, rows as u32)
    }
}

/// A source of raster samples, such as a decoded image file.
pub trait SampleSource {
    /// Width and length of the raster in samples.
    fn dimensions(&self) -> (u32, u32);

    fn samples_per_pixel(&self) -> u32;

    /// Sentinel marking missing samples in the source data.
    fn missing_value(&self) -> Option<f64> {
        None
    }

    fn read(&mut self) -> PyramidResult<RasterSamples>;
}

impl SampleSource for RasterSamples {
    fn dimensions(&self) -> (u32, u32) {
        RasterSamples::dimensions(self)
    }

    fn samples_per_pixel(&self) -> u32 {
        match self {
            RasterSamples::Rgba(_) => 4,
            _ => 1,
        }
    }

    fn read(&mut self) -> PyramidResult<RasterSamples> {
        Ok(self.clone())
    }
}

/// Margins of a raster that overlaps adjacent rasters, in samples.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Margins {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

/// How a raster is laid out inside the padded, power of two sized pyramid raster.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PyramidDimensions {
    pub tile_width: u32,
    pub tile_length: u32,
    /// Tiles per side at the finest level.
    pub tiles_per_side: u32,
    pub number_of_levels: u32,
    /// Width of the padded raster, including the insets.
    pub padded_width: u32,
    pub padded_length: u32,
    /// Offset of the pyramid grid inside the padded raster.
    pub left_inset: u32,
    pub top_inset: u32,
    /// Offset of the source raster inside the padded raster.
    pub left_margin: u32,
    pub top_margin: u32,
}

impl PyramidDimensions {
    pub fn new(
        raster_width: u32,
        raster_length: u32,
        tile_size: u32,
        kind: LayerKind,
        margins: Option<Margins>,
    ) -> PyramidResult<Self> {
        let too_large = || PyramidError::RasterTooLarge {
            width: raster_width,
            length: raster_length,
        };
        let total =
            |size: u32, before: u32, after: u32| size.checked_add(before)?.checked_add(after);
        let padded = |size: u32, before: u32, after: u32| {
            total(size, before, after)?.checked_next_power_of_two()
        };

        let (padded_width, padded_length) = match margins {
            None => (padded(raster_width, 0, 0), padded(raster_length, 0, 0)),
            Some(margins) => (
                padded(raster_width, margins.left, margins.right).map(|size| size / 2),
                padded(raster_length, margins.top, margins.bottom).map(|size| size / 2),
            ),
        };
        let (Some(padded_width), Some(padded_length)) = (padded_width, padded_length) else {
            return Err(too_large());
        };

        // the requested tile size is used for the longer side of the tile
        let (tile_width, tile_length) = if padded_length > padded_width
            || (margins.is_some() && padded_length == padded_width)
        {
            let scaled = tile_size as f64 * padded_width as f64 / padded_length as f64;
            ((scaled as u32).max(1), tile_size)
        } else {
            let scaled = tile_size as f64 * padded_length as f64 / padded_width as f64;
            (tile_size, (scaled as u32).max(1))
        };

        if tile_width > padded_width {
            return Err(PyramidError::TileTooLarge {
                tile: tile_width,
                padded: padded_width,
            });
        }
        if tile_length > padded_length {
            return Err(PyramidError::TileTooLarge {
                tile: tile_length,
                padded: padded_length,
            });
        }

        // image layers get one extra tile step of padding on their left and top side
        let (left_inset, right_inset, top_inset, bottom_inset) = if kind.is_image() {
            let left = padded_width / tile_width;
            let top = padded_length / tile_length;
            (left, 2 * left, top, 2 * top)
        } else {
            (0, padded_width / tile_width, 0, padded_length / tile_length)
        };

        let (left_margin, top_margin) = match margins {
            None => (
                left_inset + (padded_width - raster_width) / 2,
                top_inset + (padded_length - raster_length) / 2,
            ),
            Some(margins) => (margins.left, margins.top),
        };

        let tiles_per_side = padded_width / tile_width;

        Ok(Self {
            tile_width,
            tile_length,
            tiles_per_side,
            number_of_levels: tiles_per_side.ilog2() + 1,
            padded_width: total(padded_width, left_inset, right_inset).ok_or_else(too_large)?,
            padded_length: total(padded_length, top_inset, bottom_inset).ok_or_else(too_large)?,
            left_inset,
            top_inset,
            left_margin,
            top_margin,
        })
    }

    pub fn max_level(&self) -> u32 {
        self.number_of_levels - 1
    }

    /// Tiles per side at `level`.
    pub fn tiles_at_level(&self, level: u32) -> u32 {
        self.tiles_per_side >> (self.max_level() - level)
    }

    /// Side length of the box filter at `level`.
    pub fn kernel_at_level(&self, level: u32) -> u32 {
        1 << (self.max_level() - level)
    }
}

/// The source raster copied into a padded, power of two sized raster.
enum PaddedRaster {
    Float(Array2<f32>),
    Rgba(Array2<u32>),
    Gray(Array2<u8>),
}

impl PaddedRaster {
    fn new(
        samples: RasterSamples,
        kind: LayerKind,
        dimensions: &PyramidDimensions,
        missing_value: Option<f64>,
    ) -> PyramidResult<Self> {
        let shape = (
            dimensions.padded_length as usize,
            dimensions.padded_width as usize,
        );
        let (top, left) = (
            dimensions.top_margin as usize,
            dimensions.left_margin as usize,
        );

        let (width, length) = samples.dimensions();
        let (width, length) = (
            (width as usize).min(shape.1.saturating_sub(left)),
            (length as usize).min(shape.0.saturating_sub(top)),
        );
        let target = s![top..top + length, left..left + width];
        let source = s![0..length, 0..width];

        let padded = match (kind, samples) {
            (LayerKind::Elevation | LayerKind::Field, RasterSamples::Float(samples)) => {
                let mut padded = Array2::from_elem(shape, f32::NAN);
                padded.slice_mut(target).assign(&samples.slice(source));

                if let Some(missing) = missing_value {
                    padded.mapv_inplace(|sample| {
                        if sample as f64 == missing {
                            f32::NAN
                        } else {
                            sample
                        }
                    });
                }

                PaddedRaster::Float(padded)
            }
            (LayerKind::ColorImage, RasterSamples::Rgba(samples)) => {
                let mut padded = Array2::zeros(shape);
                padded.slice_mut(target).assign(&samples.slice(source));
                PaddedRaster::Rgba(padded)
            }
            (LayerKind::ColorImage, RasterSamples::Gray(samples)) => {
                let mut padded = Array2::zeros(shape);
                padded
                    .slice_mut(target)
                    .assign(&samples.slice(source).mapv(|gray| {
                        u32::from_be_bytes([gray, gray, gray, u8::MAX])
                    }));
                PaddedRaster::Rgba(padded)
            }
            (LayerKind::GrayImage, RasterSamples::Gray(samples)) => {
                let mut padded = Array2::zeros(shape);
                padded.slice_mut(target).assign(&samples.slice(source));
                PaddedRaster::Gray(padded)
            }
            (kind, _) => return Err(PyramidError::TileMismatch(kind)),
        };

        Ok(padded)
    }

    /// Per band minimum and maximum of all valid samples.
    fn range(&self) -> (Vec<f64>, Vec<f64>) {
        match self {
            PaddedRaster::Float(samples) => {
                let (min, max) = samples
                    .iter()
                    .filter(|sample| !sample.is_nan())
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), &sample| {
                        (min.min(sample as f64), max.max(sample as f64))
                    });

                if min > max {
                    (vec![0.0], vec![0.0])
                } else {
                    (vec![min], vec![max])
                }
            }
            PaddedRaster::Rgba(samples) => {
                let mut min = [u8::MAX; 4];
                let mut max = [u8::MIN; 4];

                for color in samples.iter().filter(|&&color| color != 0) {
                    for (band, byte) in color.to_be_bytes().into_iter().enumerate() {
                        min[band] = min[band].min(byte);
                        max[band] = max[band].max(byte);
                    }
                }

                if samples.iter().all(|&color| color == 0) {
                    (vec![0.0; 4], vec![0.0; 4])
                } else {
                    (
                        min.map(f64::from).to_vec(),
                        max.map(f64::from).to_vec(),
                    )
                }
            }
            PaddedRaster::Gray(samples) => {
                let valid = samples.iter().filter(|&&gray| gray != 0);
                match valid.minmax().into_option() {
                    Some((&min, &max)) => (vec![min as f64], vec![max as f64]),
                    None => (vec![0.0], vec![0.0]),
                }
            }
        }
    }

    fn tile(
        &self,
        top: usize,
        left: usize,
        columns: u32,
        rows: u32,
        kernel: usize,
    ) -> Tile {
        let (c, r) = (columns as usize, rows as usize);

        let data = match self {
            PaddedRaster::Float(samples) => {
                TileData::Float(mean_float(samples.view(), top, left, c, r, kernel))
            }
            PaddedRaster::Rgba(samples) => {
                TileData::Rgba(mean_rgba(samples.view(), top, left, c, r, kernel))
            }
            PaddedRaster::Gray(samples) => {
                TileData::Gray(mean_gray(samples.view(), top, left, c, r, kernel))
            }
        };

        Tile {
            columns,
            rows,
            data,
        }
    }
}

/// The configuration of a [`RasterPyramidBuilder`].
#[derive(Clone, Debug)]
pub struct RasterBuildOptions {
    /// Requested size of the longer side of a tile.
    pub tile_size: u32,
    pub layer_kind: LayerKind,
    pub margins: Option<Margins>,
    /// Overrides the missing value sentinel of the source.
    pub missing_value: Option<f64>,
    /// Name of the source, stored in the layer properties.
    pub source: Option<String>,
}

impl Default for RasterBuildOptions {
    fn default() -> Self {
        Self {
            tile_size: 128,
            layer_kind: LayerKind::Elevation,
            margins: None,
            missing_value: None,
            source: None,
        }
    }
}

type ProgressCallback = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Builds a tile pyramid from a single raster.
///
/// The raster is centered inside a padded raster whose size is a power of two.
/// The finest level is sliced directly from it, while every coarser level box filters
/// the padded raster with twice the kernel size of the previous one.
/// All tiles of one level are written in parallel.
pub struct RasterPyramidBuilder {
    directory: PathBuf,
    options: RasterBuildOptions,
    cancellation: CancellationToken,
    progress: Option<ProgressCallback>,
}

impl RasterPyramidBuilder {
    pub fn new(directory: impl Into<PathBuf>, options: RasterBuildOptions) -> Self {
        Self {
            directory: directory.into(),
            options,
            cancellation: CancellationToken::new(),
            progress: None,
        }
    }

    /// Registers a callback receiving the number of written tiles and the total tile count.
    pub fn with_progress(mut self, progress: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
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

    pub fn build(&self, source: &mut impl SampleSource) -> PyramidResult<LayerProperties> {
        let kind = self.options.layer_kind;
        let samples_per_pixel = source.samples_per_pixel();

        if !kind.can_build_pyramid() {
            return Err(PyramidError::UnsupportedLayerKind(kind));
        }
        if samples_per_pixel > 1 && kind != LayerKind::ColorImage {
            return Err(PyramidError::UnsupportedSamples {
                kind,
                samples: samples_per_pixel,
            });
        }

        let (raster_width, raster_length) = source.dimensions();
        let dimensions = PyramidDimensions::new(
            raster_width,
            raster_length,
            self.options.tile_size,
            kind,
            self.options.margins,
        )?;

        self.cancellation.check()?;

        info!(
            "Padding {raster_width} x {raster_length} raster to {} x {}.",
            dimensions.padded_width, dimensions.padded_length
        );

        let missing_value = self.options.missing_value.or(source.missing_value());
        let raster = PaddedRaster::new(source.read()?, kind, &dimensions, missing_value)?;

        let (minimum_value, maximum_value) = raster.range();
        let edge_fill_value = (kind == LayerKind::Elevation).then(|| minimum_value[0] as f32);

        let total = (0..dimensions.number_of_levels)
            .map(|level| (dimensions.tiles_at_level(level) as usize).pow(2))
            .sum::<usize>();
        let written = AtomicUsize::new(0);

        for level in (0..dimensions.number_of_levels).rev() {
            self.cancellation.check()?;

            let tiles = dimensions.tiles_at_level(level);
            let kernel = dimensions.kernel_at_level(level);
            let column_step = (dimensions.tile_width * kernel) as usize;
            let row_step = (dimensions.tile_length * kernel) as usize;

            info!(
                "Writing {tiles} x {tiles} tiles of level {} of {}.",
                level + 1,
                dimensions.number_of_levels
            );

            iproduct!(0..tiles, 0..tiles)
                .collect_vec()
                .into_par_iter()
                .try_for_each(|(row, column)| {
                    self.cancellation.check()?;

                    let tile = raster.tile(
                        dimensions.top_inset as usize + row as usize * row_step,
                        dimensions.left_inset as usize + column as usize * column_step,
                        dimensions.tile_width + 1,
                        dimensions.tile_length + 1,
                        kernel as usize,
                    );

                    let path = tile_path(&self.directory, column, row, tiles, level);
                    write_tile(&path, kind, &tile)?;

                    let count = written.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Some(progress) = &self.progress {
                        progress(count, total);
                    }

                    Ok::<_, PyramidError>(())
                })?;
        }

        let properties = LayerProperties {
            number_of_levels: dimensions.number_of_levels,
            number_of_tiles: dimensions.tiles_per_side,
            minimum_value,
            maximum_value,
            edge_fill_value,
            source: self.options.source.clone(),
            ..LayerProperties::new(kind, dimensions.tile_width, dimensions.tile_length)
        };

        properties.save_file(self.directory.join(LayerProperties::FILE_NAME))?;

        info!("Finished building the {kind} pyramid in {:?}.", self.directory);

        Ok(properties)
    }
}
