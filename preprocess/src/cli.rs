use bevy_terrain_pyramid::pyramid::{raster::Margins, LayerKind};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "btpp", author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Builds a tile pyramid from a TIFF raster.
    Raster(RasterArgs),
    /// Prints the properties of a pyramid layer.
    Info {
        #[arg(required = true)]
        layer_path: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
pub struct RasterArgs {
    #[arg(required = true)]
    pub src_path: PathBuf,
    #[arg(required = true)]
    pub layer_path: PathBuf,

    #[arg(short, long = "tile-size", default_value_t = 128)]
    pub tile_size: u32,
    /// One of elevation, field, colorimage or grayimage.
    #[arg(short, long, default_value = "elevation")]
    pub kind: String,
    /// Overlap with adjacent rasters in samples, as left right top bottom.
    #[arg(long, num_args = 4, value_names = ["LEFT", "RIGHT", "TOP", "BOTTOM"])]
    pub margins: Option<Vec<u32>>,
    /// Overrides the no data value of the source.
    #[arg(long = "missing-value")]
    pub missing_value: Option<f64>,
    #[arg(short, long, default_value_t = false)]
    pub overwrite: bool,
}

impl RasterArgs {
    pub fn layer_kind(&self) -> anyhow::Result<LayerKind> {
        Ok(self.kind.parse()?)
    }

    pub fn margins(&self) -> Option<Margins> {
        match self.margins.as_deref() {
            Some(&[left, right, top, bottom]) => Some(Margins {
                left,
                right,
                top,
                bottom,
            }),
            _ => None,
        }
    }
}

pub(crate) struct PreprocessBar {
    name: String,
    bar: ProgressBar,
}

impl PreprocessBar {
    pub(crate) fn new(name: String) -> anyhow::Result<Self> {
        let bar = ProgressBar::new(1).with_style(ProgressStyle::with_template(
            &(name.clone() + " tiles: {wide_bar} {pos}/{len} [{elapsed}/{duration}]"),
        )?);

        Ok(Self { name, bar })
    }

    pub(crate) fn callback(&self) -> impl Fn(usize, usize) + Send + Sync + 'static + use<> {
        let progress_bar = self.bar.clone();

        move |written, total| {
            progress_bar.set_length(total as u64);
            progress_bar.set_position(written as u64);
        }
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
        println!("{} took: {:?}", self.name, self.bar.elapsed());
    }
}
