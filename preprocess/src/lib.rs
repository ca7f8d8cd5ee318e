mod cli;

use crate::cli::{Command, PreprocessBar, RasterArgs};
use anyhow::Context;
use bevy_terrain_pyramid::{
    prelude::*,
    pyramid::{clear_directory, read_layer_properties},
};
use std::{path::Path, time::Instant};

pub mod prelude {
    pub use crate::{
        cli::{Cli, Command, RasterArgs},
        preprocess, print_info,
    };
}

pub fn run(cli: cli::Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Raster(args) => preprocess(&args).map(|_| ()),
        Command::Info { layer_path } => print_info(&layer_path),
    }
}

/// Builds the pyramid described by `args` and returns the properties of the new layer.
pub fn preprocess(args: &RasterArgs) -> anyhow::Result<LayerProperties> {
    let layer_kind = args.layer_kind()?;

    if args.overwrite {
        clear_directory(&args.layer_path)?;
    }

    let start_preprocessing = Instant::now();

    let mut source = TiffSource::open(&args.src_path)
        .with_context(|| format!("Could not open {}", args.src_path.display()))?;
    if layer_kind == LayerKind::GrayImage {
        source = source.with_gray_bytes();
    }

    let options = RasterBuildOptions {
        tile_size: args.tile_size,
        layer_kind,
        margins: args.margins(),
        missing_value: args.missing_value,
        source: args
            .src_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
    };

    let progress_bar = PreprocessBar::new("Writing".to_string())?;
    let builder =
        RasterPyramidBuilder::new(&args.layer_path, options).with_progress(progress_bar.callback());
    let properties = builder.build(&mut source)?;
    progress_bar.finish();

    println!("Preprocessing took: {:?}", start_preprocessing.elapsed());

    Ok(properties)
}

pub fn print_info(layer_path: &Path) -> anyhow::Result<()> {
    let properties = read_layer_properties(layer_path)
        .with_context(|| format!("Could not read the layer at {}", layer_path.display()))?;

    print!("{}", properties.to_text());

    Ok(())
}
