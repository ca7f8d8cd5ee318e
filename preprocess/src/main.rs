use bevy_terrain_pyramid_preprocess::{prelude::*, run};
use clap::Parser;

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    run(args)
}
