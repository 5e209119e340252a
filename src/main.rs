use clap::Parser;
use env_logger::Env;
use log::{info, warn};

use raster_mosaic::cli::Args;
use raster_mosaic::cog::WriteOptions;
use raster_mosaic::error::{MosaicError, Result};
use raster_mosaic::io;
use raster_mosaic::mosaic::{MergeRule, TieBreak};
use raster_mosaic::pipeline::{self, PipelineConfig};
use raster_mosaic::resample::PixelSize;

/// Pipeline file settings with command-line overrides applied.
fn build_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };

    let mosaic = &mut config.mosaic;
    if let Some(rule) = args.rule {
        mosaic.policy.rule = MergeRule::from(rule);
    }
    if args.last_wins {
        mosaic.policy.tie_break = TieBreak::LastWins;
    }
    if let Some(nodata) = args.nodata {
        mosaic.policy.nodata = Some(nodata);
    }
    if let Some(resolution) = args.resolution {
        let size = PixelSize::square(resolution);
        size.validate()?;
        mosaic.resolution = Some(size);
    }
    if let Some(kernel) = args.kernel {
        mosaic.kernel = kernel;
    }
    if let Some(block_size) = args.block_size {
        mosaic.block_size = block_size;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logger
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    info!("=== Raster Mosaic ===");

    if let Some(n_threads) = args.threads {
        rayon::ThreadPoolBuilder::new().num_threads(n_threads).build_global()?;
        info!("Using {} threads", n_threads);
    } else {
        info!("Using all available threads");
    }

    let write_options = WriteOptions {
        compression: args.compression.clone(),
        tile_size: args.tile_size,
        overviews: args.overviews,
        output_type: args.output_type,
        ..WriteOptions::default()
    };
    // Fail on bad output settings before reading anything
    write_options.validate()?;

    let config = build_config(&args)?;

    if !args.quality.is_empty() && args.quality.len() != args.inputs.len() {
        return Err(MosaicError::InvalidQuality {
            tile: args.inputs.join(","),
            reason: format!(
                "{} quality scores given for {} inputs",
                args.quality.len(),
                args.inputs.len()
            ),
        });
    }

    let mut tiles = Vec::with_capacity(args.inputs.len());
    for (i, input) in args.inputs.iter().enumerate() {
        let mut tile = io::read_tile(input)?;
        if let Some(&quality) = args.quality.get(i) {
            tile = tile.with_quality(quality);
        }
        tiles.push(tile);
    }

    if tiles.len() == 1 {
        warn!("Only one input; the output is that tile after the pipeline stages");
    }

    let mosaic = pipeline::run(&tiles, &config)?;
    info!(
        "Mosaic: {}x{} pixels, {} bands",
        mosaic.width(),
        mosaic.height(),
        mosaic.bands().len()
    );

    info!("Writing output: {}", args.output);
    io::write_tile(&args.output, &mosaic, &write_options)?;

    info!("=== Done! ===");
    Ok(())
}
