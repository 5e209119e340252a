use crate::cog::OutputType;
use crate::mosaic::{BlendWeights, MergeRule, ScoreOrder};
use crate::resample::Kernel;
use clap::{Parser, ValueEnum};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleArg {
    /// Later inputs overwrite earlier ones
    Last,
    /// First valid input pixel is kept
    First,
    /// Mean of the valid inputs
    Blend,
    /// Quality-weighted mean (needs --quality)
    WeightedBlend,
    /// Lowest --quality score wins (e.g. cloud fraction)
    Lowest,
    /// Highest --quality score wins
    Highest,
}

impl From<RuleArg> for MergeRule {
    fn from(rule: RuleArg) -> Self {
        match rule {
            RuleArg::Last => MergeRule::LastWriteWins,
            RuleArg::First => MergeRule::FirstValidWins,
            RuleArg::Blend => MergeRule::Blend {
                weights: BlendWeights::Uniform,
            },
            RuleArg::WeightedBlend => MergeRule::Blend {
                weights: BlendWeights::Quality,
            },
            RuleArg::Lowest => MergeRule::PriorityMetric {
                prefer: ScoreOrder::Lower,
            },
            RuleArg::Highest => MergeRule::PriorityMetric {
                prefer: ScoreOrder::Higher,
            },
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "raster-mosaic")]
#[command(about = "Apply per-tile band math, resampling and rescaling, then mosaic the tiles into one GeoTIFF")]
#[command(version)]
pub struct Args {
    /// Input rasters, in merge order
    #[arg(required = true, value_name = "FILE")]
    pub inputs: Vec<String>,

    /// Output GeoTIFF path
    #[arg(short, long, value_name = "FILE")]
    pub output: String,

    /// JSON pipeline file (stages and mosaic settings)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<String>,

    /// Merge rule (overrides the pipeline file)
    #[arg(short, long, value_enum)]
    pub rule: Option<RuleArg>,

    /// Per-input quality scores, comma separated, in input order
    #[arg(short, long, value_delimiter = ',', value_name = "SCORES")]
    pub quality: Vec<f64>,

    /// On equal scores keep the later input instead of the earlier one
    #[arg(long)]
    pub last_wins: bool,

    /// Output pixel size in CRS units (default: finest input)
    #[arg(long, value_name = "SIZE")]
    pub resolution: Option<f64>,

    /// Kernel for sampling inputs onto the output grid
    #[arg(short, long, value_name = "KERNEL")]
    pub kernel: Option<Kernel>,

    /// Block edge length for compositing
    #[arg(long, value_name = "PIXELS")]
    pub block_size: Option<usize>,

    /// Override output nodata value
    #[arg(long, value_name = "VALUE")]
    pub nodata: Option<f64>,

    /// Number of threads (default: all available)
    #[arg(short, long, value_name = "N")]
    pub threads: Option<usize>,

    /// Compression: DEFLATE, LZW, ZSTD or NONE
    #[arg(long, default_value = "DEFLATE")]
    pub compression: String,

    /// Output tile size (multiple of 16)
    #[arg(long, default_value_t = 512)]
    pub tile_size: usize,

    /// Build internal overviews
    #[arg(long)]
    pub overviews: bool,

    /// Output sample type
    #[arg(long, value_enum, default_value_t = OutputType::Native)]
    pub output_type: OutputType,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}
