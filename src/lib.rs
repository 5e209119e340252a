// Library exports for testing and reuse

pub mod band_math;
pub mod chunking;
pub mod cli;
pub mod cog;
pub mod crs;
pub mod error;
pub mod expression;
pub mod grid;
pub mod indices;
#[cfg(feature = "gdal")]
pub mod io;
pub mod mosaic;
pub mod pipeline;
pub mod pixel;
pub mod raster;
pub mod resample;
pub mod rescale;

// Re-export commonly used types
pub use band_math::{compute, compute_index};
pub use crs::Reprojector;
pub use error::{MosaicError, Result};
pub use expression::Expression;
pub use grid::OutputGrid;
pub use indices::SpectralIndex;
pub use mosaic::{composite, Compositor, MergePolicy, MergeRule, MosaicConfig};
pub use pipeline::{run, CancelToken, Pipeline, PipelineConfig, Stage};
pub use pixel::PixelType;
pub use raster::{Band, GeoTransform, RasterTile};
pub use resample::{resample, Kernel, PixelSize};
pub use rescale::{rescale, RescaleMethod, ValueRange};
