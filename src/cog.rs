use crate::error::{MosaicError, Result};
use crate::pixel::PixelType;
#[cfg(feature = "gdal")]
use gdal::Dataset;
#[cfg(feature = "gdal")]
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Overviews stop once the coarsest level would be smaller than this.
const MIN_OVERVIEW_DIM: usize = 256;

/// Sample type of the written GeoTIFF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    /// Widest pixel type among the bands (8-bit stays 8-bit).
    #[default]
    Native,
    Float32,
    Float64,
}

impl OutputType {
    /// Dataset pixel type for bands of the given types. GeoTIFF bands share
    /// one type, so mixed bands are widened.
    pub fn resolve(self, band_types: impl IntoIterator<Item = PixelType>) -> PixelType {
        match self {
            OutputType::Native => band_types
                .into_iter()
                .reduce(PixelType::widen)
                .unwrap_or(PixelType::F32),
            OutputType::Float32 => PixelType::F32,
            OutputType::Float64 => PixelType::F64,
        }
    }
}

/// GeoTIFF creation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    pub compression: String,
    pub tile_size: usize,
    pub overviews: bool,
    /// GDAL resampling name used for overview levels.
    pub overview_resampling: String,
    pub output_type: OutputType,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            compression: "DEFLATE".to_string(),
            tile_size: 512,
            overviews: false,
            overview_resampling: "AVERAGE".to_string(),
            output_type: OutputType::Native,
        }
    }
}

impl WriteOptions {
    pub fn validate(&self) -> Result<()> {
        validate_compression(&self.compression)?;
        validate_tile_size(self.tile_size)
    }

    /// GTiff creation options for a tiled output.
    pub fn creation_options(&self) -> Vec<String> {
        create_dataset_options(&self.compression, self.tile_size)
    }
}

/// Validate compression type
pub fn validate_compression(compression: &str) -> Result<()> {
    let valid_types = ["DEFLATE", "LZW", "ZSTD", "NONE"];
    if !valid_types.contains(&compression) {
        return Err(MosaicError::InvalidCompression(compression.to_string()));
    }
    Ok(())
}

/// Validate tile size (must be multiple of 16)
pub fn validate_tile_size(tile_size: usize) -> Result<()> {
    if tile_size == 0 || tile_size % 16 != 0 {
        return Err(MosaicError::InvalidTileSize(tile_size));
    }
    Ok(())
}

pub fn create_dataset_options(compression: &str, tile_size: usize) -> Vec<String> {
    vec![
        format!("COMPRESS={}", compression),
        "TILED=YES".to_string(),
        format!("BLOCKXSIZE={}", tile_size),
        format!("BLOCKYSIZE={}", tile_size),
        "BIGTIFF=IF_SAFER".to_string(),
    ]
}

/// Power-of-two decimation factors while the smaller raster side still has
/// at least `MIN_OVERVIEW_DIM` pixels at that level.
pub fn overview_levels(width: usize, height: usize) -> Vec<i32> {
    let min_dim = width.min(height);
    let mut levels = Vec::new();
    let mut level = 2;
    while min_dim / level >= MIN_OVERVIEW_DIM {
        levels.push(level as i32);
        level *= 2;
    }
    levels
}

#[cfg(feature = "gdal")]
pub fn build_overviews(dataset: &mut Dataset, resampling: &str) -> Result<()> {
    let (width, height) = dataset.raster_size();
    let levels = overview_levels(width, height);

    if levels.is_empty() {
        debug!("Raster too small for overviews ({}x{}), skipping", width, height);
        return Ok(());
    }

    info!("Creating {} overview levels ({}): {:?}", levels.len(), resampling, levels);

    // Empty bands list means build for all bands
    dataset
        .build_overviews(resampling, &levels, &[])
        .map_err(|e| MosaicError::OutputFailed(format!("Failed to build overviews: {}", e)))?;
    Ok(())
}

/// Fail if the written dataset ended up striped instead of tiled.
#[cfg(feature = "gdal")]
pub fn validate_tiled(dataset: &Dataset) -> Result<()> {
    let (width, _height) = dataset.raster_size();
    let rasterband = dataset.rasterband(1)?;
    let block_size = rasterband.block_size();

    if block_size.0 == width && block_size.1 == 1 {
        return Err(MosaicError::OutputFailed(
            "Output is not tiled (scanline format detected)".to_string(),
        ));
    }

    debug!("Output layout: tiled, block_size={}x{}", block_size.0, block_size.1);
    Ok(())
}
