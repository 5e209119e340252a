//! Per-tile stage sequencing followed by the mosaic.
//!
//! Every tile runs the same ordered list of stages; tiles run in parallel.
//! The run is all-or-nothing: a failing stage aborts the whole run and the
//! error names the tile and the stage. When several tiles fail, the one
//! earliest in input order is reported.

use crate::band_math;
use crate::crs::Reprojector;
use crate::error::{MosaicError, Result};
use crate::expression::Expression;
use crate::indices::SpectralIndex;
use crate::mosaic::{Compositor, MosaicConfig};
use crate::pixel::PixelType;
use crate::raster::RasterTile;
use crate::resample::{self, Kernel, PixelSize};
use crate::rescale::{self, RescaleMethod, ValueRange};
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between the caller and a run.
///
/// Checked at stage and tile boundaries, never inside a pixel loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(MosaicError::Cancelled);
        }
        Ok(())
    }
}

fn default_target() -> ValueRange {
    ValueRange::unit()
}

/// One per-tile transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Stage {
    /// Append `output` computed from an arithmetic expression over bands.
    /// Undefined pixels are written as `nodata`, NaN when unset.
    BandMath {
        expression: Expression,
        output: String,
        #[serde(default)]
        nodata: Option<f64>,
    },
    /// Append a named spectral index.
    Index {
        index: SpectralIndex,
        #[serde(default)]
        output: Option<String>,
        #[serde(default)]
        nodata: Option<f64>,
    },
    /// Change the pixel size, keeping origin and rotation.
    Resample {
        pixel_size: PixelSize,
        #[serde(default)]
        kernel: Kernel,
    },
    /// Stretch one band into `target`.
    Rescale {
        band: String,
        method: RescaleMethod,
        #[serde(default = "default_target")]
        target: ValueRange,
        #[serde(default)]
        output_type: Option<PixelType>,
    },
    /// Keep the pixel window `[row_start, row_end) x [col_start, col_end)`.
    Crop {
        row_start: usize,
        row_end: usize,
        col_start: usize,
        col_end: usize,
    },
}

impl Stage {
    /// Short label used in logs and errors, e.g. `band_math(ndvi)`.
    pub fn name(&self) -> String {
        match self {
            Stage::BandMath { output, .. } => format!("band_math({})", output),
            Stage::Index { index, output, .. } => {
                format!("index({})", output.as_deref().unwrap_or(index.default_band_name()))
            }
            Stage::Resample { .. } => "resample".to_string(),
            Stage::Rescale { band, .. } => format!("rescale({})", band),
            Stage::Crop { .. } => "crop".to_string(),
        }
    }

    pub fn apply(&self, tile: &RasterTile) -> Result<RasterTile> {
        match self {
            Stage::BandMath {
                expression,
                output,
                nodata,
            } => band_math::compute(tile, expression, output, *nodata),
            Stage::Index { index, output, nodata } => {
                band_math::compute_index(tile, index, output.as_deref(), *nodata)
            }
            Stage::Resample { pixel_size, kernel } => resample::resample(tile, *pixel_size, *kernel),
            Stage::Rescale {
                band,
                method,
                target,
                output_type,
            } => rescale::rescale(tile, band, method, *target, *output_type),
            Stage::Crop {
                row_start,
                row_end,
                col_start,
                col_end,
            } => tile.crop_by_pixel(*row_start, *row_end, *col_start, *col_end),
        }
    }
}

/// Stages applied to every tile, then the mosaic settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub stages: Vec<Stage>,
    pub mosaic: MosaicConfig,
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading pipeline configuration: {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

/// Run `config` over `tiles` without reprojection or cancellation.
pub fn run(tiles: &[RasterTile], config: &PipelineConfig) -> Result<RasterTile> {
    Pipeline::new(config).run(tiles)
}

pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    reprojector: Option<&'a dyn Reprojector>,
    cancel: Option<&'a CancelToken>,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self {
            config,
            reprojector: None,
            cancel: None,
        }
    }

    pub fn with_reprojector(mut self, reprojector: &'a dyn Reprojector) -> Self {
        self.reprojector = Some(reprojector);
        self
    }

    pub fn with_cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn check_cancelled(&self) -> Result<()> {
        match self.cancel {
            Some(token) => token.check(),
            None => Ok(()),
        }
    }

    pub fn run(&self, tiles: &[RasterTile]) -> Result<RasterTile> {
        if tiles.is_empty() {
            return Err(MosaicError::EmptyInput);
        }
        self.check_cancelled()?;
        info!(
            "Running pipeline: {} tiles, {} stages",
            tiles.len(),
            self.config.stages.len()
        );

        let mut compositor = Compositor::new(self.config.mosaic.clone());
        if let Some(reprojector) = self.reprojector {
            compositor = compositor.with_reprojector(reprojector);
        }
        if let Some(cancel) = self.cancel {
            compositor = compositor.with_cancel(cancel);
        }

        if self.config.stages.is_empty() {
            return compositor.run(tiles);
        }

        // Collect every outcome, then report in input order.
        let outcomes: Vec<Result<RasterTile>> = tiles.par_iter().map(|tile| self.transform(tile)).collect();
        let transformed = outcomes.into_iter().collect::<Result<Vec<_>>>()?;
        compositor.run(&transformed)
    }

    fn transform(&self, tile: &RasterTile) -> Result<RasterTile> {
        let mut current = Cow::Borrowed(tile);
        for stage in &self.config.stages {
            self.check_cancelled()?;
            debug!("Tile '{}': applying {}", tile.id, stage.name());
            let next = stage.apply(&current).map_err(|source| MosaicError::Stage {
                tile: tile.id.clone(),
                stage: stage.name(),
                source: Box::new(source),
            })?;
            current = Cow::Owned(next);
        }
        Ok(current.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mosaic::{MergePolicy, MergeRule};
    use crate::raster::tests::tile_at;
    use ndarray::arr2;

    const ND: f64 = -9999.0;

    fn scene(id: &str, west: f64, red: f64, nir: f64) -> RasterTile {
        tile_at(
            id,
            west,
            10.0,
            vec![("red", arr2(&[[red, ND]])), ("nir", arr2(&[[nir, nir]]))],
            Some(ND),
        )
    }

    fn ndvi_config() -> PipelineConfig {
        PipelineConfig {
            stages: vec![Stage::Index {
                index: SpectralIndex::Ndvi,
                output: None,
                nodata: None,
            }],
            mosaic: MosaicConfig::default(),
        }
    }

    #[test]
    fn test_index_then_mosaic() {
        let tiles = [scene("a", 0.0, 0.2, 0.6), scene("b", 20.0, 0.1, 0.3)];
        let out = run(&tiles, &ndvi_config()).unwrap();
        assert_eq!(out.band_names().collect::<Vec<_>>(), vec!["red", "nir", "ndvi"]);
        let ndvi = &out.band("ndvi").unwrap().data;
        assert_eq!(ndvi.dim(), (1, 4));
        assert!((ndvi[[0, 0]] - 0.5).abs() < 1e-12);
        assert!(ndvi[[0, 1]].is_nan());
        assert!((ndvi[[0, 2]] - 0.5).abs() < 1e-12);
        assert!(ndvi[[0, 3]].is_nan());
        assert_eq!(out.band("ndvi").unwrap().nodata, None);
        assert_eq!(out.band("red").unwrap().nodata, Some(ND));
    }

    #[test]
    fn test_index_nodata_from_stage() {
        let config = PipelineConfig {
            stages: vec![Stage::Index {
                index: SpectralIndex::Ndvi,
                output: None,
                nodata: Some(ND),
            }],
            mosaic: MosaicConfig::default(),
        };
        let out = run(&[scene("a", 0.0, 0.2, 0.6)], &config).unwrap();
        let ndvi = out.band("ndvi").unwrap();
        assert_eq!(ndvi.nodata, Some(ND));
        assert_eq!(ndvi.data[[0, 1]], ND);
    }

    #[test]
    fn test_no_stages_composites_directly() {
        let tiles = [scene("a", 0.0, 1.0, 2.0)];
        let out = run(&tiles, &PipelineConfig::default()).unwrap();
        assert_eq!(out.band("red").unwrap().data, arr2(&[[1.0, ND]]));
    }

    #[test]
    fn test_failure_names_tile_and_stage() {
        let good = scene("good", 0.0, 0.2, 0.6);
        let bad = tile_at("bad", 20.0, 10.0, vec![("red", arr2(&[[0.1]]))], Some(ND));
        let err = run(&[good, bad], &ndvi_config()).unwrap_err();
        match err {
            MosaicError::Stage { tile, stage, source } => {
                assert_eq!(tile, "bad");
                assert_eq!(stage, "index(ndvi)");
                assert!(matches!(*source, MosaicError::UnknownBand(ref b) if b == "nir"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_first_failure_in_input_order_reported() {
        let tiles: Vec<RasterTile> = (0..8)
            .map(|i| tile_at(&format!("t{}", i), i as f64 * 10.0, 10.0, vec![("x", arr2(&[[1.0]]))], None))
            .collect();
        let err = run(&tiles, &ndvi_config()).unwrap_err();
        assert!(matches!(err, MosaicError::Stage { ref tile, .. } if tile == "t0"));
    }

    #[test]
    fn test_stages_apply_in_order() {
        let tile = tile_at("a", 0.0, 20.0, vec![("b", arr2(&[[0.0, 10.0], [20.0, 40.0]]))], Some(ND));
        let config = PipelineConfig {
            stages: vec![
                Stage::Crop {
                    row_start: 1,
                    row_end: 2,
                    col_start: 0,
                    col_end: 2,
                },
                Stage::Rescale {
                    band: "b".to_string(),
                    method: RescaleMethod::Normalize,
                    target: ValueRange::unit(),
                    output_type: None,
                },
            ],
            mosaic: MosaicConfig {
                policy: MergePolicy::new(MergeRule::FirstValidWins),
                ..MosaicConfig::default()
            },
        };
        let out = run(&[tile], &config).unwrap();
        assert_eq!(out.band("b").unwrap().data, arr2(&[[0.0, 1.0]]));
        assert_eq!(out.geotransform.origin(), (0.0, 10.0));
    }

    #[test]
    fn test_cancelled_before_start() {
        let token = CancelToken::new();
        token.cancel();
        let config = ndvi_config();
        let result = Pipeline::new(&config)
            .with_cancel(&token)
            .run(&[scene("a", 0.0, 0.2, 0.6)]);
        assert!(matches!(result, Err(MosaicError::Cancelled)));
    }

    #[test]
    fn test_empty_input() {
        assert!(matches!(run(&[], &ndvi_config()), Err(MosaicError::EmptyInput)));
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "stages": [
                {"stage": "band_math", "expression": "(nir - red) / (nir + red)", "output": "ndvi"},
                {"stage": "index", "index": {"index": "savi", "l": 0.25}, "nodata": -1.5},
                {"stage": "resample", "pixel_size": {"width": 20.0, "height": 20.0}, "kernel": "bilinear"},
                {"stage": "rescale", "band": "ndvi", "method": {"method": "linear", "min": -1.0, "max": 1.0},
                 "output_type": "u8", "target": {"min": 1.0, "max": 255.0}}
            ],
            "mosaic": {
                "policy": {"rule": {"rule": "blend", "weights": "quality"}, "nodata": 0.0},
                "block_size": 256
            }
        }"#;
        let config = PipelineConfig::from_json(json).unwrap();
        assert_eq!(config.stages.len(), 4);
        assert_eq!(config.stages[0].name(), "band_math(ndvi)");
        assert_eq!(
            config.stages[1],
            Stage::Index {
                index: SpectralIndex::Savi { l: 0.25 },
                output: None,
                nodata: Some(-1.5)
            }
        );
        assert_eq!(config.stages[1].name(), "index(savi)");
        assert_eq!(
            config.stages[2],
            Stage::Resample {
                pixel_size: PixelSize::square(20.0),
                kernel: Kernel::Bilinear
            }
        );
        assert_eq!(config.stages[3].name(), "rescale(ndvi)");
        assert_eq!(config.mosaic.block_size, 256);
        assert_eq!(config.mosaic.policy.nodata, Some(0.0));
        assert_eq!(config.mosaic.kernel, Kernel::Nearest);
    }

    #[test]
    fn test_config_rejects_bad_expression() {
        let json = r#"{"stages": [{"stage": "band_math", "expression": "nir +", "output": "x"}]}"#;
        assert!(matches!(PipelineConfig::from_json(json), Err(MosaicError::Config(_))));
    }
}
