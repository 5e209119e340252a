//! Mosaic compositing.
//!
//! Tiles are merged onto an [`OutputGrid`] block by block. Each block owns a
//! private accumulator and writes its finished pixels straight into its own
//! region of the output bands, so blocks run in parallel without locks; the
//! per-pixel loop is monomorphised per merge rule and does no policy
//! lookups. All validation (CRS, qualities, grid, band layout) happens before
//! the first pixel is touched.

use crate::chunking::{Block, BlockGrid};
use crate::crs::{same_crs, Reprojector};
use crate::error::{MosaicError, Result};
use crate::grid::OutputGrid;
use crate::pipeline::CancelToken;
use crate::pixel::PixelType;
use crate::raster::{Band, RasterTile};
use crate::resample::{sample, Kernel, PixelMapping, PixelSize};
use log::{debug, info, warn};
use ndarray::{s, Array2, ArrayViewMut2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cmp::Ordering;

pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Which of two scores is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreOrder {
    /// Smaller is better (cloud fraction, haze, view angle).
    #[default]
    Lower,
    Higher,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendWeights {
    #[default]
    Uniform,
    /// Each tile weighs its `quality` score (must be positive).
    Quality,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum MergeRule {
    /// Later tiles overwrite earlier valid pixels.
    #[default]
    LastWriteWins,
    /// The first valid pixel in input order is kept.
    FirstValidWins,
    /// Weighted mean of the valid contributions.
    Blend {
        #[serde(default)]
        weights: BlendWeights,
    },
    /// The valid pixel from the best-scoring tile is kept.
    PriorityMetric {
        #[serde(default)]
        prefer: ScoreOrder,
    },
}

/// Resolution of equal priority-metric scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// The tile earlier in input order keeps the pixel.
    #[default]
    FirstWins,
    LastWins,
}

/// Treatment of nodata contributions under [`MergeRule::Blend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendNodata {
    /// Average only the valid contributions.
    #[default]
    Exclude,
    /// Any covering tile that is nodata at a pixel makes the pixel nodata.
    Propagate,
}

/// How overlapping pixels combine. Nodata samples never overwrite a valid
/// accumulated value under any rule.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergePolicy {
    pub rule: MergeRule,
    pub tie_break: TieBreak,
    pub blend_nodata: BlendNodata,
    /// Output nodata value for every band; defaults to the inputs' nodata.
    pub nodata: Option<f64>,
}

impl MergePolicy {
    pub fn new(rule: MergeRule) -> Self {
        Self {
            rule,
            ..Self::default()
        }
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn with_blend_nodata(mut self, blend_nodata: BlendNodata) -> Self {
        self.blend_nodata = blend_nodata;
        self
    }

    pub fn with_nodata(mut self, nodata: f64) -> Self {
        self.nodata = Some(nodata);
        self
    }

    fn check_tile(&self, tile: &RasterTile) -> Result<()> {
        let invalid = |reason: &str| MosaicError::InvalidQuality {
            tile: tile.id.clone(),
            reason: reason.to_string(),
        };
        match self.rule {
            MergeRule::PriorityMetric { .. } => match tile.quality {
                None => Err(invalid("priority-metric merging needs a quality score on every tile")),
                Some(q) if !q.is_finite() => Err(invalid("score is not finite")),
                Some(_) => Ok(()),
            },
            MergeRule::Blend {
                weights: BlendWeights::Quality,
            } => match tile.quality {
                None => Err(invalid("quality-weighted blending needs a quality score on every tile")),
                Some(q) if !(q > 0.0) || !q.is_finite() => Err(invalid("blend weight must be positive")),
                Some(_) => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

/// Everything `composite` needs besides the tiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MosaicConfig {
    pub policy: MergePolicy,
    /// Explicit output grid; inferred from the tile extents when `None`.
    pub grid: Option<OutputGrid>,
    /// Resolution of the inferred grid; finest input resolution when `None`.
    pub resolution: Option<PixelSize>,
    /// Kernel used to sample tiles onto the output grid.
    pub kernel: Kernel,
    /// Edge length of the output blocks processed independently.
    pub block_size: usize,
}

impl Default for MosaicConfig {
    fn default() -> Self {
        Self {
            policy: MergePolicy::default(),
            grid: None,
            resolution: None,
            kernel: Kernel::Nearest,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Merge `tiles` into one raster on `grid` (inferred when `None`).
pub fn composite(tiles: &[RasterTile], policy: &MergePolicy, grid: Option<&OutputGrid>) -> Result<RasterTile> {
    let config = MosaicConfig {
        policy: *policy,
        grid: grid.cloned(),
        ..MosaicConfig::default()
    };
    Compositor::new(config).run(tiles)
}

pub struct Compositor<'a> {
    config: MosaicConfig,
    reprojector: Option<&'a dyn Reprojector>,
    cancel: Option<&'a CancelToken>,
}

/// Output pixel rectangle `[row_start, row_end) x [col_start, col_end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    row_start: usize,
    row_end: usize,
    col_start: usize,
    col_end: usize,
}

impl Window {
    fn intersect(&self, block: &Block) -> Option<Window> {
        let w = Window {
            row_start: self.row_start.max(block.row_start),
            row_end: self.row_end.min(block.row_end),
            col_start: self.col_start.max(block.col_start),
            col_end: self.col_end.min(block.col_end),
        };
        (w.row_start < w.row_end && w.col_start < w.col_end).then_some(w)
    }
}

#[derive(Debug, Clone)]
struct OutputBand {
    name: String,
    nodata: Option<f64>,
    pixel_type: PixelType,
}

/// Per-tile bookkeeping computed once before the block loop.
struct TilePlan<'t> {
    tile: &'t RasterTile,
    mapping: PixelMapping,
    footprint: Window,
    /// `(output band, tile band)` pairs.
    bands: Vec<(usize, usize)>,
    weight: f64,
    score: f64,
}

impl<'a> Compositor<'a> {
    pub fn new(config: MosaicConfig) -> Self {
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

    pub fn config(&self) -> &MosaicConfig {
        &self.config
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
        let block_size = self.config.block_size;
        if block_size == 0 {
            return Err(MosaicError::InvalidBlockSize(block_size));
        }
        let policy = &self.config.policy;
        self.check_cancelled()?;

        let target_crs = match &self.config.grid {
            Some(grid) => grid.crs.clone(),
            None => tiles[0].crs.clone(),
        };
        let tiles = self.align_crs(tiles, &target_crs)?;
        for tile in &tiles {
            policy.check_tile(tile)?;
        }

        let grid = match &self.config.grid {
            Some(grid) => {
                grid.validate()?;
                grid.clone()
            }
            None => OutputGrid::from_tiles(&tiles, self.config.resolution)?,
        };

        let layout = band_layout(&tiles, policy);
        let plans = plan_tiles(&tiles, &grid, &layout, policy);
        let blocks = BlockGrid::new(grid.width, grid.height, block_size)?;

        info!(
            "Compositing {} tiles into {}x{} grid ({} bands, {:?}, {} blocks of {} px)",
            tiles.len(),
            grid.width,
            grid.height,
            layout.len(),
            policy.rule,
            blocks.total_blocks,
            block_size
        );

        let mut outputs: Vec<Array2<f64>> = layout
            .iter()
            .map(|b| Array2::from_elem((grid.height, grid.width), b.nodata.unwrap_or(f64::NAN)))
            .collect();

        // One strip of block rows per task; each strip holds a disjoint row
        // range of every output band, so blocks write in place.
        let mut band_strips: Vec<_> = outputs
            .iter_mut()
            .map(|out| out.axis_chunks_iter_mut(Axis(0), block_size))
            .collect();
        let strips: Vec<Vec<ArrayViewMut2<'_, f64>>> = (0..blocks.blocks_y)
            .map(|_| band_strips.iter_mut().filter_map(|chunks| chunks.next()).collect())
            .collect();

        strips
            .into_par_iter()
            .enumerate()
            .try_for_each(|(block_row, mut strip)| -> Result<()> {
                for block_col in 0..blocks.blocks_x {
                    let block = blocks.block(block_row * blocks.blocks_x + block_col);
                    self.composite_block(&block, &plans, &layout, &mut strip)?;
                }
                Ok(())
            })?;

        let bands: Vec<Band> = layout
            .into_iter()
            .zip(outputs)
            .map(|(meta, data)| Band {
                name: meta.name,
                data,
                nodata: meta.nodata,
                pixel_type: meta.pixel_type,
            })
            .collect();
        for band in &bands {
            debug!(
                "Mosaic band '{}': {} of {} pixels valid",
                band.name,
                band.valid_count(),
                grid.pixel_count()
            );
        }

        RasterTile::new("mosaic", bands, grid.geotransform, grid.crs)
    }

    /// Bring every tile into `target_crs`, or fail before any pixel work.
    fn align_crs<'t>(&self, tiles: &'t [RasterTile], target_crs: &str) -> Result<Vec<Cow<'t, RasterTile>>> {
        tiles
            .iter()
            .map(|tile| {
                if same_crs(&tile.crs, target_crs) {
                    return Ok(Cow::Borrowed(tile));
                }
                match self.reprojector {
                    Some(reprojector) => {
                        self.check_cancelled()?;
                        info!("Reprojecting tile '{}' from '{}' to '{}'", tile.id, tile.crs, target_crs);
                        let reprojected = reprojector.reproject(tile, target_crs)?;
                        if !same_crs(&reprojected.crs, target_crs) {
                            return Err(MosaicError::CrsMismatch {
                                tile: tile.id.clone(),
                                expected: target_crs.to_string(),
                                found: reprojected.crs,
                            });
                        }
                        Ok(Cow::Owned(reprojected))
                    }
                    None => Err(MosaicError::CrsMismatch {
                        tile: tile.id.clone(),
                        expected: target_crs.to_string(),
                        found: tile.crs.clone(),
                    }),
                }
            })
            .collect()
    }

    /// Merge every tile into `block` and write the finished pixels into
    /// `strip`, the block's row range of each output band.
    fn composite_block(
        &self,
        block: &Block,
        plans: &[TilePlan<'_>],
        layout: &[OutputBand],
        strip: &mut [ArrayViewMut2<'_, f64>],
    ) -> Result<()> {
        let policy = &self.config.policy;
        let kernel = self.config.kernel;
        let mut states: Vec<Vec<PixelState>> = vec![vec![PixelState::default(); block.pixel_count()]; layout.len()];

        for plan in plans {
            self.check_cancelled()?;
            let Some(window) = plan.footprint.intersect(block) else {
                continue;
            };
            for &(out_idx, band_idx) in &plan.bands {
                let band = &plan.tile.bands()[band_idx];
                let target = BlockTarget {
                    states: &mut states[out_idx],
                    block,
                    window,
                };
                match policy.rule {
                    MergeRule::LastWriteWins => accumulate(&LastWrite, target, plan, band, kernel),
                    MergeRule::FirstValidWins => accumulate(&FirstValid, target, plan, band, kernel),
                    MergeRule::Blend { .. } => {
                        let merge = WeightedSum {
                            weight: plan.weight,
                            propagate: policy.blend_nodata == BlendNodata::Propagate,
                        };
                        accumulate(&merge, target, plan, band, kernel)
                    }
                    MergeRule::PriorityMetric { prefer } => {
                        let merge = BestScore {
                            score: plan.score,
                            prefer,
                            tie_break: policy.tie_break,
                        };
                        accumulate(&merge, target, plan, band, kernel)
                    }
                }
            }
        }

        let averaged = matches!(policy.rule, MergeRule::Blend { .. });
        for ((meta, band_states), out) in layout.iter().zip(states).zip(strip.iter_mut()) {
            let fill = meta.nodata.unwrap_or(f64::NAN);
            let mut target = out.slice_mut(s![.., block.col_start..block.col_end]);
            for (value, state) in target.iter_mut().zip(&band_states) {
                *value = match state.finish(averaged) {
                    Some(v) => meta.pixel_type.cast(v),
                    None => fill,
                };
            }
        }
        Ok(())
    }
}

/// Distinct band names in first-appearance order with their output nodata
/// and pixel type.
fn band_layout(tiles: &[Cow<'_, RasterTile>], policy: &MergePolicy) -> Vec<OutputBand> {
    let mut layout: Vec<OutputBand> = Vec::new();
    for tile in tiles {
        for band in tile.bands() {
            match layout.iter_mut().find(|b| b.name == band.name) {
                Some(existing) => {
                    existing.pixel_type = existing.pixel_type.widen(band.pixel_type);
                    if existing.nodata.is_none() {
                        existing.nodata = band.nodata;
                    }
                }
                None => layout.push(OutputBand {
                    name: band.name.clone(),
                    nodata: policy.nodata.or(band.nodata),
                    pixel_type: band.pixel_type,
                }),
            }
        }
    }

    for band in &mut layout {
        let representable = match band.nodata {
            Some(nd) => band.pixel_type.can_represent(nd),
            None => !band.pixel_type.is_integer(),
        };
        if !representable {
            warn!(
                "Band '{}': nodata {:?} cannot be stored as {:?}; mosaic band widened to F64",
                band.name, band.nodata, band.pixel_type
            );
            band.pixel_type = PixelType::F64;
        }
    }
    layout
}

fn plan_tiles<'t>(
    tiles: &'t [Cow<'t, RasterTile>],
    grid: &OutputGrid,
    layout: &[OutputBand],
    policy: &MergePolicy,
) -> Vec<TilePlan<'t>> {
    tiles
        .iter()
        .filter_map(|tile| {
            let tile: &RasterTile = tile;
            let Some(footprint) = footprint(tile, grid) else {
                debug!("Tile '{}' does not intersect the output grid, skipping", tile.id);
                return None;
            };
            debug!(
                "Tile '{}' covers output rows {}..{}, cols {}..{}",
                tile.id, footprint.row_start, footprint.row_end, footprint.col_start, footprint.col_end
            );
            let bands = tile
                .bands()
                .iter()
                .enumerate()
                .filter_map(|(band_idx, band)| {
                    layout
                        .iter()
                        .position(|b| b.name == band.name)
                        .map(|out_idx| (out_idx, band_idx))
                })
                .collect();
            let weight = match policy.rule {
                MergeRule::Blend {
                    weights: BlendWeights::Quality,
                } => tile.quality.unwrap_or(1.0),
                _ => 1.0,
            };
            Some(TilePlan {
                tile,
                mapping: PixelMapping::between(&tile.geotransform, &grid.geotransform),
                footprint,
                bands,
                weight,
                score: tile.quality.unwrap_or(0.0),
            })
        })
        .collect()
}

/// Output pixels whose area may overlap the tile.
fn footprint(tile: &RasterTile, grid: &OutputGrid) -> Option<Window> {
    let (w, h) = (tile.width() as f64, tile.height() as f64);
    let mut min_c = f64::INFINITY;
    let mut min_r = f64::INFINITY;
    let mut max_c = f64::NEG_INFINITY;
    let mut max_r = f64::NEG_INFINITY;
    for (col, row) in [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)] {
        let (x, y) = tile.geotransform.pixel_to_world(col, row);
        let (c, r) = grid.geotransform.world_to_pixel(x, y);
        min_c = min_c.min(c);
        max_c = max_c.max(c);
        min_r = min_r.min(r);
        max_r = max_r.max(r);
    }

    let col_start = min_c.floor().max(0.0);
    let row_start = min_r.floor().max(0.0);
    let col_end = max_c.ceil().min(grid.width as f64);
    let row_end = max_r.ceil().min(grid.height as f64);
    if col_start >= col_end || row_start >= row_end {
        return None;
    }
    Some(Window {
        row_start: row_start as usize,
        row_end: row_end as usize,
        col_start: col_start as usize,
        col_end: col_end as usize,
    })
}

/// Accumulated state of one output pixel.
#[derive(Debug, Clone, Copy, Default)]
struct PixelState {
    /// Current value, or the weighted sum when blending.
    value: f64,
    /// Zero while the pixel is uncovered; summed weights when blending.
    weight: f64,
    score: f64,
    /// Set when a nodata contribution poisons a blended pixel.
    blocked: bool,
}

impl PixelState {
    #[inline]
    fn set(&mut self, value: f64) {
        self.value = value;
        self.weight = 1.0;
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.weight == 0.0
    }

    fn finish(&self, averaged: bool) -> Option<f64> {
        if self.blocked || self.is_empty() {
            None
        } else if averaged {
            Some(self.value / self.weight)
        } else {
            Some(self.value)
        }
    }
}

trait PixelMerge {
    /// `sample` is `None` where the tile covers the pixel but has no data.
    fn merge(&self, state: &mut PixelState, sample: Option<f64>);
}

struct LastWrite;

impl PixelMerge for LastWrite {
    #[inline]
    fn merge(&self, state: &mut PixelState, sample: Option<f64>) {
        if let Some(v) = sample {
            state.set(v);
        }
    }
}

struct FirstValid;

impl PixelMerge for FirstValid {
    #[inline]
    fn merge(&self, state: &mut PixelState, sample: Option<f64>) {
        if let Some(v) = sample {
            if state.is_empty() {
                state.set(v);
            }
        }
    }
}

struct WeightedSum {
    weight: f64,
    propagate: bool,
}

impl PixelMerge for WeightedSum {
    #[inline]
    fn merge(&self, state: &mut PixelState, sample: Option<f64>) {
        match sample {
            Some(v) => {
                state.value += self.weight * v;
                state.weight += self.weight;
            }
            None => {
                if self.propagate {
                    state.blocked = true;
                }
            }
        }
    }
}

struct BestScore {
    score: f64,
    prefer: ScoreOrder,
    tie_break: TieBreak,
}

impl PixelMerge for BestScore {
    #[inline]
    fn merge(&self, state: &mut PixelState, sample: Option<f64>) {
        let Some(v) = sample else {
            return;
        };
        let take = if state.is_empty() {
            true
        } else {
            let ord = match self.prefer {
                ScoreOrder::Lower => state.score.total_cmp(&self.score),
                ScoreOrder::Higher => self.score.total_cmp(&state.score),
            };
            match ord {
                Ordering::Greater => true,
                Ordering::Equal => self.tie_break == TieBreak::LastWins,
                Ordering::Less => false,
            }
        };
        if take {
            state.set(v);
            state.score = self.score;
        }
    }
}

/// The part of one block's accumulator a tile band writes to.
struct BlockTarget<'s> {
    states: &'s mut [PixelState],
    block: &'s Block,
    /// Tile footprint clipped to the block.
    window: Window,
}

/// Hot loop: scan the window, sample the tile band at each output pixel
/// centre and fold the sample into the pixel state.
fn accumulate<M: PixelMerge>(merge: &M, target: BlockTarget<'_>, plan: &TilePlan<'_>, band: &Band, kernel: Kernel) {
    let view = band.view();
    let (height, width) = view.dim();
    let (width_f, height_f) = (width as f64, height as f64);
    let stride = target.block.width();
    let window = target.window;

    for row in window.row_start..window.row_end {
        let base = (row - target.block.row_start) * stride;
        let y = row as f64 + 0.5;
        for col in window.col_start..window.col_end {
            let (px, py) = plan.mapping.map(col as f64 + 0.5, y);
            // footprint is a bounding box; skip centres outside the tile
            if !(px >= 0.0 && py >= 0.0 && px < width_f && py < height_f) {
                continue;
            }
            let value = sample(&view, band.nodata, px, py, kernel);
            merge.merge(&mut target.states[base + col - target.block.col_start], value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::tests::tile_at;
    use crate::raster::GeoTransform;
    use ndarray::arr2;

    const ND: f64 = -9999.0;

    fn single(id: &str, west: f64, north: f64, data: Array2<f64>) -> RasterTile {
        tile_at(id, west, north, vec![("b", data)], Some(ND))
    }

    fn band(tile: &RasterTile) -> &Array2<f64> {
        &tile.band("b").unwrap().data
    }

    #[test]
    fn test_self_composite_is_identity() {
        let tile = single("a", 500.0, 1000.0, arr2(&[[1.0, 2.0, ND], [4.0, 5.0, 6.0]]));
        let policy = MergePolicy::new(MergeRule::LastWriteWins);
        let out = composite(&[tile.clone(), tile.clone()], &policy, None).unwrap();
        assert_eq!(out.geotransform, tile.geotransform);
        assert_eq!(out.band("b").unwrap().data, tile.band("b").unwrap().data);
        assert_eq!(out.band("b").unwrap().nodata, Some(ND));
    }

    #[test]
    fn test_non_overlapping_tiles() {
        let a = single("a", 0.0, 20.0, arr2(&[[1.0, 2.0], [3.0, 4.0]]));
        let b = single("b", 30.0, 10.0, arr2(&[[5.0]]));
        let out = composite(&[a, b], &MergePolicy::default(), None).unwrap();
        assert_eq!(
            band(&out),
            &arr2(&[[1.0, 2.0, ND, ND], [3.0, 4.0, ND, 5.0]])
        );
    }

    #[test]
    fn test_blend_averages_valid_contributions() {
        let a = single("a", 0.0, 10.0, arr2(&[[10.0, 10.0, ND]]));
        let b = single("b", 0.0, 10.0, arr2(&[[20.0, ND, 30.0]]));
        let policy = MergePolicy::new(MergeRule::Blend {
            weights: BlendWeights::Uniform,
        });
        let out = composite(&[a.clone(), b.clone()], &policy, None).unwrap();
        assert_eq!(band(&out), &arr2(&[[15.0, 10.0, 30.0]]));

        let propagate = policy.with_blend_nodata(BlendNodata::Propagate);
        let out = composite(&[a, b], &propagate, None).unwrap();
        assert_eq!(band(&out), &arr2(&[[15.0, ND, ND]]));
    }

    #[test]
    fn test_quality_weighted_blend() {
        let a = single("a", 0.0, 10.0, arr2(&[[10.0]])).with_quality(3.0);
        let b = single("b", 0.0, 10.0, arr2(&[[20.0]])).with_quality(1.0);
        let policy = MergePolicy::new(MergeRule::Blend {
            weights: BlendWeights::Quality,
        });
        let out = composite(&[a, b], &policy, None).unwrap();
        assert!((band(&out)[[0, 0]] - 12.5).abs() < 1e-12);
    }

    #[test]
    fn test_order_rules_and_nodata_never_overwrites() {
        let a = single("a", 0.0, 10.0, arr2(&[[1.0, 1.0, ND]]));
        let b = single("b", 0.0, 10.0, arr2(&[[2.0, ND, 2.0]]));

        let last = composite(&[a.clone(), b.clone()], &MergePolicy::new(MergeRule::LastWriteWins), None).unwrap();
        assert_eq!(band(&last), &arr2(&[[2.0, 1.0, 2.0]]));

        let first = composite(&[a, b], &MergePolicy::new(MergeRule::FirstValidWins), None).unwrap();
        assert_eq!(band(&first), &arr2(&[[1.0, 1.0, 2.0]]));
    }

    #[test]
    fn test_priority_metric_and_tie_break() {
        let cloudy = single("cloudy", 0.0, 10.0, arr2(&[[1.0, 1.0]])).with_quality(0.8);
        let clear = single("clear", 0.0, 10.0, arr2(&[[2.0, ND]])).with_quality(0.1);
        let policy = MergePolicy::new(MergeRule::PriorityMetric {
            prefer: ScoreOrder::Lower,
        });
        let out = composite(&[cloudy.clone(), clear.clone()], &policy, None).unwrap();
        // clear wins where valid, cloudy fills its gap
        assert_eq!(band(&out), &arr2(&[[2.0, 1.0]]));

        let higher = MergePolicy::new(MergeRule::PriorityMetric {
            prefer: ScoreOrder::Higher,
        });
        let out = composite(&[clear, cloudy], &higher, None).unwrap();
        assert_eq!(band(&out), &arr2(&[[1.0, 1.0]]));

        let x = single("x", 0.0, 10.0, arr2(&[[5.0]])).with_quality(0.5);
        let y = single("y", 0.0, 10.0, arr2(&[[6.0]])).with_quality(0.5);
        let out = composite(&[x.clone(), y.clone()], &policy, None).unwrap();
        assert_eq!(band(&out)[[0, 0]], 5.0);
        let out = composite(&[x, y], &policy.with_tie_break(TieBreak::LastWins), None).unwrap();
        assert_eq!(band(&out)[[0, 0]], 6.0);
    }

    #[test]
    fn test_priority_metric_requires_quality() {
        let a = single("a", 0.0, 10.0, arr2(&[[1.0]]));
        let policy = MergePolicy::new(MergeRule::PriorityMetric {
            prefer: ScoreOrder::Lower,
        });
        assert!(matches!(
            composite(&[a], &policy, None),
            Err(MosaicError::InvalidQuality { tile, .. }) if tile == "a"
        ));
    }

    #[test]
    fn test_empty_input() {
        assert!(matches!(
            composite(&[], &MergePolicy::default(), None),
            Err(MosaicError::EmptyInput)
        ));
    }

    #[test]
    fn test_mixed_crs_without_reprojector() {
        let a = single("a", 0.0, 10.0, arr2(&[[1.0]]));
        let mut b = single("b", 0.0, 10.0, arr2(&[[2.0]]));
        b.crs = "EPSG:4326".to_string();
        assert!(matches!(
            composite(&[a, b], &MergePolicy::default(), None),
            Err(MosaicError::CrsMismatch { tile, .. }) if tile == "b"
        ));
    }

    struct Relabel;

    impl Reprojector for Relabel {
        fn reproject(&self, tile: &RasterTile, target_crs: &str) -> Result<RasterTile> {
            let mut out = tile.clone();
            out.crs = target_crs.to_string();
            Ok(out)
        }
    }

    #[test]
    fn test_mixed_crs_with_reprojector() {
        let a = single("a", 0.0, 10.0, arr2(&[[1.0]]));
        let mut b = single("b", 10.0, 10.0, arr2(&[[2.0]]));
        b.crs = "EPSG:4326".to_string();
        let out = Compositor::new(MosaicConfig::default())
            .with_reprojector(&Relabel)
            .run(&[a, b])
            .unwrap();
        assert_eq!(out.crs, "EPSG:32633");
        assert_eq!(band(&out), &arr2(&[[1.0, 2.0]]));
    }

    #[test]
    fn test_coarse_tile_on_fine_grid() {
        let fine = single("fine", 0.0, 20.0, arr2(&[[1.0, ND], [ND, ND]]));
        let gt = GeoTransform::from_origin(0.0, 20.0, 20.0, 20.0).unwrap();
        let coarse = RasterTile::new("coarse", vec![Band::new("b", arr2(&[[9.0]]), Some(ND))], gt, "EPSG:32633").unwrap();
        let policy = MergePolicy::new(MergeRule::FirstValidWins);
        let out = composite(&[fine, coarse], &policy, None).unwrap();
        assert_eq!(out.geotransform.pixel_size(), (10.0, 10.0));
        assert_eq!(band(&out), &arr2(&[[1.0, 9.0], [9.0, 9.0]]));
    }

    #[test]
    fn test_block_size_does_not_change_result() {
        let data = Array2::from_shape_fn((7, 9), |(r, c)| (r * 9 + c) as f64);
        let a = single("a", 0.0, 70.0, data.clone());
        let b = single("b", 30.0, 50.0, data.mapv(|v| v * 2.0));
        let tiles = [a, b];
        let run = |block_size| {
            let config = MosaicConfig {
                policy: MergePolicy::new(MergeRule::Blend {
                    weights: BlendWeights::Uniform,
                }),
                block_size,
                ..MosaicConfig::default()
            };
            Compositor::new(config).run(&tiles).unwrap()
        };
        let whole = run(1024);
        for block_size in [1, 2, 3, 5] {
            assert_eq!(run(block_size), whole, "block size {}", block_size);
        }
    }

    #[test]
    fn test_band_sets_merge_by_name() {
        let a = tile_at("a", 0.0, 10.0, vec![("red", arr2(&[[1.0]]))], Some(ND));
        let b = tile_at(
            "b",
            10.0,
            10.0,
            vec![("nir", arr2(&[[7.0]])), ("red", arr2(&[[2.0]]))],
            Some(ND),
        );
        let out = composite(&[a, b], &MergePolicy::default(), None).unwrap();
        assert_eq!(out.band_names().collect::<Vec<_>>(), vec!["red", "nir"]);
        assert_eq!(out.band("red").unwrap().data, arr2(&[[1.0, 2.0]]));
        assert_eq!(out.band("nir").unwrap().data, arr2(&[[ND, 7.0]]));
    }

    #[test]
    fn test_explicit_grid_clips() {
        let a = single("a", 0.0, 20.0, arr2(&[[1.0, 2.0], [3.0, 4.0]]));
        let gt = GeoTransform::from_origin(10.0, 20.0, 10.0, 10.0).unwrap();
        let grid = OutputGrid::new(gt, "EPSG:32633", 2, 1).unwrap();
        let out = composite(&[a], &MergePolicy::default(), Some(&grid)).unwrap();
        assert_eq!(band(&out), &arr2(&[[2.0, ND]]));
    }

    #[test]
    fn test_policy_nodata_override() {
        let a = single("a", 0.0, 10.0, arr2(&[[1.0, ND]]));
        let out = composite(&[a], &MergePolicy::default().with_nodata(0.0), None).unwrap();
        assert_eq!(band(&out), &arr2(&[[1.0, 0.0]]));
        assert_eq!(out.band("b").unwrap().nodata, Some(0.0));
    }

    #[test]
    fn test_cancelled_run() {
        let a = single("a", 0.0, 10.0, arr2(&[[1.0]]));
        let token = CancelToken::new();
        token.cancel();
        let result = Compositor::new(MosaicConfig::default()).with_cancel(&token).run(&[a]);
        assert!(matches!(result, Err(MosaicError::Cancelled)));
    }

    struct CancelDuring<'t> {
        token: &'t CancelToken,
    }

    impl Reprojector for CancelDuring<'_> {
        fn reproject(&self, tile: &RasterTile, target_crs: &str) -> Result<RasterTile> {
            self.token.cancel();
            let mut out = tile.clone();
            out.crs = target_crs.to_string();
            Ok(out)
        }
    }

    #[test]
    fn test_cancelled_mid_run() {
        let a = single("a", 0.0, 10.0, arr2(&[[1.0]]));
        let mut b = single("b", 10.0, 10.0, arr2(&[[2.0]]));
        b.crs = "EPSG:4326".to_string();
        let token = CancelToken::new();
        let reprojector = CancelDuring { token: &token };
        let result = Compositor::new(MosaicConfig::default())
            .with_reprojector(&reprojector)
            .with_cancel(&token)
            .run(&[a, b]);
        assert!(token.is_cancelled());
        assert!(matches!(result, Err(MosaicError::Cancelled)));
    }

    #[test]
    fn test_integer_band_widened_when_nodata_unrepresentable() {
        let gt = GeoTransform::from_origin(0.0, 10.0, 10.0, 10.0).unwrap();
        let band = Band::new("b", arr2(&[[3.0, -1.0]]), Some(-1.0)).with_pixel_type(PixelType::U8);
        let tile = RasterTile::new("a", vec![band], gt, "EPSG:32633").unwrap();
        let out = composite(&[tile], &MergePolicy::default(), None).unwrap();
        let b = out.band("b").unwrap();
        assert_eq!(b.pixel_type, PixelType::F64);
        assert_eq!(b.data, arr2(&[[3.0, -1.0]]));
        assert_eq!(b.nodata, Some(-1.0));
    }

    #[test]
    fn test_integer_band_kept_when_nodata_fits() {
        let gt = GeoTransform::from_origin(0.0, 10.0, 10.0, 10.0).unwrap();
        let band = Band::new("b", arr2(&[[3.0, 0.0]]), Some(0.0)).with_pixel_type(PixelType::U8);
        let tile = RasterTile::new("a", vec![band], gt, "EPSG:32633").unwrap();
        let out = composite(&[tile], &MergePolicy::default(), None).unwrap();
        assert_eq!(out.band("b").unwrap().pixel_type, PixelType::U8);
    }

    #[test]
    fn test_nodata_taken_from_later_tile() {
        let a = tile_at("a", 0.0, 10.0, vec![("b", arr2(&[[1.0]]))], None);
        let c = tile_at("c", 20.0, 10.0, vec![("b", arr2(&[[2.0]]))], Some(ND));
        let out = composite(&[a, c], &MergePolicy::default(), None).unwrap();
        let b = out.band("b").unwrap();
        assert_eq!(b.nodata, Some(ND));
        assert_eq!(b.data, arr2(&[[1.0, ND, 2.0]]));
    }

    #[test]
    fn test_edge_blocks_fill_every_band() {
        let red = Array2::from_shape_fn((7, 9), |(r, c)| (r * 9 + c) as f64);
        let nir = red.mapv(|v| v + 100.0);
        let tile = tile_at("a", 0.0, 70.0, vec![("red", red.clone()), ("nir", nir.clone())], Some(ND));
        let config = MosaicConfig {
            block_size: 4,
            ..MosaicConfig::default()
        };
        let out = Compositor::new(config).run(&[tile]).unwrap();
        assert_eq!(out.band("red").unwrap().data, red);
        assert_eq!(out.band("nir").unwrap().data, nir);
    }

    #[test]
    fn test_policy_from_json() {
        let policy: MergePolicy =
            serde_json::from_str(r#"{"rule":{"rule":"priority_metric","prefer":"higher"},"tie_break":"last_wins"}"#)
                .unwrap();
        assert_eq!(
            policy.rule,
            MergeRule::PriorityMetric {
                prefer: ScoreOrder::Higher
            }
        );
        assert_eq!(policy.tie_break, TieBreak::LastWins);
        assert_eq!(policy.blend_nodata, BlendNodata::Exclude);
    }
}
