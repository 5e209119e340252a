use crate::error::{MosaicError, Result};
use crate::pixel::PixelType;
use crate::raster::{is_nodata, Band, RasterTile};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Inclusive value interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Result<Self> {
        let range = Self { min, max };
        range.validate()?;
        Ok(range)
    }

    pub fn unit() -> Self {
        Self { min: 0.0, max: 1.0 }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.min.is_finite() || !self.max.is_finite() || self.min > self.max {
            return Err(MosaicError::InvalidRange(self.min, self.max));
        }
        Ok(())
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// How the source interval of a stretch is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RescaleMethod {
    /// Fixed source interval.
    Linear { min: f64, max: f64 },
    /// Source interval taken from the band's valid-pixel percentiles.
    PercentileClip { low: f64, high: f64 },
    /// Source interval is the band's observed valid min/max.
    Normalize,
}

impl RescaleMethod {
    pub fn validate(&self) -> Result<()> {
        match *self {
            RescaleMethod::Linear { min, max } => ValueRange { min, max }.validate(),
            RescaleMethod::PercentileClip { low, high } => {
                if !(0.0..=100.0).contains(&low) || !(0.0..=100.0).contains(&high) || low >= high {
                    return Err(MosaicError::InvalidPercentile(low, high));
                }
                Ok(())
            }
            RescaleMethod::Normalize => Ok(()),
        }
    }

    /// Resolve the source interval for `band`. `None` when the band has no
    /// valid pixels to take statistics from.
    fn source_range(&self, band: &Band) -> Option<(f64, f64)> {
        match *self {
            RescaleMethod::Linear { min, max } => Some((min, max)),
            RescaleMethod::PercentileClip { low, high } => {
                let mut valid = valid_values(band);
                if valid.is_empty() {
                    return None;
                }
                valid.sort_unstable_by(f64::total_cmp);
                Some((percentile(&valid, low), percentile(&valid, high)))
            }
            RescaleMethod::Normalize => {
                let valid = valid_values(band);
                let min = valid.iter().copied().reduce(f64::min)?;
                let max = valid.iter().copied().reduce(f64::max)?;
                Some((min, max))
            }
        }
    }
}

fn valid_values(band: &Band) -> Vec<f64> {
    band.data.iter().copied().filter(|&v| !band.is_nodata(v)).collect()
}

/// Percentile `p` (0..=100) of sorted `values` with linear interpolation
/// between order statistics.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Linearly stretch band `band_name` from the interval chosen by `method` to
/// `target`, clamping so every valid output lies in `target`.
///
/// Nodata pixels are excluded from statistics and stay nodata. When
/// `output_type` is given the band is converted to it (integer types round).
/// Fails with `NoDataPolicyViolation` if the band's nodata value would be
/// indistinguishable from a valid output value.
pub fn rescale(
    tile: &RasterTile,
    band_name: &str,
    method: &RescaleMethod,
    target: ValueRange,
    output_type: Option<PixelType>,
) -> Result<RasterTile> {
    method.validate()?;
    target.validate()?;
    let band = tile.band(band_name)?;
    let pixel_type = output_type.unwrap_or(band.pixel_type);

    if pixel_type.is_integer() && (target.min < pixel_type.value_range().0 || target.max > pixel_type.value_range().1) {
        return Err(MosaicError::InvalidRange(target.min, target.max));
    }
    // Integer outputs are clamped to the whole numbers inside the target.
    let bounds = if pixel_type.is_integer() {
        let (lo, hi) = (target.min.ceil(), target.max.floor());
        if lo > hi {
            return Err(MosaicError::InvalidRange(target.min, target.max));
        }
        ValueRange { min: lo, max: hi }
    } else {
        target
    };

    let nodata = match band.nodata {
        Some(nd) => {
            if !pixel_type.can_represent(nd) {
                return Err(MosaicError::NoDataPolicyViolation(format!(
                    "nodata value {} of band '{}' cannot be stored as {:?}",
                    nd, band_name, pixel_type
                )));
            }
            if target.contains(nd) {
                return Err(MosaicError::NoDataPolicyViolation(format!(
                    "nodata value {} of band '{}' lies inside target range [{}, {}]",
                    nd, band_name, target.min, target.max
                )));
            }
            Some(nd)
        }
        None => {
            if pixel_type.is_integer() && band.data.iter().any(|v| v.is_nan()) {
                return Err(MosaicError::NoDataPolicyViolation(format!(
                    "band '{}' marks missing pixels with NaN but has no nodata value for {:?} output",
                    band_name, pixel_type
                )));
            }
            None
        }
    };
    let fill = nodata.unwrap_or(f64::NAN);

    let data = match method.source_range(band) {
        Some((lo, hi)) => {
            info!(
                "Rescaling band '{}' of tile '{}': [{}, {}] -> [{}, {}] as {:?}",
                band_name, tile.id, lo, hi, target.min, target.max, pixel_type
            );
            let span = hi - lo;
            if span == 0.0 {
                warn!(
                    "Band '{}' of tile '{}' has a degenerate source range at {}; valid pixels map to {}",
                    band_name, tile.id, lo, target.min
                );
            }
            let scale = if span == 0.0 { 0.0 } else { (target.max - target.min) / span };
            band.data.mapv(|v| {
                if is_nodata(v, band.nodata) {
                    return fill;
                }
                let stretched = target.min + (v - lo) * scale;
                pixel_type.cast(stretched.clamp(target.min, target.max)).clamp(bounds.min, bounds.max)
            })
        }
        None => {
            debug!("Band '{}' of tile '{}' has no valid pixels", band_name, tile.id);
            band.data.mapv(|_| fill)
        }
    };

    let rescaled = Band {
        name: band.name.clone(),
        data,
        nodata,
        pixel_type,
    };
    tile.with_replaced_band(rescaled)
}
