use crate::error::{MosaicError, Result};
use crate::raster::{is_nodata, Band, GeoTransform, RasterTile};
use log::{debug, info};
use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Interpolation kernel used when a grid is sampled at fractional positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kernel {
    /// Copies the covering source pixel; exact for categorical data.
    #[default]
    Nearest,
    /// 2x2 linear interpolation between pixel centres.
    Bilinear,
    /// 4x4 cubic convolution (Keys, a = -0.5).
    Cubic,
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kernel::Nearest => "nearest",
            Kernel::Bilinear => "bilinear",
            Kernel::Cubic => "cubic",
        };
        f.write_str(name)
    }
}

impl FromStr for Kernel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" | "near" => Ok(Kernel::Nearest),
            "bilinear" => Ok(Kernel::Bilinear),
            "cubic" => Ok(Kernel::Cubic),
            other => Err(format!("unknown kernel '{}' (expected nearest, bilinear or cubic)", other)),
        }
    }
}

/// Target ground size of one pixel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelSize {
    pub width: f64,
    pub height: f64,
}

impl PixelSize {
    pub fn square(size: f64) -> Self {
        Self {
            width: size,
            height: size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for v in [self.width, self.height] {
            if !(v > 0.0) || !v.is_finite() {
                return Err(MosaicError::InvalidPixelSize(v));
            }
        }
        Ok(())
    }
}

/// Affine map from destination pixel coordinates to source pixel
/// coordinates, composed once per (source, destination) grid pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelMapping {
    origin: (f64, f64),
    col_step: (f64, f64),
    row_step: (f64, f64),
}

impl PixelMapping {
    pub fn between(src: &GeoTransform, dst: &GeoTransform) -> Self {
        let to_src = |col: f64, row: f64| {
            let (x, y) = dst.pixel_to_world(col, row);
            src.world_to_pixel(x, y)
        };
        let origin = to_src(0.0, 0.0);
        let c = to_src(1.0, 0.0);
        let r = to_src(0.0, 1.0);
        Self {
            origin,
            col_step: (c.0 - origin.0, c.1 - origin.1),
            row_step: (r.0 - origin.0, r.1 - origin.1),
        }
    }

    #[inline]
    pub fn map(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin.0 + col * self.col_step.0 + row * self.row_step.0,
            self.origin.1 + col * self.col_step.1 + row * self.row_step.1,
        )
    }
}

/// Sample `data` at continuous pixel position `(px, py)` (corner-based, so the
/// centre of pixel `(c, r)` is `(c + 0.5, r + 0.5)`).
///
/// Returns `None` outside the grid or when any neighbour with non-zero weight
/// is nodata. Interpolating kernels clamp neighbour indices at the edges.
#[inline]
pub fn sample(data: &ArrayView2<'_, f64>, nodata: Option<f64>, px: f64, py: f64, kernel: Kernel) -> Option<f64> {
    let (height, width) = data.dim();
    // also rejects NaN
    if !(px >= 0.0 && py >= 0.0 && px < width as f64 && py < height as f64) {
        return None;
    }

    match kernel {
        Kernel::Nearest => {
            let col = (px.floor() as usize).min(width - 1);
            let row = (py.floor() as usize).min(height - 1);
            let v = data[[row, col]];
            (!is_nodata(v, nodata)).then_some(v)
        }
        Kernel::Bilinear => {
            let u = px - 0.5;
            let v = py - 0.5;
            let x0 = u.floor();
            let y0 = v.floor();
            let fx = u - x0;
            let fy = v - y0;
            let wx = [1.0 - fx, fx];
            let wy = [1.0 - fy, fy];
            convolve(data, nodata, x0 as isize, y0 as isize, &wx, &wy)
        }
        Kernel::Cubic => {
            let u = px - 0.5;
            let v = py - 0.5;
            let x0 = u.floor();
            let y0 = v.floor();
            let fx = u - x0;
            let fy = v - y0;
            let wx = [keys(1.0 + fx), keys(fx), keys(1.0 - fx), keys(2.0 - fx)];
            let wy = [keys(1.0 + fy), keys(fy), keys(1.0 - fy), keys(2.0 - fy)];
            convolve(data, nodata, x0 as isize - 1, y0 as isize - 1, &wx, &wy)
        }
    }
}

/// Weighted sum over the neighbourhood starting at `(x_start, y_start)`.
#[inline]
fn convolve(
    data: &ArrayView2<'_, f64>,
    nodata: Option<f64>,
    x_start: isize,
    y_start: isize,
    wx: &[f64],
    wy: &[f64],
) -> Option<f64> {
    let (height, width) = data.dim();
    let mut acc = 0.0;
    let mut weight_sum = 0.0;
    for (j, &w_row) in wy.iter().enumerate() {
        if w_row == 0.0 {
            continue;
        }
        let row = clamp_index(y_start + j as isize, height);
        for (i, &w_col) in wx.iter().enumerate() {
            let w = w_row * w_col;
            if w == 0.0 {
                continue;
            }
            let col = clamp_index(x_start + i as isize, width);
            let value = data[[row, col]];
            if is_nodata(value, nodata) {
                return None;
            }
            acc += w * value;
            weight_sum += w;
        }
    }
    if weight_sum == 0.0 {
        return None;
    }
    Some(acc / weight_sum)
}

#[inline]
fn clamp_index(i: isize, len: usize) -> usize {
    i.clamp(0, len as isize - 1) as usize
}

/// Keys cubic convolution kernel with a = -0.5.
#[inline]
fn keys(t: f64) -> f64 {
    const A: f64 = -0.5;
    let t = t.abs();
    if t <= 1.0 {
        ((A + 2.0) * t - (A + 3.0)) * t * t + 1.0
    } else if t < 2.0 {
        ((A * t - 5.0 * A) * t + 8.0 * A) * t - 4.0 * A
    } else {
        0.0
    }
}

/// Sample one band onto a destination grid.
pub(crate) fn warp_band(
    band: &Band,
    src: &GeoTransform,
    dst: &GeoTransform,
    width: usize,
    height: usize,
    kernel: Kernel,
) -> Result<Array2<f64>> {
    let mapping = PixelMapping::between(src, dst);
    let view = band.view();
    let fill = band.fill_value();
    let pixel_type = band.pixel_type;

    let rows: Vec<Vec<f64>> = (0..height)
        .into_par_iter()
        .map(|row| {
            (0..width)
                .map(|col| {
                    let (px, py) = mapping.map(col as f64 + 0.5, row as f64 + 0.5);
                    match sample(&view, band.nodata, px, py, kernel) {
                        Some(v) => pixel_type.cast(v),
                        None => fill,
                    }
                })
                .collect()
        })
        .collect();

    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Ok(Array2::from_shape_vec((height, width), flat)?)
}

/// Resample every band of `tile` onto `width` x `height` pixels of `dst`.
pub fn resample_to_grid(
    tile: &RasterTile,
    dst: GeoTransform,
    width: usize,
    height: usize,
    kernel: Kernel,
) -> Result<RasterTile> {
    dst.validate()?;
    if width == 0 || height == 0 {
        return Err(MosaicError::InvalidDimensions(width, height));
    }
    let bands = tile
        .bands()
        .iter()
        .map(|band| {
            debug!("Resampling band '{}' of tile '{}' ({})", band.name, tile.id, kernel);
            Ok(Band {
                name: band.name.clone(),
                data: warp_band(band, &tile.geotransform, &dst, width, height, kernel)?,
                nodata: band.nodata,
                pixel_type: band.pixel_type,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(tile.derive(bands, dst))
}

/// Change the pixel size of `tile`, keeping its origin and orientation.
///
/// The new dimensions cover the original extent: `round(extent / target)`,
/// at least one pixel per axis.
pub fn resample(tile: &RasterTile, target: PixelSize, kernel: Kernel) -> Result<RasterTile> {
    target.validate()?;

    let (cur_w, cur_h) = tile.geotransform.pixel_size();
    let width = scaled_dimension(tile.width(), cur_w, target.width);
    let height = scaled_dimension(tile.height(), cur_h, target.height);
    let dst = tile.geotransform.with_pixel_size(target.width, target.height);

    info!(
        "Resampling tile '{}' from {}x{} ({:.6} x {:.6}) to {}x{} ({:.6} x {:.6}) with {} kernel",
        tile.id,
        tile.width(),
        tile.height(),
        cur_w,
        cur_h,
        width,
        height,
        target.width,
        target.height,
        kernel
    );

    resample_to_grid(tile, dst, width, height, kernel)
}

fn scaled_dimension(pixels: usize, current: f64, target: f64) -> usize {
    ((pixels as f64 * current / target).round() as usize).max(1)
}
