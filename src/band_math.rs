use crate::error::{MosaicError, Result};
use crate::expression::Expression;
use crate::indices::SpectralIndex;
use crate::raster::{is_nodata, Band, RasterTile};
use log::{debug, info, warn};
use ndarray::Array2;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Evaluate `expression` over every pixel of `tile` and append the result as
/// band `output_band`.
///
/// A pixel is nodata in the output when any referenced band is nodata there,
/// when a division hits a zero denominator, or when the result is not finite.
/// Such pixels are written as `nodata`, or NaN when it is `None`. Input
/// sentinels are not inherited: a band of index values can legitimately
/// hold 0 or -1.
pub fn compute(
    tile: &RasterTile,
    expression: &Expression,
    output_band: &str,
    nodata: Option<f64>,
) -> Result<RasterTile> {
    if tile.band_index(output_band).is_some() {
        return Err(MosaicError::DuplicateBand(output_band.to_string()));
    }

    let bound = expression.bind(tile)?;
    let inputs: Vec<&Band> = bound.inputs().iter().map(|&i| &tile.bands()[i]).collect();

    let (height, width) = (tile.height(), tile.width());
    for band in &inputs {
        if band.width() != width || band.height() != height {
            return Err(MosaicError::DimensionMismatch {
                band: band.name.clone(),
                expected_width: width,
                expected_height: height,
                found_width: band.width(),
                found_height: band.height(),
            });
        }
    }

    let fill = nodata.unwrap_or(f64::NAN);
    let collisions = AtomicUsize::new(0);
    info!(
        "Computing band '{}' = {} on tile '{}' ({}x{})",
        output_band, expression, tile.id, width, height
    );

    // Rows are independent: each worker owns its row buffers.
    let rows: Vec<Vec<f64>> = (0..height)
        .into_par_iter()
        .map(|row| {
            let mut values = vec![0.0; inputs.len()];
            let mut stack = Vec::with_capacity(bound.stack_capacity());
            (0..width)
                .map(|col| {
                    for (slot, band) in inputs.iter().enumerate() {
                        let v = band.data[[row, col]];
                        if is_nodata(v, band.nodata) {
                            return fill;
                        }
                        values[slot] = v;
                    }
                    match bound.evaluate(&values, &mut stack) {
                        Some(v) if Some(v) == nodata => {
                            collisions.fetch_add(1, Ordering::Relaxed);
                            fill
                        }
                        Some(v) => v,
                        None => fill,
                    }
                })
                .collect()
        })
        .collect();

    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    let data = Array2::from_shape_vec((height, width), flat)?;
    let band = Band::new(output_band, data, nodata);
    let collisions = collisions.into_inner();
    if collisions > 0 {
        warn!(
            "Band '{}' on tile '{}': {} valid results equal the nodata value {:?} and were masked",
            output_band, tile.id, collisions, nodata
        );
    }
    debug!(
        "Band '{}' on tile '{}': {} valid pixels",
        output_band,
        tile.id,
        band.valid_count()
    );

    tile.with_band(band)
}

/// Compute a named spectral index; the band name defaults to the index's
/// short name.
pub fn compute_index(
    tile: &RasterTile,
    index: &SpectralIndex,
    output_band: Option<&str>,
    nodata: Option<f64>,
) -> Result<RasterTile> {
    let expression = index.expression()?;
    compute(tile, &expression, output_band.unwrap_or(index.default_band_name()), nodata)
}
