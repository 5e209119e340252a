use crate::crs::same_crs;
use crate::error::{MosaicError, Result};
use crate::raster::{Bounds, GeoTransform, RasterTile};
use crate::resample::PixelSize;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;

/// Fractional pixel counts closer than this to an integer are taken as that
/// integer, so extents that are exact multiples of the pixel size don't gain
/// a spurious extra column from floating-point noise.
const SNAP_EPSILON: f64 = 1e-6;

/// Target grid of a mosaic: geotransform, CRS and pixel dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputGrid {
    pub geotransform: GeoTransform,
    pub crs: String,
    pub width: usize,
    pub height: usize,
}

impl OutputGrid {
    pub fn new(geotransform: GeoTransform, crs: impl Into<String>, width: usize, height: usize) -> Result<Self> {
        let grid = Self {
            geotransform,
            crs: crs.into(),
            width,
            height,
        };
        grid.validate()?;
        Ok(grid)
    }

    pub fn validate(&self) -> Result<()> {
        self.geotransform.validate()?;
        if self.width == 0 || self.height == 0 {
            return Err(MosaicError::InvalidDimensions(self.width, self.height));
        }
        Ok(())
    }

    /// Grid of an existing tile, used as a model for the mosaic extent.
    pub fn from_reference(tile: &RasterTile) -> Self {
        Self {
            geotransform: tile.geotransform,
            crs: tile.crs.clone(),
            width: tile.width(),
            height: tile.height(),
        }
    }

    /// North-up grid covering `bounds` at `resolution`, anchored at the
    /// upper-left corner.
    pub fn covering(bounds: &Bounds, resolution: PixelSize, crs: impl Into<String>) -> Result<Self> {
        resolution.validate()?;
        if bounds.is_empty() {
            return Err(MosaicError::InvalidDimensions(0, 0));
        }
        let width = pixel_count(bounds.width(), resolution.width);
        let height = pixel_count(bounds.height(), resolution.height);
        let geotransform = GeoTransform::from_origin(bounds.min_x, bounds.max_y, resolution.width, resolution.height)?;
        Self::new(geotransform, crs, width, height)
    }

    /// Smallest north-up grid covering every tile's extent, at `resolution`
    /// or, if `None`, the finest pixel size among the tiles.
    pub fn from_tiles<T: Borrow<RasterTile>>(tiles: &[T], resolution: Option<PixelSize>) -> Result<Self> {
        let first: &RasterTile = tiles.first().ok_or(MosaicError::EmptyInput)?.borrow();
        for tile in tiles[1..].iter().map(Borrow::borrow) {
            if !same_crs(&tile.crs, &first.crs) {
                return Err(MosaicError::CrsMismatch {
                    tile: tile.id.clone(),
                    expected: first.crs.clone(),
                    found: tile.crs.clone(),
                });
            }
        }

        for tile in tiles.iter().map(Borrow::borrow) {
            if !tile.geotransform.is_north_up() {
                debug!(
                    "Tile '{}' has a rotated geotransform {:?}; it is resampled onto the north-up output grid",
                    tile.id,
                    tile.geotransform.coefficients()
                );
            }
        }

        let bounds = tiles
            .iter()
            .map(|t| t.borrow().bounds())
            .fold(Bounds::empty(), |acc, b| acc.union(&b));

        let resolution = match resolution {
            Some(res) => res,
            None => {
                let (w, h) = tiles
                    .iter()
                    .map(|t| t.borrow().geotransform.pixel_size())
                    .fold((f64::INFINITY, f64::INFINITY), |(w, h), (tw, th)| (w.min(tw), h.min(th)));
                debug!("Finest input resolution: {:.6} x {:.6}", w, h);
                PixelSize { width: w, height: h }
            }
        };

        let grid = Self::covering(&bounds, resolution, first.crs.clone())?;
        info!(
            "Output grid: {}x{} pixels at {:.6} x {:.6}, origin ({:.6}, {:.6})",
            grid.width,
            grid.height,
            resolution.width,
            resolution.height,
            bounds.min_x,
            bounds.max_y
        );
        Ok(grid)
    }

    pub fn bounds(&self) -> Bounds {
        self.geotransform.bounds(self.width, self.height)
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }
}

fn pixel_count(extent: f64, pixel: f64) -> usize {
    let n = extent / pixel;
    let snapped = if (n - n.round()).abs() < SNAP_EPSILON { n.round() } else { n.ceil() };
    (snapped as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::tests::tile_at;
    use crate::raster::Band;
    use ndarray::Array2;

    #[test]
    fn test_single_tile_grid_matches_tile() {
        let tile = tile_at("a", 500_000.0, 4_000_000.0, vec![("b", Array2::zeros((3, 4)))], None);
        let grid = OutputGrid::from_tiles(std::slice::from_ref(&tile), None).unwrap();
        assert_eq!(grid, OutputGrid::from_reference(&tile));
    }

    #[test]
    fn test_union_of_disjoint_tiles() {
        let a = tile_at("a", 0.0, 100.0, vec![("b", Array2::zeros((2, 2)))], None);
        let b = tile_at("b", 40.0, 60.0, vec![("b", Array2::zeros((2, 3)))], None);
        let grid = OutputGrid::from_tiles(&[a, b], None).unwrap();
        // x: 0..70, y: 40..100
        assert_eq!((grid.width, grid.height), (7, 6));
        assert_eq!(grid.geotransform.coefficients(), [0.0, 10.0, 0.0, 100.0, 0.0, -10.0]);
    }

    #[test]
    fn test_finest_resolution_wins() {
        let a = tile_at("a", 0.0, 100.0, vec![("b", Array2::zeros((2, 2)))], None);
        let gt = GeoTransform::from_origin(0.0, 100.0, 5.0, 5.0).unwrap();
        let fine = RasterTile::new("fine", vec![Band::new("b", Array2::zeros((2, 2)), None)], gt, "EPSG:32633").unwrap();
        let grid = OutputGrid::from_tiles(&[a, fine], None).unwrap();
        assert_eq!(grid.geotransform.pixel_size(), (5.0, 5.0));
        assert_eq!((grid.width, grid.height), (4, 4));
    }

    #[test]
    fn test_explicit_resolution_rounds_up() {
        let a = tile_at("a", 0.0, 100.0, vec![("b", Array2::zeros((3, 3)))], None);
        let grid = OutputGrid::from_tiles(&[a], Some(PixelSize::square(20.0))).unwrap();
        // 30 m extent at 20 m needs two pixels
        assert_eq!((grid.width, grid.height), (2, 2));
    }

    #[test]
    fn test_rotated_tile_gets_north_up_grid() {
        // 10 m pixels rotated by atan(6/8)
        let gt = GeoTransform::new([0.0, 8.0, 6.0, 100.0, 6.0, -8.0]).unwrap();
        assert!(!gt.is_north_up());
        assert_eq!(gt.pixel_size(), (10.0, 10.0));
        let tile = RasterTile::new("rot", vec![Band::new("b", Array2::zeros((2, 2)), None)], gt, "EPSG:32633").unwrap();

        let grid = OutputGrid::from_tiles(&[tile], None).unwrap();
        assert!(grid.geotransform.is_north_up());
        // corners span x 0..28, y 84..112
        assert_eq!(grid.geotransform.coefficients(), [0.0, 10.0, 0.0, 112.0, 0.0, -10.0]);
        assert_eq!((grid.width, grid.height), (3, 3));
    }

    #[test]
    fn test_empty_and_mixed_crs() {
        assert!(matches!(OutputGrid::from_tiles::<RasterTile>(&[], None), Err(MosaicError::EmptyInput)));
        let a = tile_at("a", 0.0, 100.0, vec![("b", Array2::zeros((2, 2)))], None);
        let mut b = a.clone();
        b.crs = "EPSG:4326".to_string();
        assert!(matches!(
            OutputGrid::from_tiles(&[a, b], None),
            Err(MosaicError::CrsMismatch { .. })
        ));
    }
}
