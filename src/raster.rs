use crate::error::{MosaicError, Result};
use crate::pixel::PixelType;
use log::debug;
use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Affine pixel-to-world mapping in GDAL coefficient order:
/// `[origin_x, pixel_width, row_rotation, origin_y, col_rotation, pixel_height]`.
///
/// `(col, row)` addresses the upper-left corner of a pixel; pixel centres sit
/// at `(col + 0.5, row + 0.5)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform(pub [f64; 6]);

impl GeoTransform {
    pub fn new(coefficients: [f64; 6]) -> Result<Self> {
        let gt = GeoTransform(coefficients);
        gt.validate()?;
        Ok(gt)
    }

    /// North-up transform from the upper-left corner and positive pixel sizes.
    pub fn from_origin(west: f64, north: f64, pixel_width: f64, pixel_height: f64) -> Result<Self> {
        if !(pixel_width > 0.0) || !pixel_width.is_finite() {
            return Err(MosaicError::InvalidPixelSize(pixel_width));
        }
        if !(pixel_height > 0.0) || !pixel_height.is_finite() {
            return Err(MosaicError::InvalidPixelSize(pixel_height));
        }
        Ok(GeoTransform([west, pixel_width, 0.0, north, 0.0, -pixel_height]))
    }

    pub fn validate(&self) -> Result<()> {
        let gt = &self.0;
        if gt.iter().any(|c| !c.is_finite()) || gt[1] == 0.0 || gt[5] == 0.0 || self.determinant() == 0.0 {
            return Err(MosaicError::InvalidGeoTransform(self.0));
        }
        Ok(())
    }

    pub fn coefficients(&self) -> [f64; 6] {
        self.0
    }

    pub fn origin(&self) -> (f64, f64) {
        (self.0[0], self.0[3])
    }

    fn determinant(&self) -> f64 {
        self.0[1] * self.0[5] - self.0[2] * self.0[4]
    }

    /// Ground size of one pixel along its column and row axes.
    pub fn pixel_size(&self) -> (f64, f64) {
        let gt = &self.0;
        if self.is_north_up() {
            (gt[1].abs(), gt[5].abs())
        } else {
            (gt[1].hypot(gt[4]), gt[2].hypot(gt[5]))
        }
    }

    pub fn is_north_up(&self) -> bool {
        self.0[2] == 0.0 && self.0[4] == 0.0
    }

    #[inline]
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        let gt = &self.0;
        (
            gt[0] + col * gt[1] + row * gt[2],
            gt[3] + col * gt[4] + row * gt[5],
        )
    }

    /// Inverse mapping. The transform has been validated, so the
    /// determinant is non-zero.
    #[inline]
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let gt = &self.0;
        let det = self.determinant();
        let dx = x - gt[0];
        let dy = y - gt[3];
        (
            (dx * gt[5] - dy * gt[2]) / det,
            (dy * gt[1] - dx * gt[4]) / det,
        )
    }

    /// Same origin and orientation with pixels of `pixel_width` by
    /// `pixel_height` ground units. Axis directions are kept.
    pub fn with_pixel_size(&self, pixel_width: f64, pixel_height: f64) -> GeoTransform {
        let gt = &self.0;
        if self.is_north_up() {
            return GeoTransform([
                gt[0],
                pixel_width.copysign(gt[1]),
                0.0,
                gt[3],
                0.0,
                pixel_height.copysign(gt[5]),
            ]);
        }
        let (cur_w, cur_h) = self.pixel_size();
        let (fx, fy) = (pixel_width / cur_w, pixel_height / cur_h);
        GeoTransform([gt[0], gt[1] * fx, gt[2] * fy, gt[3], gt[4] * fx, gt[5] * fy])
    }

    /// World-space bounding box of a `width` x `height` pixel grid.
    pub fn bounds(&self, width: usize, height: usize) -> Bounds {
        let w = width as f64;
        let h = height as f64;
        let corners = [
            self.pixel_to_world(0.0, 0.0),
            self.pixel_to_world(w, 0.0),
            self.pixel_to_world(0.0, h),
            self.pixel_to_world(w, h),
        ];
        let mut bounds = Bounds::empty();
        for (x, y) in corners {
            bounds.include(x, y);
        }
        bounds
    }
}

/// Axis-aligned world extent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn empty() -> Self {
        Bounds {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.min_x < self.max_x && self.min_y < self.max_y)
    }

    pub fn include(&mut self, x: f64, y: f64) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// One named 2-D grid of samples, stored as `(rows, cols)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Band {
    pub name: String,
    pub data: Array2<f64>,
    pub nodata: Option<f64>,
    pub pixel_type: PixelType,
}

impl Band {
    pub fn new(name: impl Into<String>, data: Array2<f64>, nodata: Option<f64>) -> Self {
        Self {
            name: name.into(),
            data,
            nodata,
            pixel_type: PixelType::F64,
        }
    }

    pub fn with_pixel_type(mut self, pixel_type: PixelType) -> Self {
        self.pixel_type = pixel_type;
        self
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// NaN is never a valid measurement, declared nodata or not.
    #[inline]
    pub fn is_nodata(&self, value: f64) -> bool {
        is_nodata(value, self.nodata)
    }

    /// Value written where this band has no measurement.
    pub fn fill_value(&self) -> f64 {
        self.nodata.unwrap_or(f64::NAN)
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|&&v| !self.is_nodata(v)).count()
    }
}

#[inline]
pub fn is_nodata(value: f64, nodata: Option<f64>) -> bool {
    value.is_nan() || nodata.map_or(false, |nd| value == nd)
}

/// An input or intermediate raster: equally sized bands on one grid.
///
/// Stages never mutate a tile; they return a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterTile {
    /// Identity used in logs and stage errors (usually the source path).
    pub id: String,
    bands: Vec<Band>,
    pub geotransform: GeoTransform,
    pub crs: String,
    /// Scalar quality score for metric-based merging (e.g. cloud fraction).
    pub quality: Option<f64>,
}

impl RasterTile {
    pub fn new(
        id: impl Into<String>,
        bands: Vec<Band>,
        geotransform: GeoTransform,
        crs: impl Into<String>,
    ) -> Result<Self> {
        geotransform.validate()?;
        let first = bands
            .first()
            .ok_or(MosaicError::InvalidDimensions(0, 0))?;
        let (width, height) = (first.width(), first.height());
        if width == 0 || height == 0 {
            return Err(MosaicError::InvalidDimensions(width, height));
        }
        for band in &bands[1..] {
            check_shape(band, width, height)?;
        }
        let mut seen = std::collections::HashSet::new();
        for band in &bands {
            if !seen.insert(band.name.as_str()) {
                return Err(MosaicError::DuplicateBand(band.name.clone()));
            }
        }
        Ok(Self {
            id: id.into(),
            bands,
            geotransform,
            crs: crs.into(),
            quality: None,
        })
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn width(&self) -> usize {
        self.bands[0].width()
    }

    pub fn height(&self) -> usize {
        self.bands[0].height()
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }

    pub fn band_names(&self) -> impl Iterator<Item = &str> {
        self.bands.iter().map(|b| b.name.as_str())
    }

    pub fn band_index(&self, name: &str) -> Option<usize> {
        self.bands.iter().position(|b| b.name == name)
    }

    pub fn band(&self, name: &str) -> Result<&Band> {
        self.bands
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| MosaicError::UnknownBand(name.to_string()))
    }

    pub fn bounds(&self) -> Bounds {
        self.geotransform.bounds(self.width(), self.height())
    }

    /// New tile with `band` appended after the existing bands.
    pub fn with_band(&self, band: Band) -> Result<RasterTile> {
        check_shape(&band, self.width(), self.height())?;
        if self.band_index(&band.name).is_some() {
            return Err(MosaicError::DuplicateBand(band.name));
        }
        let mut bands = self.bands.clone();
        bands.push(band);
        Ok(self.derive(bands, self.geotransform))
    }

    /// New tile with the named band replaced in place.
    pub fn with_replaced_band(&self, band: Band) -> Result<RasterTile> {
        check_shape(&band, self.width(), self.height())?;
        let idx = self
            .band_index(&band.name)
            .ok_or_else(|| MosaicError::UnknownBand(band.name.clone()))?;
        let mut bands = self.bands.clone();
        bands[idx] = band;
        Ok(self.derive(bands, self.geotransform))
    }

    /// Same identity, CRS and quality on a new set of bands/grid.
    /// Callers guarantee the bands share one non-empty shape.
    pub(crate) fn derive(&self, bands: Vec<Band>, geotransform: GeoTransform) -> RasterTile {
        RasterTile {
            id: self.id.clone(),
            bands,
            geotransform,
            crs: self.crs.clone(),
            quality: self.quality,
        }
    }

    /// Extract the pixel window `[row_start, row_end) x [col_start, col_end)`.
    /// The origin moves to the window's upper-left corner.
    pub fn crop_by_pixel(
        &self,
        row_start: usize,
        row_end: usize,
        col_start: usize,
        col_end: usize,
    ) -> Result<RasterTile> {
        if row_start >= row_end || col_start >= col_end || row_end > self.height() || col_end > self.width() {
            return Err(MosaicError::InvalidDimensions(
                col_end.saturating_sub(col_start),
                row_end.saturating_sub(row_start),
            ));
        }
        debug!(
            "Cropping tile '{}' to rows {}..{}, cols {}..{}",
            self.id, row_start, row_end, col_start, col_end
        );

        let bands = self
            .bands
            .iter()
            .map(|band| Band {
                name: band.name.clone(),
                data: band.data.slice(s![row_start..row_end, col_start..col_end]).to_owned(),
                nodata: band.nodata,
                pixel_type: band.pixel_type,
            })
            .collect();

        let (x, y) = self.geotransform.pixel_to_world(col_start as f64, row_start as f64);
        let mut gt = self.geotransform.coefficients();
        gt[0] = x;
        gt[3] = y;
        Ok(self.derive(bands, GeoTransform(gt)))
    }
}

fn check_shape(band: &Band, width: usize, height: usize) -> Result<()> {
    if band.width() != width || band.height() != height {
        return Err(MosaicError::DimensionMismatch {
            band: band.name.clone(),
            expected_width: width,
            expected_height: height,
            found_width: band.width(),
            found_height: band.height(),
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray::arr2;

    /// North-up tile with 10 m pixels, one band per `(name, data)` pair.
    pub(crate) fn tile_at(
        id: &str,
        west: f64,
        north: f64,
        bands: Vec<(&str, Array2<f64>)>,
        nodata: Option<f64>,
    ) -> RasterTile {
        let bands = bands
            .into_iter()
            .map(|(name, data)| Band::new(name, data, nodata))
            .collect();
        let gt = GeoTransform::from_origin(west, north, 10.0, 10.0).unwrap();
        RasterTile::new(id, bands, gt, "EPSG:32633").unwrap()
    }

    #[test]
    fn test_world_pixel_round_trip() {
        let gt = GeoTransform::new([500_000.0, 10.0, 0.0, 4_000_000.0, 0.0, -10.0]).unwrap();
        let (x, y) = gt.pixel_to_world(3.5, 7.5);
        assert!((x - 500_035.0).abs() < 1e-9);
        assert!((y - 3_999_925.0).abs() < 1e-9);
        let (col, row) = gt.world_to_pixel(x, y);
        assert!((col - 3.5).abs() < 1e-9);
        assert!((row - 7.5).abs() < 1e-9);
    }

    #[test]
    fn test_rotated_round_trip() {
        let gt = GeoTransform::new([100.0, 2.0, 0.5, 200.0, 0.5, -2.0]).unwrap();
        let (x, y) = gt.pixel_to_world(4.0, 9.0);
        let (col, row) = gt.world_to_pixel(x, y);
        assert!((col - 4.0).abs() < 1e-9);
        assert!((row - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_rotated_pixel_size() {
        let gt = GeoTransform::new([0.0, 8.0, 6.0, 100.0, 6.0, -8.0]).unwrap();
        assert!(!gt.is_north_up());
        assert_eq!(gt.pixel_size(), (10.0, 10.0));
        let coarse = gt.with_pixel_size(20.0, 20.0);
        assert_eq!(coarse.coefficients(), [0.0, 16.0, 12.0, 100.0, 12.0, -16.0]);
        assert_eq!(coarse.pixel_size(), (20.0, 20.0));

        let north_up = GeoTransform::from_origin(0.0, 100.0, 10.0, 10.0).unwrap();
        assert!(north_up.is_north_up());
        assert_eq!(north_up.with_pixel_size(30.0, 30.0).coefficients(), [0.0, 30.0, 0.0, 100.0, 0.0, -30.0]);
    }

    #[test]
    fn test_zero_pixel_size_rejected() {
        assert!(GeoTransform::new([0.0, 0.0, 0.0, 0.0, 0.0, -1.0]).is_err());
        assert!(GeoTransform::new([0.0, 1.0, 0.0, 0.0, 0.0, 0.0]).is_err());
        assert!(GeoTransform::from_origin(0.0, 0.0, -5.0, 5.0).is_err());
    }

    #[test]
    fn test_bounds() {
        let gt = GeoTransform::from_origin(100.0, 500.0, 10.0, 20.0).unwrap();
        let b = gt.bounds(4, 3);
        assert_eq!(b.min_x, 100.0);
        assert_eq!(b.max_x, 140.0);
        assert_eq!(b.min_y, 440.0);
        assert_eq!(b.max_y, 500.0);
    }

    #[test]
    fn test_tile_rejects_mismatched_bands() {
        let gt = GeoTransform::from_origin(0.0, 0.0, 1.0, 1.0).unwrap();
        let bands = vec![
            Band::new("red", Array2::zeros((2, 2)), None),
            Band::new("nir", Array2::zeros((2, 3)), None),
        ];
        let err = RasterTile::new("t", bands, gt, "EPSG:4326").unwrap_err();
        assert!(matches!(err, MosaicError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_tile_rejects_duplicate_band_names() {
        let gt = GeoTransform::from_origin(0.0, 0.0, 1.0, 1.0).unwrap();
        let bands = vec![
            Band::new("red", Array2::zeros((2, 2)), None),
            Band::new("red", Array2::zeros((2, 2)), None),
        ];
        assert!(matches!(
            RasterTile::new("t", bands, gt, "EPSG:4326"),
            Err(MosaicError::DuplicateBand(_))
        ));
    }

    #[test]
    fn test_with_band_appends_and_preserves() {
        let tile = tile_at("t", 0.0, 20.0, vec![("red", arr2(&[[1.0, 2.0], [3.0, 4.0]]))], None);
        let out = tile
            .with_band(Band::new("nir", arr2(&[[5.0, 6.0], [7.0, 8.0]]), None))
            .unwrap();
        assert_eq!(out.band_names().collect::<Vec<_>>(), vec!["red", "nir"]);
        assert_eq!(tile.bands().len(), 1);
        assert_eq!(out.band("red").unwrap().data, tile.band("red").unwrap().data);
    }

    #[test]
    fn test_unknown_band() {
        let tile = tile_at("t", 0.0, 20.0, vec![("red", Array2::zeros((2, 2)))], None);
        assert!(matches!(tile.band("nir"), Err(MosaicError::UnknownBand(_))));
    }

    #[test]
    fn test_crop_by_pixel_moves_origin() {
        let data = arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]]);
        let tile = tile_at("t", 1000.0, 2000.0, vec![("b", data)], None);
        let cropped = tile.crop_by_pixel(1, 3, 1, 2).unwrap();
        assert_eq!(cropped.band("b").unwrap().data, arr2(&[[5.0], [8.0]]));
        assert_eq!(cropped.geotransform.origin(), (1010.0, 1990.0));
        assert!(tile.crop_by_pixel(2, 2, 0, 1).is_err());
        assert!(tile.crop_by_pixel(0, 4, 0, 1).is_err());
    }

    #[test]
    fn test_nan_always_nodata() {
        assert!(is_nodata(f64::NAN, None));
        assert!(is_nodata(-9999.0, Some(-9999.0)));
        assert!(!is_nodata(0.0, Some(-9999.0)));
    }
}
