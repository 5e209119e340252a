//! GeoTIFF adapter between GDAL datasets and [`RasterTile`].

use crate::cog::{self, WriteOptions};
use crate::crs::crs_from_wkt;
use crate::error::{MosaicError, Result};
use crate::pixel::PixelType;
use crate::raster::{Band, GeoTransform, RasterTile};
use gdal::cpl::CslStringList;
use gdal::raster::{Buffer, GdalDataType, GdalType, RasterBand};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager, Metadata};
use log::{debug, info, warn};
use ndarray::Array2;
use std::path::Path;

fn pixel_type_of(band: &RasterBand) -> PixelType {
    match band.band_type() {
        GdalDataType::UInt8 => PixelType::U8,
        GdalDataType::UInt16 => PixelType::U16,
        GdalDataType::Int16 => PixelType::I16,
        GdalDataType::UInt32 => PixelType::U32,
        GdalDataType::Int32 => PixelType::I32,
        GdalDataType::Float32 => PixelType::F32,
        _ => PixelType::F64,
    }
}

/// Read every band of a raster file as a tile. The tile id is the file stem;
/// band names come from band descriptions, falling back to `band_<n>`.
pub fn read_tile<P: AsRef<Path>>(path: P) -> Result<RasterTile> {
    let path = path.as_ref();
    info!("Opening input raster: {}", path.display());
    let dataset = Dataset::open(path)?;

    let (width, height) = dataset.raster_size();
    if width == 0 || height == 0 {
        return Err(MosaicError::InvalidDimensions(width, height));
    }
    let geotransform = GeoTransform::new(dataset.geo_transform()?)?;
    let crs = crs_from_wkt(&dataset.projection());

    let band_count = dataset.raster_count() as usize;
    let mut bands = Vec::with_capacity(band_count);
    for index in 1..=band_count {
        let rasterband = dataset.rasterband(index)?;
        let name = match rasterband.description() {
            Ok(desc) if !desc.trim().is_empty() => desc.trim().to_string(),
            _ => format!("band_{}", index),
        };
        let nodata = rasterband.no_data_value();
        let pixel_type = pixel_type_of(&rasterband);

        let buffer = rasterband.read_as::<f64>((0, 0), (width, height), (width, height), None)?;
        let data_vec: Vec<f64> = buffer.into_iter().collect();
        let data = Array2::from_shape_vec((height, width), data_vec)?;

        debug!(
            "Band {} '{}': {:?}, nodata={:?}",
            index, name, pixel_type, nodata
        );
        bands.push(Band::new(name, data, nodata).with_pixel_type(pixel_type));
    }

    let id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    info!(
        "Read tile '{}': {}x{} pixels, {} bands, CRS '{}'",
        id, width, height, bands.len(), crs
    );
    RasterTile::new(id, bands, geotransform, crs)
}

fn write_band<T: GdalType + Copy>(
    dataset: &Dataset,
    index: usize,
    band: &Band,
    pixel_type: PixelType,
    convert: impl Fn(f64) -> T,
) -> Result<()> {
    let mut raster_band = dataset.rasterband(index)?;
    let (width, height) = (band.width(), band.height());

    // Array2 iterates in row-major order, as GDAL expects
    let values: Vec<T> = band.data.iter().map(|&v| convert(pixel_type.cast(v))).collect();
    let mut buffer = Buffer::new((width, height), values);
    raster_band.write((0, 0), (width, height), &mut buffer)?;

    raster_band.set_description(&band.name)?;
    match band.nodata {
        Some(nd) => raster_band.set_no_data_value(Some(nd))?,
        None if !pixel_type.is_integer() => raster_band.set_no_data_value(Some(f64::NAN))?,
        None => {}
    }
    debug!("Wrote band {} '{}' as {:?}", index, band.name, pixel_type);
    Ok(())
}

/// Write `tile` as a tiled multi-band GeoTIFF. The sample type follows the
/// bands' pixel types unless `options` forces a float type.
pub fn write_tile<P: AsRef<Path>>(path: P, tile: &RasterTile, options: &WriteOptions) -> Result<()> {
    options.validate()?;
    let path = path.as_ref();
    info!("Creating output raster: {}", path.display());

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let mut gdal_options = CslStringList::new();
    for opt in options.creation_options() {
        gdal_options.add_string(&opt)?;
    }

    let pixel_type = options.output_type.resolve(tile.bands().iter().map(|b| b.pixel_type));
    for band in tile.bands() {
        if let Some(nd) = band.nodata {
            if !pixel_type.can_represent(nd) {
                return Err(MosaicError::NoDataPolicyViolation(format!(
                    "nodata value {} of band '{}' cannot be written as {:?}",
                    nd, band.name, pixel_type
                )));
            }
        }
    }

    let (width, height, count) = (tile.width(), tile.height(), tile.bands().len());
    debug!("Output sample type: {:?}", pixel_type);
    let mut dataset = match pixel_type {
        PixelType::U8 => driver.create_with_band_type_with_options::<u8, _>(path, width, height, count, &gdal_options)?,
        PixelType::U16 => {
            driver.create_with_band_type_with_options::<u16, _>(path, width, height, count, &gdal_options)?
        }
        PixelType::I16 => {
            driver.create_with_band_type_with_options::<i16, _>(path, width, height, count, &gdal_options)?
        }
        PixelType::U32 => {
            driver.create_with_band_type_with_options::<u32, _>(path, width, height, count, &gdal_options)?
        }
        PixelType::I32 => {
            driver.create_with_band_type_with_options::<i32, _>(path, width, height, count, &gdal_options)?
        }
        PixelType::F32 => {
            driver.create_with_band_type_with_options::<f32, _>(path, width, height, count, &gdal_options)?
        }
        PixelType::F64 => {
            driver.create_with_band_type_with_options::<f64, _>(path, width, height, count, &gdal_options)?
        }
    };

    dataset.set_geo_transform(&tile.geotransform.coefficients())?;
    if tile.crs.trim().is_empty() {
        warn!("Tile '{}' has no CRS; output will not be georeferenced", tile.id);
    } else {
        let wkt = SpatialRef::from_definition(&tile.crs)?.to_wkt()?;
        dataset.set_projection(&wkt)?;
    }

    // values are already cast to the integer range, so `as` only drops the
    // (zero) fraction
    for (i, band) in tile.bands().iter().enumerate() {
        let index = i + 1;
        match pixel_type {
            PixelType::U8 => write_band(&dataset, index, band, pixel_type, |v| v as u8)?,
            PixelType::U16 => write_band(&dataset, index, band, pixel_type, |v| v as u16)?,
            PixelType::I16 => write_band(&dataset, index, band, pixel_type, |v| v as i16)?,
            PixelType::U32 => write_band(&dataset, index, band, pixel_type, |v| v as u32)?,
            PixelType::I32 => write_band(&dataset, index, band, pixel_type, |v| v as i32)?,
            PixelType::F32 => write_band(&dataset, index, band, pixel_type, |v| v as f32)?,
            PixelType::F64 => write_band(&dataset, index, band, pixel_type, |v| v)?,
        }
    }

    cog::validate_tiled(&dataset)?;
    if options.overviews {
        cog::build_overviews(&mut dataset, &options.overview_resampling)?;
    }

    info!("Successfully wrote {} bands to output", count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn byte_tile() -> RasterTile {
        let gt = GeoTransform::new([500000.0, 10.0, 0.0, 4100000.0, 0.0, -10.0]).unwrap();
        let band = Band::new("red", arr2(&[[0.0, 7.0, 255.0], [12.0, 0.0, 3.0]]), Some(0.0))
            .with_pixel_type(PixelType::U8);
        RasterTile::new("bytes", vec![band], gt, "EPSG:32633").unwrap()
    }

    #[test]
    fn test_write_keeps_band_pixel_type() {
        let path = std::env::temp_dir().join(format!("raster_mosaic_u8_{}.tif", std::process::id()));
        let options = WriteOptions {
            tile_size: 16,
            ..WriteOptions::default()
        };
        write_tile(&path, &byte_tile(), &options).unwrap();

        let tile = read_tile(&path).unwrap();
        let band = &tile.bands()[0];
        assert_eq!(band.pixel_type, PixelType::U8);
        assert_eq!(band.nodata, Some(0.0));
        assert_eq!(band.name, "red");
        assert_eq!(band.data, arr2(&[[0.0, 7.0, 255.0], [12.0, 0.0, 3.0]]));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_write_rejects_nodata_outside_output_type() {
        let gt = GeoTransform::new([0.0, 1.0, 0.0, 2.0, 0.0, -1.0]).unwrap();
        let band = Band::new("b", arr2(&[[1.0, 2.0]]), Some(-1.0)).with_pixel_type(PixelType::I16);
        let wide = Band::new("c", arr2(&[[1.0, 2.0]]), Some(-1.0)).with_pixel_type(PixelType::U8);
        let tile = RasterTile::new("t", vec![band, wide], gt, "EPSG:4326").unwrap();
        // I16 and U8 widen to I16, which holds -1
        assert_eq!(
            WriteOptions::default().output_type.resolve(tile.bands().iter().map(|b| b.pixel_type)),
            PixelType::I16
        );

        let bad = RasterTile::new(
            "t",
            vec![Band::new("b", arr2(&[[1.0, 2.0]]), Some(-1.0)).with_pixel_type(PixelType::U16)],
            gt,
            "EPSG:4326",
        )
        .unwrap();
        let path = std::env::temp_dir().join(format!("raster_mosaic_bad_{}.tif", std::process::id()));
        let result = write_tile(&path, &bad, &WriteOptions::default());
        assert!(matches!(result, Err(MosaicError::NoDataPolicyViolation(_))));
    }
}
