//! CRS identifiers and the reprojection seam.
//!
//! The core treats a CRS as an opaque identifier. Two identifiers name the
//! same CRS when they normalise to the same string; actual coordinate
//! transformation is delegated to a [`Reprojector`] supplied by the caller.

use crate::error::Result;
use crate::raster::RasterTile;

/// Canonical spelling of a CRS identifier: trimmed, `EPSG:<code>` for any
/// recognised EPSG form, otherwise the trimmed input.
pub fn normalize_crs(id: &str) -> String {
    let trimmed = id.trim();
    let upper = trimmed.to_ascii_uppercase();

    let code = upper
        .strip_prefix("EPSG:")
        .or_else(|| upper.strip_prefix("URN:OGC:DEF:CRS:EPSG::"))
        .or_else(|| upper.strip_prefix("HTTP://WWW.OPENGIS.NET/DEF/CRS/EPSG/0/"));

    match code {
        Some(code) if !code.is_empty() && code.chars().all(|c| c.is_ascii_digit()) => format!("EPSG:{}", code),
        _ => trimmed.to_string(),
    }
}

pub fn same_crs(a: &str, b: &str) -> bool {
    normalize_crs(a) == normalize_crs(b)
}

/// Moves a tile into another CRS. Implementations own whatever projection
/// database they need; nothing is looked up from process-wide state.
pub trait Reprojector: Send + Sync {
    fn reproject(&self, tile: &RasterTile, target_crs: &str) -> Result<RasterTile>;
}

/// Resolve a GDAL projection string to an `EPSG:<code>` identifier when the
/// authority is known, otherwise keep the WKT as the identifier.
#[cfg(feature = "gdal")]
pub fn crs_from_wkt(projection_wkt: &str) -> String {
    use gdal::spatial_ref::SpatialRef;
    use log::{debug, warn};

    if projection_wkt.trim().is_empty() {
        warn!("Input raster has no CRS; tiles can only be combined with other CRS-less tiles");
        return String::new();
    }

    let spatial_ref = match SpatialRef::from_wkt(projection_wkt) {
        Ok(sr) => sr,
        Err(e) => {
            warn!("Failed to parse projection WKT, using it verbatim as CRS identifier: {}", e);
            return projection_wkt.to_string();
        }
    };

    if spatial_ref.is_projected() {
        debug!("Projected CRS, linear units = {:.6}", spatial_ref.linear_units());
    } else if spatial_ref.is_geographic() {
        debug!("Geographic CRS");
    }

    match (spatial_ref.auth_name(), spatial_ref.auth_code()) {
        (Ok(name), Ok(code)) if name.eq_ignore_ascii_case("EPSG") => format!("EPSG:{}", code),
        _ => {
            debug!("CRS has no EPSG authority code, using WKT as identifier");
            projection_wkt.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_epsg_forms() {
        assert_eq!(normalize_crs("EPSG:32633"), "EPSG:32633");
        assert_eq!(normalize_crs(" epsg:32633 "), "EPSG:32633");
        assert_eq!(normalize_crs("urn:ogc:def:crs:EPSG::4326"), "EPSG:4326");
        assert_eq!(normalize_crs("http://www.opengis.net/def/crs/EPSG/0/3857"), "EPSG:3857");
    }

    #[test]
    fn test_opaque_identifiers_kept() {
        assert_eq!(normalize_crs("  +proj=longlat +datum=WGS84 "), "+proj=longlat +datum=WGS84");
        assert_eq!(normalize_crs("EPSG:abc"), "EPSG:abc");
    }

    #[test]
    fn test_same_crs() {
        assert!(same_crs("EPSG:4326", "epsg:4326"));
        assert!(!same_crs("EPSG:4326", "EPSG:3857"));
        assert!(same_crs("", ""));
    }
}
