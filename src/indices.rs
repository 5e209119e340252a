//! Named spectral indices expressed as band-math.
//!
//! Band names follow the usual multispectral convention: `blue`, `green`,
//! `red`, `re1`/`re2`/`re3` (red edge), `nir`, `swir1`, `swir2`. Tiles with
//! other names can still use the arithmetic engine directly.

use crate::expression::Expression;
use crate::error::Result;
use serde::{Deserialize, Serialize};

fn default_l_half() -> f64 {
    0.5
}

fn default_l_one() -> f64 {
    1.0
}

fn default_evi_gain() -> f64 {
    2.5
}

fn default_evi_c1() -> f64 {
    6.0
}

fn default_evi_c2() -> f64 {
    7.5
}

fn default_evi2_gain() -> f64 {
    2.4
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "index", rename_all = "lowercase")]
pub enum SpectralIndex {
    /// Normalized Difference Vegetation Index
    Ndvi,
    /// Normalized Difference Aquatic Vegetation Index
    Ndavi,
    /// Water Adjusted Vegetation Index
    Wavi {
        #[serde(default = "default_l_half")]
        l: f64,
    },
    /// Soil Adjusted Vegetation Index
    Savi {
        #[serde(default = "default_l_half")]
        l: f64,
    },
    /// Enhanced Vegetation Index
    Evi {
        #[serde(default = "default_l_one")]
        l: f64,
        #[serde(default = "default_evi_gain")]
        gain: f64,
        #[serde(default = "default_evi_c1")]
        c1: f64,
        #[serde(default = "default_evi_c2")]
        c2: f64,
    },
    /// Two-band Enhanced Vegetation Index
    Evi2 {
        #[serde(default = "default_evi2_gain")]
        gain: f64,
        #[serde(default = "default_l_one")]
        l: f64,
    },
    /// Red-edge NDVI on red edge band 2
    Rendvi1,
    /// Red-edge NDVI on red edge band 3
    Rendvi2,
    /// Normalized Difference Water Index (McFeeters)
    Ndwi,
    /// Normalized Difference Moisture Index
    Ndmi,
    /// Modified NDWI
    Mndwi,
    /// MERIS Terrestrial Chlorophyll Index
    Mtci,
    /// Automated Water Extraction Index, no-shadow variant
    Aweinsh,
    /// Automated Water Extraction Index, shadow variant
    Aweish,
}

impl SpectralIndex {
    pub fn savi() -> Self {
        SpectralIndex::Savi { l: default_l_half() }
    }

    pub fn wavi() -> Self {
        SpectralIndex::Wavi { l: default_l_half() }
    }

    pub fn evi() -> Self {
        SpectralIndex::Evi {
            l: default_l_one(),
            gain: default_evi_gain(),
            c1: default_evi_c1(),
            c2: default_evi_c2(),
        }
    }

    pub fn evi2() -> Self {
        SpectralIndex::Evi2 {
            gain: default_evi2_gain(),
            l: default_l_one(),
        }
    }

    /// Output band name used when the caller does not pick one.
    pub fn default_band_name(&self) -> &'static str {
        match self {
            SpectralIndex::Ndvi => "ndvi",
            SpectralIndex::Ndavi => "ndavi",
            SpectralIndex::Wavi { .. } => "wavi",
            SpectralIndex::Savi { .. } => "savi",
            SpectralIndex::Evi { .. } => "evi",
            SpectralIndex::Evi2 { .. } => "evi2",
            SpectralIndex::Rendvi1 => "rendvi1",
            SpectralIndex::Rendvi2 => "rendvi2",
            SpectralIndex::Ndwi => "ndwi",
            SpectralIndex::Ndmi => "ndmi",
            SpectralIndex::Mndwi => "mndwi",
            SpectralIndex::Mtci => "mtci",
            SpectralIndex::Aweinsh => "aweinsh",
            SpectralIndex::Aweish => "aweish",
        }
    }

    pub fn formula(&self) -> String {
        match *self {
            SpectralIndex::Ndvi => "(nir - red) / (nir + red)".to_string(),
            SpectralIndex::Ndavi => "(nir - blue) / (nir + blue)".to_string(),
            SpectralIndex::Wavi { l } => format!("(1 + {l}) * ((nir - blue) / (nir + blue + {l}))"),
            SpectralIndex::Savi { l } => format!("(1 + {l}) * ((nir - red) / (nir + red + {l}))"),
            SpectralIndex::Evi { l, gain, c1, c2 } => {
                format!("{gain} * ((nir - red) / (nir + ({c1} * red) - ({c2} * blue) + {l}))")
            }
            SpectralIndex::Evi2 { gain, l } => format!("{gain} * (nir - red) / (nir + red + {l})"),
            SpectralIndex::Rendvi1 => "(nir - re2) / (nir + re2)".to_string(),
            SpectralIndex::Rendvi2 => "(nir - re3) / (nir + re3)".to_string(),
            SpectralIndex::Ndwi => "(green - nir) / (green + nir)".to_string(),
            SpectralIndex::Ndmi => "(nir - swir1) / (nir + swir1)".to_string(),
            SpectralIndex::Mndwi => "(green - swir1) / (green + swir1)".to_string(),
            SpectralIndex::Mtci => "(re2 - re1) / (re1 - red)".to_string(),
            SpectralIndex::Aweinsh => "(4 * (green - swir1)) - ((0.25 * nir) + (2.75 * swir2))".to_string(),
            SpectralIndex::Aweish => {
                "blue + (2.5 * green) - (1.5 * (nir + swir1)) - (0.25 * swir2)".to_string()
            }
        }
    }

    pub fn expression(&self) -> Result<Expression> {
        Expression::parse(&self.formula())
    }
}
