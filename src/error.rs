use thiserror::Error;

#[derive(Error, Debug)]
pub enum MosaicError {
    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Array shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),

    #[error("Invalid pipeline configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Band '{band}' is {found_width}x{found_height}, expected {expected_width}x{expected_height}")]
    DimensionMismatch {
        band: String,
        expected_width: usize,
        expected_height: usize,
        found_width: usize,
        found_height: usize,
    },

    #[error("Unknown band: '{0}'")]
    UnknownBand(String),

    #[error("Band '{0}' already exists")]
    DuplicateBand(String),

    #[error("Pixel size is non-positive: {0}")]
    InvalidPixelSize(f64),

    #[error("Invalid geotransform {0:?}: pixel width and height must be non-zero")]
    InvalidGeoTransform([f64; 6]),

    #[error("Raster has invalid dimensions: {0}x{1}")]
    InvalidDimensions(usize, usize),

    #[error("CRS mismatch: tile '{tile}' is in '{found}', output grid is in '{expected}'")]
    CrsMismatch {
        tile: String,
        expected: String,
        found: String,
    },

    #[error("No input tiles to composite")]
    EmptyInput,

    #[error("Nodata policy violation: {0}")]
    NoDataPolicyViolation(String),

    #[error("Invalid band-math expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("Tile '{tile}' has an unusable quality score: {reason}")]
    InvalidQuality { tile: String, reason: String },

    #[error("Invalid value range: [{0}, {1}]")]
    InvalidRange(f64, f64),

    #[error("Invalid percentile clip: low={0}, high={1} (need 0 <= low < high <= 100)")]
    InvalidPercentile(f64, f64),

    #[error("Invalid block size: {0} (must be positive)")]
    InvalidBlockSize(usize),

    #[error("Invalid compression type: {0}")]
    InvalidCompression(String),

    #[error("Invalid tile size: {0} (must be multiple of 16)")]
    InvalidTileSize(usize),

    #[error("Output writing failed: {0}")]
    OutputFailed(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Tile '{tile}' failed at stage '{stage}': {source}")]
    Stage {
        tile: String,
        stage: String,
        #[source]
        source: Box<MosaicError>,
    },
}

pub type Result<T> = std::result::Result<T, MosaicError>;
