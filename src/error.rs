use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdlError {
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Array shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Feature '{feature}' does not intersect the raster extent")]
    EmptyIntersection { feature: String },

    #[error("Feature '{feature}' has an unusable geometry: {reason}")]
    InvalidGeometry { feature: String, reason: String },

    #[error("Invalid remap spec: {0}")]
    InvalidRemapSpec(String),

    #[error("Invalid chunk size: {0} (must be positive)")]
    InvalidChunkSize(usize),

    #[error("Raster has invalid dimensions: {0}x{1}")]
    InvalidDimensions(usize, usize),

    #[error("Pixel size is non-positive: {0}")]
    InvalidPixelSize(f64),

    #[error("Raster {path:?} is rotated; only north-up rasters are supported")]
    RotatedRaster { path: String },

    #[error("Required path does not exist: {0:?}")]
    MissingPath(PathBuf),

    #[error("No '*_30m_cdls.tif' rasters found in {0:?}")]
    EmptyArchive(PathBuf),

    #[error("Layer '{layer}' not found in {path:?}")]
    LayerNotFound { path: PathBuf, layer: String },

    #[error("Field '{field}' not found in layer '{layer}'")]
    FieldNotFound { layer: String, field: String },

    #[error("CRS error: {0}")]
    CrsError(String),

    #[error("Invalid compression type: {0}")]
    InvalidCompression(String),

    #[error("Invalid tile size: {0} (must be multiple of 16)")]
    InvalidTileSize(usize),

    #[error("Year {year} failed: {source}")]
    YearFailed {
        year: u16,
        #[source]
        source: Box<CdlError>,
    },

    #[error("Chunk '{chunk}' failed: {source}")]
    ChunkFailed {
        chunk: String,
        #[source]
        source: Box<CdlError>,
    },

    #[error("{0} chunk(s) failed; see the log for details")]
    ChunksFailed(usize),

    #[error("Interrupted by operator")]
    Interrupted,
}

impl CdlError {
    /// Errors that only invalidate a single feature; the batch continues.
    pub fn is_recoverable_per_feature(&self) -> bool {
        matches!(
            self,
            CdlError::EmptyIntersection { .. } | CdlError::InvalidGeometry { .. }
        )
    }

    pub fn in_year(self, year: u16) -> Self {
        match self {
            CdlError::Interrupted => CdlError::Interrupted,
            other => CdlError::YearFailed {
                year,
                source: Box::new(other),
            },
        }
    }

    pub fn in_chunk(self, chunk: &str) -> Self {
        match self {
            CdlError::Interrupted => CdlError::Interrupted,
            other => CdlError::ChunkFailed {
                chunk: chunk.to_string(),
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, CdlError>;
