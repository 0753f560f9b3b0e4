use std::path::PathBuf;
use thiserror::Error;

/// Everything that can stop a file (or a whole run) from being ingested.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("cannot read source {path}: {reason}")]
    SourceUnreadable { path: PathBuf, reason: String },

    #[error("GeoJSON could not be repaired: {reason}")]
    UnrepairableInput { reason: String },

    #[error("archive {path} contains {} candidate data files, expected exactly one", candidates.len())]
    AmbiguousArchive {
        path: PathBuf,
        candidates: Vec<PathBuf>,
    },

    #[error("archive {path} contains no geojson, shp or kml file")]
    ArchiveNotFound { path: PathBuf },

    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("cannot reproject from {from} to {to}: {reason}")]
    Projection {
        from: String,
        to: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("shapefile error: {0}")]
    Shapefile(#[from] shapefile::Error),

    #[error("GEOS error: {0}")]
    Geos(#[from] geos::Error),
}

impl IngestError {
    pub(crate) fn unreadable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        IngestError::SourceUnreadable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors that mark the input itself as invalid (status 2) rather than a failure.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            IngestError::AmbiguousArchive { .. }
                | IngestError::ArchiveNotFound { .. }
                | IngestError::InvalidInput { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
