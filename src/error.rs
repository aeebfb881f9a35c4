//! Tagged error kinds for the identification/planning/execution core.
//!
//! Identification outcomes (ambiguous/contradiction/conflict-group/
//! low-confidence) are first-class results, not failures, so they never
//! appear here — they are recorded on `ScanItem`'s identification result
//! instead. See `scanner::Scanner`.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, RomSorterError>;

#[derive(thiserror::Error, Debug)]
pub enum RomSorterError {
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("failed to parse DAT file {path}: {reason}")]
    DatParse { path: PathBuf, reason: String },

    #[error("platform catalog not found")]
    CatalogMissing,

    #[error("platform catalog invalid: {reason}")]
    CatalogInvalid { reason: String },

    #[error("platform catalog is empty")]
    CatalogEmpty,

    #[error("conversion tool {tool} failed: {reason}")]
    ConversionFailed { tool: String, reason: String },

    #[error("conversion tool {tool} is not available")]
    MissingTool { tool: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl RomSorterError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RomSorterError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        RomSorterError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
