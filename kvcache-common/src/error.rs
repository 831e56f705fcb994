//! Internal error taxonomy.
//!
//! Per the error-handling design, nothing in this taxonomy crosses the
//! public API boundary: callers see `Option`/`bool`/missing values. This
//! type exists so the internal plumbing (manifest store, blob store, disk
//! tier) can log a specific cause before flattening the result.

use std::path::PathBuf;

/// Result alias used internally by the manifest and blob stores.
pub type CacheResult<T> = Result<T, CacheError>;

/// Internal error kinds. Never exposed on the public facade/tier API.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A caller passed an empty key or empty value.
    #[error("rejected input: {reason}")]
    InvalidInput { reason: &'static str },

    /// A single file read/write/delete failed.
    #[error("io failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A prepared statement failed to step.
    #[error("sql failure: {0}")]
    Sql(#[from] rusqlite::Error),

    /// The manifest database could not be opened even after a full reset.
    #[error("database open failed for {path}: {reason}")]
    DatabaseOpen { path: PathBuf, reason: String },

    /// A manifest row references a file that is no longer present.
    #[error("manifest row for key referenced a missing blob file")]
    MissingBlob,
}

impl CacheError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}
