//! Error types shared across stages.

use thiserror::Error;

/// A source artifact could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact {0} has no local copy to open")]
    NoLocalCopy(String),

    #[error("corrupted {0}")]
    Corrupted(String),

    #[error("unsupported artifact type: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Error surfaced at the artifact-processing boundary.
///
/// Wraps whatever went wrong so the pipeline can log it and continue with the
/// next artifact.
#[derive(Debug, Error)]
#[error("failed to process {artifact}: {source}")]
pub struct ProcessError {
    pub artifact: String,
    #[source]
    pub source: DecodeError,
}

impl ProcessError {
    pub fn new(artifact: impl Into<String>, source: impl Into<DecodeError>) -> Self {
        Self {
            artifact: artifact.into(),
            source: source.into(),
        }
    }
}
