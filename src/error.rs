//! Error types shared by the scanner, the loaders and the sink.
//!
//! Library code returns [`LoadError`]; the command layer wraps it with
//! `anyhow` context before it reaches the user.

use thiserror::Error;

pub type LoadResult<T> = std::result::Result<T, LoadError>;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Source '{name}' is unavailable: {reason}")]
    SourceUnavailable { name: String, reason: String },
    #[error("Column '{column}' not found in source (available: {available})")]
    SchemaMismatch { column: String, available: String },
    #[error("Invalid column mapping: {0}")]
    InvalidMapping(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Loading chunk {chunk_index} into '{table}' failed: {cause}")]
    LoadFailed {
        table: String,
        chunk_index: usize,
        #[source]
        cause: SinkError,
    },
    #[error("Upstream API error: {0}")]
    UpstreamApi(String),
}

impl LoadError {
    pub(crate) fn source_unavailable(name: &str, reason: impl std::fmt::Display) -> Self {
        LoadError::SourceUnavailable {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn schema_mismatch(column: &str, available: &[String]) -> Self {
        LoadError::SchemaMismatch {
            column: column.to_string(),
            available: available.join(", "),
        }
    }
}

/// Failures raised by a database sink while a session is open.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Postgres(#[from] postgres::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Session for '{0}' is already closed")]
    Closed(String),
    #[error("{0}")]
    Rejected(String),
}
