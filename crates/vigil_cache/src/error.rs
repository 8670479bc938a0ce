//! Cache error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in the caching layer.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A query source failed to compile.
    #[error("Failed to compile query '{key}': {message}")]
    Compile { key: String, message: String },

    /// No source is available for a query key.
    #[error("Query source not found: {0}")]
    SourceNotFound(String),

    /// A bundle manifest or data file could not be parsed.
    #[error("Invalid bundle at {}: {message}", path.display())]
    InvalidBundle { path: PathBuf, message: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Creates a compile error.
    pub fn compile(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compile {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid bundle error.
    pub fn invalid_bundle(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidBundle {
            path: path.into(),
            message: message.into(),
        }
    }
}
