//! Server error types.

use thiserror::Error;
use vigil_core::LinterError;

/// Errors that can occur while running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Linter error (configuration, engine, ...).
    #[error(transparent)]
    Linter(#[from] LinterError),

    /// A worker queue was closed, which means the scheduler shut down.
    #[error("Queue '{0}' is closed")]
    QueueClosed(&'static str),

    /// A blocking task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
