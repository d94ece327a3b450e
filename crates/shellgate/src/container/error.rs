//! Container supervisor error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The container command exceeded its deadline.
    #[error("container {command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Image was not found and could not be built.
    #[error("image unavailable: {0}")]
    ImageUnavailable(String),

    /// The engine reported a successful removal that did not happen.
    #[error("container {0} still present after removal")]
    RemovalIncomplete(String),

    /// Failed to parse container engine output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
