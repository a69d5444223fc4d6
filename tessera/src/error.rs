//! Error types.
//!
//! Pipeline errors are `Clone` because one failure of a shared load or
//! decode task is broadcast to every subscriber of that task.

use thiserror::Error;

/// Failure reported by a [`DataLoader`](crate::loader::DataLoader).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The server answered with a non-success status code.
    #[error("HTTP status {0}")]
    Status(u16),

    /// Connection, TLS or body streaming failure.
    #[error("Network error: {0}")]
    Network(String),

    /// The load was cancelled before it finished.
    #[error("Load cancelled")]
    Cancelled,
}

/// Failure reported by an [`ImageProcessor`](crate::processing::ImageProcessor).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Processor '{processor}' failed: {message}")]
pub struct ProcessingError {
    /// Identifier of the failing processor.
    pub processor: String,

    /// Human-readable reason.
    pub message: String,
}

impl ProcessingError {
    /// Creates a processing error for the given processor.
    pub fn new(processor: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            processor: processor.into(),
            message: message.into(),
        }
    }
}

/// Errors delivered to pipeline callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// The data loader failed.
    #[error("Data loading failed: {0}")]
    Transport(#[from] TransportError),

    /// The loaded data could not be decoded into an image.
    #[error("Failed to decode image data")]
    Decode,

    /// A processor failed.
    #[error(transparent)]
    Processing(#[from] ProcessingError),

    /// The work was cancelled.
    #[error("Request cancelled")]
    Cancelled,

    /// The request did not finish before its timeout.
    #[error("Request timed out")]
    Timeout,
}

impl PipelineError {
    /// Returns true for cancellation, including a cancelled transport.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled | PipelineError::Transport(TransportError::Cancelled)
        )
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The INI text is malformed.
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// A key holds a value that cannot be used.
    #[error("Invalid configuration: {key} = '{value}'")]
    InvalidValue { key: String, value: String },
}
