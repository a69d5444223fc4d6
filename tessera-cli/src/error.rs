//! CLI error handling with user-friendly messages.

use std::fmt;
use std::path::PathBuf;
use std::process;

use tessera::error::{ConfigError, TransportError};

/// CLI-specific errors.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Configuration file could not be loaded
    Config(ConfigError),
    /// Invalid command line value
    InvalidArgument(String),
    /// Failed to start the async runtime
    Runtime(std::io::Error),
    /// Failed to create the HTTP client
    Http(TransportError),
    /// Failed to write an output file
    FileWrite { path: PathBuf, error: String },
    /// Benchmark setup failed
    Bench(String),
    /// Some fetches did not succeed
    Failed { failed: usize, total: usize },
}

impl CliError {
    /// Exit the process with an error message and a non-zero code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);
        if let CliError::Config(_) = self {
            eprintln!();
            eprintln!("Expected sections: [pipeline], [rate_limiter], [memory_cache]");
        }
        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "Failed to initialize logging: {}", msg),
            CliError::Config(e) => write!(f, "Invalid configuration: {}", e),
            CliError::InvalidArgument(msg) => write!(f, "{}", msg),
            CliError::Runtime(e) => write!(f, "Failed to start runtime: {}", e),
            CliError::Http(e) => write!(f, "Failed to create HTTP client: {}", e),
            CliError::FileWrite { path, error } => {
                write!(f, "Failed to write {}: {}", path.display(), error)
            }
            CliError::Bench(msg) => write!(f, "Benchmark failed: {}", msg),
            CliError::Failed { failed, total } => {
                write!(f, "{} of {} images failed", failed, total)
            }
        }
    }
}

impl std::error::Error for CliError {}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e)
    }
}
