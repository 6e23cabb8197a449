//! Error types for CLI operations.

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Input file could not be loaded
    #[error("Failed to load input {path}: {message}")]
    InputLoad { path: String, message: String },

    /// Workers panicked during the run
    #[error("{count} worker(s) panicked")]
    WorkersPanicked { count: usize },

    /// Workers ignored cancellation past the grace period
    #[error("Workers {ids:?} did not stop within the grace period")]
    WorkersAbandoned { ids: Vec<usize> },
}

impl CliError {
    pub fn config_not_found(path: impl Into<String>) -> Self {
        Self::ConfigNotFound { path: path.into() }
    }

    pub fn input_load(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InputLoad {
            path: path.into(),
            message: message.into(),
        }
    }
}
