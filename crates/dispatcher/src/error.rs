//! Dispatcher error types

use contracts::{ExhaustedAction, Message, MessageRef};
use thiserror::Error;

/// Dispatcher-specific errors
#[derive(Debug, Error)]
pub enum DispatcherError {
    /// Sink creation error
    #[error("failed to create sink '{name}': {message}")]
    SinkCreation { name: String, message: String },
}

impl DispatcherError {
    /// Create a sink creation error
    pub fn sink_creation(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkCreation {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Worker pool lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("worker pool already started")]
    AlreadyStarted,

    #[error("worker pool not started")]
    NotStarted,
}

/// Error reported by a backend client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A message whose retry budget is spent
///
/// Not a failure of the loop: it is handed to the terminal action.
#[derive(Debug, Clone)]
pub struct ExhaustedMessage {
    pub message: Message,
    pub attempts: u32,
    pub action: ExhaustedAction,
}

impl ExhaustedMessage {
    pub fn id(&self) -> MessageRef {
        self.message.id()
    }
}
