//! Layered error definitions
//!
//! Categorized by source: config / sink / source

use thiserror::Error;

use crate::MessageRef;

/// Configuration and general errors
#[derive(Debug, Error)]
pub enum ContractError {
    // ===== Configuration Errors =====
    /// Configuration parse error
    #[error("config parse error: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration validation error
    #[error("config validation error at '{field}': {message}")]
    ConfigValidation { field: String, message: String },

    // ===== General Errors =====
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl ContractError {
    /// Create configuration parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create configuration validation error
    pub fn config_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Sink errors
///
/// Per-entry write failures are NOT errors: `Sink::execute` returns them as
/// retry candidates. These variants invalidate a whole prepare or execute call.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Messages could not be converted into backend entries
    #[error("sink '{sink}' deserialization error: {message}")]
    Deserialization {
        sink: String,
        message: String,
        /// Offending message, when the parser can attribute the failure
        offending: Option<MessageRef>,
    },

    /// Backend produced no usable response for the call
    #[error("sink '{sink}' backend unavailable: {message}")]
    BackendUnavailable { sink: String, message: String },

    /// Connection could not be established
    #[error("sink '{sink}' connection error: {message}")]
    Connection { sink: String, message: String },

    /// Sink was used after close
    #[error("sink '{sink}' is closed")]
    Closed { sink: String },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SinkError {
    /// Create deserialization error attributed to one message
    pub fn deserialization(
        sink: impl Into<String>,
        message: impl Into<String>,
        offending: Option<MessageRef>,
    ) -> Self {
        Self::Deserialization {
            sink: sink.into(),
            message: message.into(),
            offending,
        }
    }

    /// Create backend unavailable error
    pub fn backend_unavailable(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            sink: sink.into(),
            message: message.into(),
        }
    }

    /// Create connection error
    pub fn connection(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            sink: sink.into(),
            message: message.into(),
        }
    }

    /// Create closed error
    pub fn closed(sink: impl Into<String>) -> Self {
        Self::Closed { sink: sink.into() }
    }

    /// Whether every staged message may be attempted again
    ///
    /// True for failures of the backend as a whole; false for parse errors
    /// and use-after-close.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::Connection { .. } | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(SinkError::backend_unavailable("kv", "no reply").is_retriable());
        assert!(SinkError::connection("kv", "refused").is_retriable());
        assert!(!SinkError::deserialization("kv", "bad json", None).is_retriable());
        assert!(!SinkError::closed("kv").is_retriable());
    }

    #[test]
    fn test_error_display() {
        let err = SinkError::backend_unavailable("redis", "empty reply");
        assert_eq!(err.to_string(), "sink 'redis' backend unavailable: empty reply");

        let err = ContractError::config_validation("workers.parallelism", "must be >= 1");
        assert!(err.to_string().contains("workers.parallelism"));
    }
}

/// Log source errors
#[derive(Debug, Error)]
pub enum SourceError {
    /// Poll failed
    #[error("poll error: {message}")]
    Poll { message: String },

    /// Commit failed
    #[error("commit error: {message}")]
    Commit { message: String },

    /// Malformed input record
    #[error("invalid record at line {line}: {message}")]
    InvalidRecord { line: usize, message: String },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    pub fn poll(message: impl Into<String>) -> Self {
        Self::Poll {
            message: message.into(),
        }
    }

    pub fn commit(message: impl Into<String>) -> Self {
        Self::Commit {
            message: message.into(),
        }
    }
}
