//! Sink trait - delivery backend interface
//!
//! Defines the prepare / execute / close capability every backend implements.

use crate::{Message, SinkError};

/// Delivery backend
///
/// One instance per worker; never shared. The dispatch loop calls
/// `prepare` then `execute` for every (re)attempt.
#[trait_variant::make(Sink: Send)]
pub trait LocalSink {
    /// Sink name (used for logging/metrics)
    fn name(&self) -> &str;

    /// Stage backend entries for `batch`
    ///
    /// Runs the message parser and opens the backend-side write context.
    /// Performs no network I/O. Replaces anything staged previously.
    ///
    /// # Errors
    /// `SinkError::Deserialization` when a message cannot be parsed; nothing
    /// is staged in that case.
    fn prepare(&mut self, batch: &[Message]) -> Result<(), SinkError>;

    /// Write the staged entries
    ///
    /// Returns the messages that must be retried (empty on full success).
    ///
    /// # Errors
    /// `SinkError::BackendUnavailable` when the backend gave no response at
    /// all, so no failure can be attributed to individual messages.
    async fn execute(&mut self) -> Result<Vec<Message>, SinkError>;

    /// Release the backend connection
    ///
    /// Idempotent.
    async fn close(&mut self) -> Result<(), SinkError>;
}
