//! LogSource trait - durable log interface
//!
//! Abstracts the partitioned, append-only log the pipeline consumes from.

use std::collections::BTreeMap;
use std::fmt;

use crate::{Batch, SourceError, TopicPartition};

/// Learns about offsets the moment a source hands them out
///
/// A log shared by several workers must register a batch in the same
/// critical section that dequeues it. Otherwise a sibling can resolve and
/// commit later offsets while the earlier ones are still unknown.
pub trait OffsetRegistry: Send + Sync + fmt::Debug {
    fn register(&self, batch: &Batch);
}

/// Durable log consumer
///
/// Each worker owns one instance. Implementations may share the underlying
/// log between instances (consumer-group style); those should accept an
/// [`OffsetRegistry`].
#[trait_variant::make(LogSource: Send)]
pub trait LocalLogSource {
    /// Poll the next batch
    ///
    /// - `Ok(Some(batch))` - batch available (possibly empty on poll timeout)
    /// - `Ok(None)` - bounded source exhausted, no more data will arrive
    async fn poll(&mut self) -> Result<Option<Batch>, SourceError>;

    /// Commit offsets that are safe to resume from
    async fn commit(&mut self, offsets: &BTreeMap<TopicPartition, i64>) -> Result<(), SourceError>;
}
