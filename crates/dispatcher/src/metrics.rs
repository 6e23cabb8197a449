//! Dispatch loop counters for observability

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one dispatch loop
///
/// Shared through `Arc` so the owner of the pool can read progress while the
/// worker runs.
#[derive(Debug, Default)]
pub struct LoopMetrics {
    batches: AtomicU64,
    messages: AtomicU64,
    filtered: AtomicU64,
    succeeded: AtomicU64,
    retries: AtomicU64,
    dropped: AtomicU64,
    dead_lettered: AtomicU64,
    failed_batches: AtomicU64,
    commits: AtomicU64,
}

impl LoopMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_batch(&self, messages: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.messages.fetch_add(messages as u64, Ordering::Relaxed);
    }

    pub fn add_filtered(&self, count: usize) {
        self.filtered.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn add_succeeded(&self, count: usize) {
        self.succeeded.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn add_retries(&self, count: usize) {
        self.retries.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, count: usize) {
        self.dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn add_dead_lettered(&self, count: usize) {
        self.dead_lettered.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn inc_failed_batches(&self) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commits(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Get snapshot of all counters
    pub fn snapshot(&self) -> LoopReport {
        LoopReport {
            batches: self.batches.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of loop counters (for reporting)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopReport {
    /// Non-empty batches polled
    pub batches: u64,
    /// Messages polled
    pub messages: u64,
    /// Messages resolved by the filter
    pub filtered: u64,
    /// Messages written by the sink
    pub succeeded: u64,
    /// Retry attempts (one per message per re-sink)
    pub retries: u64,
    /// Messages resolved without delivery (exhausted, rejected, unparseable)
    pub dropped: u64,
    /// Messages forwarded to the dead-letter destination
    pub dead_lettered: u64,
    /// Batches aborted by a batch-level error
    pub failed_batches: u64,
    /// Commit calls issued to the log source
    pub commits: u64,
}

impl LoopReport {
    /// Combine reports of several workers
    pub fn merge(mut self, other: &LoopReport) -> Self {
        self.batches += other.batches;
        self.messages += other.messages;
        self.filtered += other.filtered;
        self.succeeded += other.succeeded;
        self.retries += other.retries;
        self.dropped += other.dropped;
        self.dead_lettered += other.dead_lettered;
        self.failed_batches += other.failed_batches;
        self.commits += other.commits;
        self
    }

    /// Messages that reached a terminal state
    pub fn resolved(&self) -> u64 {
        self.filtered + self.succeeded + self.dropped + self.dead_lettered
    }
}
