//! OffsetTracker - gap-free commit bookkeeping shared by all workers
//!
//! Offsets are registered when polled and resolved once their message was
//! sunk, filtered, dropped or dead-lettered. A commit pass only advances a
//! partition over the ascending prefix of tracked offsets that are all
//! resolved, so a restart can never skip a message that is still pending.
//!
//! Resolved offsets are kept as runs between pending offsets, so a partition
//! pinned by one unresolved offset holds one entry per pending offset plus
//! one per run, however many offsets resolve behind it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use contracts::{Batch, Message, OffsetRegistry, TopicPartition};
use parking_lot::Mutex;
use tracing::{trace, warn};

/// Per-partition state
#[derive(Debug, Default)]
struct PartitionOffsetState {
    /// Highest committed offset
    committed: Option<i64>,
    /// Tracked, unresolved offsets above `committed`
    pending: BTreeSet<i64>,
    /// Resolved runs `start -> end` above `committed`
    ///
    /// No run contains a pending offset, and two neighbouring runs always
    /// have a pending offset between them.
    resolved: BTreeMap<i64, i64>,
}

impl PartitionOffsetState {
    /// Returns false when the offset is already covered by a commit
    fn track(&mut self, offset: i64) -> bool {
        if self.is_committed(offset) {
            return false;
        }
        if !self.pending.insert(offset) {
            return true;
        }

        // Redelivered inside a resolved run: split it around the offset
        if let Some((start, end)) = self.run_containing(offset) {
            self.resolved.remove(&start);
            if start < offset {
                self.resolved.insert(start, offset - 1);
            }
            if offset < end {
                self.resolved.insert(offset + 1, end);
            }
        }
        true
    }

    fn resolve(&mut self, offset: i64) {
        if self.is_committed(offset) {
            return;
        }
        self.pending.remove(&offset);
        if self.run_containing(offset).is_some() {
            return;
        }

        let mut start = offset;
        let mut end = offset;

        if let Some((&left_start, &left_end)) = self.resolved.range(..offset).next_back() {
            if self.pending.range(left_end..offset).next().is_none() {
                self.resolved.remove(&left_start);
                start = left_start;
            }
        }
        if let Some((&right_start, &right_end)) = self.resolved.range(offset..).next() {
            if self.pending.range(offset..right_start).next().is_none() {
                self.resolved.remove(&right_start);
                end = right_end;
            }
        }

        self.resolved.insert(start, end);
    }

    fn run_containing(&self, offset: i64) -> Option<(i64, i64)> {
        self.resolved
            .range(..=offset)
            .next_back()
            .filter(|(_, &end)| end >= offset)
            .map(|(&start, &end)| (start, end))
    }

    fn is_committed(&self, offset: i64) -> bool {
        self.committed.is_some_and(|committed| offset <= committed)
    }

    /// Pop the resolved head run, returning the new committed offset if it moved
    fn advance(&mut self) -> Option<i64> {
        let (&start, &end) = self.resolved.first_key_value()?;
        if self.pending.first().is_some_and(|&lowest| lowest < start) {
            return None;
        }

        self.resolved.remove(&start);
        self.committed = Some(end);
        Some(end)
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }

    fn entries(&self) -> usize {
        self.pending.len() + self.resolved.len()
    }
}

/// Thread-safe offset tracker
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: Mutex<HashMap<TopicPartition, PartitionOffsetState>>,
    /// Offsets polled again after a commit already covered them
    stale_tracks: AtomicUsize,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every offset of a freshly polled batch as in flight
    ///
    /// Registering an offset twice is a no-op. An offset at or below the
    /// committed offset is reported and counted, never tracked.
    pub fn track(&self, batch: &Batch) {
        let mut partitions = self.partitions.lock();
        for message in batch.iter() {
            let state = partitions.entry(message.topic_partition()).or_default();
            if !state.track(message.offset) {
                self.stale_tracks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    partition = %message.topic_partition(),
                    offset = message.offset,
                    committed = ?state.committed,
                    "Offset polled at or below the committed offset"
                );
            }
        }
    }

    /// Mark one offset as durably resolved
    ///
    /// Offsets that were never tracked are registered as resolved.
    pub fn mark_resolved(&self, tp: &TopicPartition, offset: i64) {
        let mut partitions = self.partitions.lock();
        match partitions.get_mut(tp) {
            Some(state) => state.resolve(offset),
            None => partitions.entry(tp.clone()).or_default().resolve(offset),
        }
    }

    /// Mark a group of messages as resolved under one lock acquisition
    pub fn mark_all_resolved<'a>(&self, messages: impl IntoIterator<Item = &'a Message>) {
        let mut partitions = self.partitions.lock();
        for message in messages {
            partitions
                .entry(message.topic_partition())
                .or_default()
                .resolve(message.offset);
        }
    }

    /// Advance every partition over its resolved prefix
    ///
    /// Returns only the partitions whose committed offset moved. The whole
    /// pass runs under the lock, so it observes one consistent snapshot.
    pub fn commit_ready_offsets(&self) -> BTreeMap<TopicPartition, i64> {
        let mut partitions = self.partitions.lock();
        let mut ready = BTreeMap::new();

        for (tp, state) in partitions.iter_mut() {
            if let Some(offset) = state.advance() {
                trace!(partition = %tp, offset, "commit offset advanced");
                ready.insert(tp.clone(), offset);
            }
        }

        ready
    }

    /// Last committed offset of a partition
    pub fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.partitions.lock().get(tp).and_then(|state| state.committed)
    }

    /// Number of unresolved offsets of a partition
    pub fn pending(&self, tp: &TopicPartition) -> usize {
        self.partitions
            .lock()
            .get(tp)
            .map_or(0, PartitionOffsetState::pending)
    }

    /// Number of unresolved offsets across all partitions
    pub fn total_pending(&self) -> usize {
        self.partitions
            .lock()
            .values()
            .map(PartitionOffsetState::pending)
            .sum()
    }

    /// Bookkeeping entries held for a partition
    pub fn tracked_entries(&self, tp: &TopicPartition) -> usize {
        self.partitions
            .lock()
            .get(tp)
            .map_or(0, PartitionOffsetState::entries)
    }

    /// Offsets that were polled after a commit had already passed them
    pub fn stale_tracks(&self) -> usize {
        self.stale_tracks.load(Ordering::Relaxed)
    }
}

impl OffsetRegistry for OffsetTracker {
    fn register(&self, batch: &Batch) {
        self.track(batch);
    }
}
