//! Pipeline statistics and metrics.

use std::collections::BTreeMap;
use std::time::Duration;

use contracts::TopicPartition;
use dispatcher::{LoopOutcome, LoopReport, StopReason};
use observability::SinkStatsAggregator;

/// Statistics from a pipeline run
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Workers started
    pub workers: usize,

    /// Loop counters summed over all workers
    pub report: LoopReport,

    /// Sink execute aggregate over all workers
    pub sink_stats: SinkStatsAggregator,

    /// Workers that returned because the source was exhausted
    pub exhausted_workers: usize,

    /// Workers that returned after cancellation
    pub cancelled_workers: usize,

    /// Workers stopped by a batch failure
    pub failed_workers: usize,

    /// Workers that panicked
    pub panicked: usize,

    /// Workers still running when the grace period ran out
    pub abandoned: Vec<usize>,

    /// Last committed offset per partition
    pub committed: BTreeMap<TopicPartition, i64>,

    /// Tracked offsets that were never resolved
    pub pending_offsets: usize,

    /// Total duration of the pipeline run
    pub duration: Duration,
}

impl PipelineStats {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    /// Fold one worker's outcome
    pub fn record_outcome(&mut self, outcome: &LoopOutcome) {
        self.report = self.report.merge(&outcome.report);
        self.sink_stats.merge(&outcome.sink_stats);
        match outcome.stop_reason {
            StopReason::SourceExhausted => self.exhausted_workers += 1,
            StopReason::Cancelled => self.cancelled_workers += 1,
            StopReason::BatchFailure => self.failed_workers += 1,
        }
    }

    /// Messages per second over the whole run
    pub fn throughput(&self) -> f64 {
        if self.duration.as_secs_f64() > 0.0 {
            self.report.messages as f64 / self.duration.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Print detailed summary
    pub fn print_summary(&self) {
        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║                    Pipeline Statistics                       ║");
        println!("╚══════════════════════════════════════════════════════════════╝\n");

        println!("📊 Overview");
        println!("   ├─ Duration: {:.2}s", self.duration.as_secs_f64());
        println!("   ├─ Messages polled: {}", self.report.messages);
        println!("   ├─ Batches: {}", self.report.batches);
        println!("   ├─ Throughput: {:.2} msg/s", self.throughput());
        println!("   └─ Workers: {}", self.workers);

        println!("\n📬 Delivery");
        println!("   ├─ Sunk: {}", self.report.succeeded);
        println!("   ├─ Filtered: {}", self.report.filtered);
        println!("   ├─ Dropped: {}", self.report.dropped);
        println!("   ├─ Dead-lettered: {}", self.report.dead_lettered);
        println!("   ├─ Retries: {}", self.report.retries);
        println!("   └─ Failed batches: {}", self.report.failed_batches);

        let summary = self.sink_stats.summary();
        println!("\n📈 Sink");
        println!("   ├─ Execute calls: {}", summary.executes);
        println!("   ├─ Backend unavailable: {}", summary.unavailable);
        println!(
            "   ├─ Failed entries: {} of {} ({:.2}%)",
            summary.failed, summary.staged, summary.failure_rate
        );
        println!("   └─ Execute latency (ms): {}", summary.latency_ms);

        println!("\n🔖 Commits");
        if self.committed.is_empty() {
            println!("   └─ (none)");
        } else {
            let last = self.committed.len() - 1;
            for (i, (tp, offset)) in self.committed.iter().enumerate() {
                let branch = if i == last { "└─" } else { "├─" };
                println!("   {} {}: {}", branch, tp, offset);
            }
        }

        if self.pending_offsets > 0
            || self.failed_workers > 0
            || self.panicked > 0
            || !self.abandoned.is_empty()
        {
            println!("\n⚠️  Attention");
            println!("   ├─ Unresolved offsets: {}", self.pending_offsets);
            println!("   ├─ Workers stopped by batch failure: {}", self.failed_workers);
            println!("   ├─ Workers panicked: {}", self.panicked);
            println!("   └─ Workers abandoned: {:?}", self.abandoned);
        }

        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(worker_id: usize, stop_reason: StopReason, succeeded: u64) -> LoopOutcome {
        let mut sink_stats = SinkStatsAggregator::new();
        sink_stats.record_execute(succeeded as usize, 0, 1.5);
        LoopOutcome {
            worker_id,
            stop_reason,
            report: LoopReport {
                batches: 1,
                messages: succeeded,
                succeeded,
                commits: 1,
                ..LoopReport::default()
            },
            sink_stats,
        }
    }

    #[test]
    fn test_record_outcomes() {
        let mut stats = PipelineStats::new(3);
        stats.record_outcome(&outcome(0, StopReason::SourceExhausted, 4));
        stats.record_outcome(&outcome(1, StopReason::Cancelled, 2));
        stats.record_outcome(&outcome(2, StopReason::BatchFailure, 0));

        assert_eq!(stats.report.succeeded, 6);
        assert_eq!(stats.report.commits, 3);
        assert_eq!(stats.sink_stats.executes, 3);
        assert_eq!(stats.exhausted_workers, 1);
        assert_eq!(stats.cancelled_workers, 1);
        assert_eq!(stats.failed_workers, 1);
    }

    #[test]
    fn test_throughput() {
        let mut stats = PipelineStats::new(1);
        assert_eq!(stats.throughput(), 0.0);

        stats.record_outcome(&outcome(0, StopReason::SourceExhausted, 10));
        stats.duration = Duration::from_secs(2);
        assert!((stats.throughput() - 5.0).abs() < 1e-9);
    }
}
