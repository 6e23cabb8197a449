//! Pipeline metrics
//!
//! Prometheus-facing recording helpers plus in-memory aggregates used for the
//! end-of-run summary.

use std::collections::BTreeMap;

use contracts::TopicPartition;
use metrics::{counter, gauge, histogram};

/// Record a polled batch
pub fn record_batch_polled(worker: usize, size: usize) {
    counter!("sinkpipe_batches_polled_total", "worker" => worker.to_string()).increment(1);
    counter!("sinkpipe_messages_polled_total").increment(size as u64);
    histogram!("sinkpipe_batch_size").record(size as f64);
}

/// Record messages resolved by the filter
pub fn record_messages_filtered(count: usize) {
    if count > 0 {
        counter!("sinkpipe_messages_filtered_total").increment(count as u64);
    }
}

/// Record one `execute` call
pub fn record_sink_execute(sink_name: &str, staged: usize, failed: usize, latency_ms: f64) {
    let status = if failed == 0 { "success" } else { "partial" };
    counter!(
        "sinkpipe_sink_executes_total",
        "sink" => sink_name.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    counter!("sinkpipe_sink_messages_total", "sink" => sink_name.to_string())
        .increment(staged.saturating_sub(failed) as u64);
    if failed > 0 {
        counter!("sinkpipe_sink_failed_messages_total", "sink" => sink_name.to_string())
            .increment(failed as u64);
    }
    histogram!("sinkpipe_sink_execute_latency_ms", "sink" => sink_name.to_string())
        .record(latency_ms);
}

/// Record an `execute` call that got no usable backend response
pub fn record_backend_unavailable(sink_name: &str) {
    counter!(
        "sinkpipe_sink_executes_total",
        "sink" => sink_name.to_string(),
        "status" => "unavailable"
    )
    .increment(1);
}

/// Record a retry round
pub fn record_retry(sink_name: &str, messages: usize) {
    counter!("sinkpipe_retries_total", "sink" => sink_name.to_string())
        .increment(messages as u64);
}

/// Record messages resolved without delivery
pub fn record_message_dropped(sink_name: &str, reason: &'static str, count: usize) {
    counter!(
        "sinkpipe_messages_dropped_total",
        "sink" => sink_name.to_string(),
        "reason" => reason
    )
    .increment(count as u64);
}

/// Record messages forwarded to the dead-letter destination
pub fn record_dead_lettered(sink_name: &str, count: usize) {
    counter!("sinkpipe_messages_dead_lettered_total", "sink" => sink_name.to_string())
        .increment(count as u64);
}

/// Record a batch aborted by a batch-level error
pub fn record_batch_failed(sink_name: &str, reason: &'static str) {
    counter!(
        "sinkpipe_batches_failed_total",
        "sink" => sink_name.to_string(),
        "reason" => reason
    )
    .increment(1);
}

/// Record committed offsets
pub fn record_offsets_committed(offsets: &BTreeMap<TopicPartition, i64>) {
    counter!("sinkpipe_commits_total").increment(1);
    for (tp, offset) in offsets {
        gauge!(
            "sinkpipe_committed_offset",
            "topic" => tp.topic.clone(),
            "partition" => tp.partition.to_string()
        )
        .set(*offset as f64);
    }
}

/// Record worker lifecycle events (started / stopped / panicked / abandoned)
pub fn record_worker_event(worker: usize, event: &'static str) {
    counter!(
        "sinkpipe_worker_events_total",
        "worker" => worker.to_string(),
        "event" => event
    )
    .increment(1);
}

/// Sink execute aggregate for one worker
///
/// Kept worker-local and merged at the end of a run.
#[derive(Debug, Clone, Default)]
pub struct SinkStatsAggregator {
    /// `execute` calls that returned a response
    pub executes: u64,

    /// `execute` calls without usable response
    pub unavailable: u64,

    /// Messages staged across all calls
    pub staged: u64,

    /// Messages returned for retry across all calls
    pub failed: u64,

    /// Execute latency
    pub latency_ms: RunningStats,
}

impl SinkStatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one `execute` call
    pub fn record_execute(&mut self, staged: usize, failed: usize, latency_ms: f64) {
        self.executes += 1;
        self.staged += staged as u64;
        self.failed += failed as u64;
        self.latency_ms.push(latency_ms);
    }

    /// Fold one unavailable backend response
    pub fn record_unavailable(&mut self) {
        self.unavailable += 1;
    }

    /// Combine with another worker's aggregate
    pub fn merge(&mut self, other: &SinkStatsAggregator) {
        self.executes += other.executes;
        self.unavailable += other.unavailable;
        self.staged += other.staged;
        self.failed += other.failed;
        self.latency_ms.merge(&other.latency_ms);
    }

    /// Generate summary report
    pub fn summary(&self) -> SinkStatsSummary {
        SinkStatsSummary {
            executes: self.executes,
            unavailable: self.unavailable,
            staged: self.staged,
            failed: self.failed,
            failure_rate: if self.staged > 0 {
                self.failed as f64 / self.staged as f64 * 100.0
            } else {
                0.0
            },
            latency_ms: StatsSummary::from(&self.latency_ms),
        }
    }
}

/// Sink statistics summary
#[derive(Debug, Clone, Default)]
pub struct SinkStatsSummary {
    pub executes: u64,
    pub unavailable: u64,
    pub staged: u64,
    pub failed: u64,
    pub failure_rate: f64,
    pub latency_ms: StatsSummary,
}

impl std::fmt::Display for SinkStatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Sink Summary ===")?;
        writeln!(f, "Execute calls: {}", self.executes)?;
        writeln!(f, "Backend unavailable: {}", self.unavailable)?;
        writeln!(
            f,
            "Failed entries: {} of {} ({:.2}%)",
            self.failed, self.staged, self.failure_rate
        )?;
        writeln!(f, "Execute latency (ms): {}", self.latency_ms)
    }
}

/// Statistics summary
#[derive(Debug, Clone, Default)]
pub struct StatsSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&RunningStats> for StatsSummary {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count,
            min: stats.min,
            max: stats.max,
            mean: stats.mean(),
            std_dev: stats.std_dev(),
        }
    }
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.3}, max={:.3}, mean={:.3}, std={:.3} (n={})",
                self.min, self.max, self.mean, self.std_dev, self.count
            )
        }
    }
}

/// Online statistics (Welford's algorithm)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);

            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            let delta2 = value - self.mean;
            self.m2 += delta * delta2;
        }
    }

    /// Combine two partial aggregates (Chan et al. parallel update)
    pub fn merge(&mut self, other: &RunningStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = other.clone();
            return;
        }

        let count = self.count + other.count;
        let delta = other.mean - self.mean;
        self.mean += delta * other.count as f64 / count as f64;
        self.m2 += other.m2 + delta * delta * (self.count * other.count) as f64 / count as f64;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count = count;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Sample variance
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}
