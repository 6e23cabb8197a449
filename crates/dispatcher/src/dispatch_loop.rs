//! DispatchLoop - poll, filter, prepare, execute, retry and commit
//!
//! One loop per worker. A batch is fully resolved (or abandoned) before the
//! next poll. Failed messages carry their own retry state; a retry round only
//! re-sinks the messages that are due.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use contracts::{
    AcceptAll, Batch, BatchFailurePolicy, DeserializationPolicy, ExhaustedAction, LogSource,
    Message, MessageFilter, MessageRef, PipelineBlueprint, Sink, SinkError,
};
use observability::{metrics as obs, SinkStatsAggregator};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::dead_letter::DeadLetter;
use crate::error::ExhaustedMessage;
use crate::metrics::{LoopMetrics, LoopReport};
use crate::offsets::OffsetTracker;
use crate::retry::{RetryDecision, RetryPolicy, RetryScheduler, RetryState};

/// Loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Polling,
    Filtering,
    Deserializing,
    Sinking,
    Retrying,
    Committing,
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Polling => "polling",
            LoopState::Filtering => "filtering",
            LoopState::Deserializing => "deserializing",
            LoopState::Sinking => "sinking",
            LoopState::Retrying => "retrying",
            LoopState::Committing => "committing",
            LoopState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Per-worker loop settings
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub worker_id: usize,
    pub retry: RetryPolicy,
    pub on_deserialization_error: DeserializationPolicy,
    pub on_batch_failure: BatchFailurePolicy,
    /// Pause after a failed poll
    pub poll_error_backoff: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            worker_id: 0,
            retry: RetryPolicy::default(),
            on_deserialization_error: DeserializationPolicy::default(),
            on_batch_failure: BatchFailurePolicy::default(),
            poll_error_backoff: Duration::from_millis(500),
        }
    }
}

impl LoopConfig {
    pub fn from_blueprint(worker_id: usize, blueprint: &PipelineBlueprint) -> Self {
        Self {
            worker_id,
            retry: RetryPolicy::from_config(&blueprint.retry),
            on_deserialization_error: blueprint.deserialization.on_error,
            on_batch_failure: blueprint.on_batch_failure,
            ..Self::default()
        }
    }
}

/// Why a loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    /// Bounded source has no more data
    SourceExhausted,
    /// Batch-level failure under `BatchFailurePolicy::StopWorker`
    BatchFailure,
}

/// Final result of one loop
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub worker_id: usize,
    pub stop_reason: StopReason,
    pub report: LoopReport,
    pub sink_stats: SinkStatsAggregator,
}

/// Batch-level failure; the batch's unresolved offsets stay uncommitted
#[derive(Debug)]
enum BatchFailure {
    Prepare(SinkError),
    Execute(SinkError),
    DeadLetter(SinkError),
}

impl BatchFailure {
    fn reason(&self) -> &'static str {
        match self {
            BatchFailure::Prepare(_) => "deserialization",
            BatchFailure::Execute(_) => "execute",
            BatchFailure::DeadLetter(_) => "dead_letter",
        }
    }

    fn error(&self) -> &SinkError {
        match self {
            BatchFailure::Prepare(e) | BatchFailure::Execute(e) | BatchFailure::DeadLetter(e) => e,
        }
    }
}

enum BatchOutcome {
    Completed,
    Cancelled,
}

/// Messages returned by one execute
enum Failures {
    Subset(HashSet<MessageRef>),
    All,
}

impl Failures {
    fn contains(&self, id: &MessageRef) -> bool {
        match self {
            Failures::Subset(ids) => ids.contains(id),
            Failures::All => true,
        }
    }
}

/// Message still waiting for a successful write
struct Pending {
    message: Message,
    retry: Option<RetryState>,
}

impl Pending {
    fn is_due(&self, now: Instant) -> bool {
        self.retry.map_or(true, |state| state.is_due(now))
    }
}

/// Consumption-dispatch-retry-commit loop for one worker
pub struct DispatchLoop<L, S> {
    config: LoopConfig,
    source: L,
    sink: S,
    sink_name: String,
    filter: Arc<dyn MessageFilter>,
    dead_letter: Option<DeadLetter>,
    tracker: Arc<OffsetTracker>,
    scheduler: RetryScheduler,
    metrics: Arc<LoopMetrics>,
    sink_stats: SinkStatsAggregator,
    state: LoopState,
}

impl<L: LogSource, S: Sink> DispatchLoop<L, S> {
    pub fn new(config: LoopConfig, source: L, sink: S, tracker: Arc<OffsetTracker>) -> Self {
        let sink_name = sink.name().to_string();
        let scheduler = RetryScheduler::new(config.retry.clone());
        Self {
            config,
            source,
            sink,
            sink_name,
            filter: Arc::new(AcceptAll),
            dead_letter: None,
            tracker,
            scheduler,
            metrics: Arc::new(LoopMetrics::new()),
            sink_stats: SinkStatsAggregator::new(),
            state: LoopState::Polling,
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn MessageFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_dead_letter(mut self, dead_letter: DeadLetter) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    /// Share live counters with the caller
    pub fn with_metrics(mut self, metrics: Arc<LoopMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<LoopMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run until cancelled, the source is exhausted, or a batch failure
    /// stops the worker. Closes the sink before returning.
    #[instrument(
        name = "dispatch_loop_run",
        skip(self, cancel),
        fields(worker = self.config.worker_id, sink = %self.sink_name)
    )]
    pub async fn run(mut self, cancel: CancellationToken) -> LoopOutcome {
        info!(worker = self.config.worker_id, sink = %self.sink_name, "Dispatch loop started");

        let stop_reason = self.run_until_stopped(&cancel).await;
        self.transition(LoopState::Stopped);
        self.shutdown().await;

        let report = self.metrics.snapshot();
        info!(
            worker = self.config.worker_id,
            reason = ?stop_reason,
            batches = report.batches,
            succeeded = report.succeeded,
            retries = report.retries,
            dropped = report.dropped,
            dead_lettered = report.dead_lettered,
            "Dispatch loop stopped"
        );

        LoopOutcome {
            worker_id: self.config.worker_id,
            stop_reason,
            report,
            sink_stats: self.sink_stats,
        }
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            trace!(worker = self.config.worker_id, from = %self.state, to = %next, "State transition");
            self.state = next;
        }
    }

    async fn run_until_stopped(&mut self, cancel: &CancellationToken) -> StopReason {
        loop {
            if cancel.is_cancelled() {
                return StopReason::Cancelled;
            }

            self.transition(LoopState::Polling);
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StopReason::Cancelled,
                polled = self.source.poll() => polled,
            };

            let batch = match polled {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    info!(worker = self.config.worker_id, "Source exhausted");
                    return StopReason::SourceExhausted;
                }
                Err(e) => {
                    warn!(worker = self.config.worker_id, error = %e, "Poll failed");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return StopReason::Cancelled,
                        _ = tokio::time::sleep(self.config.poll_error_backoff) => {}
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                continue;
            }

            self.tracker.track(&batch);
            self.metrics.add_batch(batch.len());
            obs::record_batch_polled(self.config.worker_id, batch.len());

            let result = self.process_batch(batch, cancel).await;
            self.commit().await;

            match result {
                Ok(BatchOutcome::Completed) => {}
                Ok(BatchOutcome::Cancelled) => return StopReason::Cancelled,
                Err(failure) => {
                    error!(
                        worker = self.config.worker_id,
                        sink = %self.sink_name,
                        reason = failure.reason(),
                        error = %failure.error(),
                        "Batch failed, unresolved offsets stay uncommitted"
                    );
                    self.metrics.inc_failed_batches();
                    obs::record_batch_failed(&self.sink_name, failure.reason());

                    if self.config.on_batch_failure == BatchFailurePolicy::StopWorker {
                        return StopReason::BatchFailure;
                    }
                }
            }
        }
    }

    async fn process_batch(
        &mut self,
        batch: Batch,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, BatchFailure> {
        self.transition(LoopState::Filtering);
        let (kept, filtered): (Vec<Message>, Vec<Message>) = batch
            .into_messages()
            .into_iter()
            .partition(|message| self.filter.matches(message));

        if !filtered.is_empty() {
            self.tracker.mark_all_resolved(&filtered);
            self.metrics.add_filtered(filtered.len());
            obs::record_messages_filtered(filtered.len());
        }

        let mut pending: Vec<Pending> = kept
            .into_iter()
            .map(|message| Pending {
                message,
                retry: None,
            })
            .collect();

        while !pending.is_empty() {
            if cancel.is_cancelled() {
                return Ok(BatchOutcome::Cancelled);
            }

            let now = Instant::now();
            let (due, waiting): (Vec<Pending>, Vec<Pending>) =
                pending.into_iter().partition(|p| p.is_due(now));
            pending = waiting;

            if due.is_empty() {
                self.transition(LoopState::Retrying);
                let next = pending
                    .iter()
                    .filter_map(|p| p.retry.map(|state| state.next_eligible))
                    .min()
                    .unwrap_or(now);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(BatchOutcome::Cancelled),
                    _ = tokio::time::sleep_until(next) => {}
                }
                continue;
            }

            let retry = self.attempt(due).await?;
            pending.extend(retry);
        }

        Ok(BatchOutcome::Completed)
    }

    /// Prepare and execute the due messages; returns those to retry later
    async fn attempt(&mut self, mut due: Vec<Pending>) -> Result<Vec<Pending>, BatchFailure> {
        let retries = due.iter().filter(|p| p.retry.is_some()).count();
        if retries > 0 {
            debug!(worker = self.config.worker_id, messages = retries, "Retrying");
            self.metrics.add_retries(retries);
            obs::record_retry(&self.sink_name, retries);
        }

        self.transition(LoopState::Deserializing);
        self.prepare(&mut due)?;
        if due.is_empty() {
            return Ok(Vec::new());
        }

        self.transition(LoopState::Sinking);
        let failures = self.execute(due.len()).await?;

        let now = Instant::now();
        let mut retry = Vec::new();
        let mut succeeded = Vec::new();
        let mut exhausted = Vec::new();

        for pending in due {
            if !failures.contains(&pending.message.id()) {
                succeeded.push(pending.message);
                continue;
            }

            match self.scheduler.on_failure(pending.retry, now) {
                RetryDecision::Retry(state) => {
                    trace!(
                        partition = pending.message.partition,
                        offset = pending.message.offset,
                        attempt = state.attempt,
                        "Scheduled retry"
                    );
                    retry.push(Pending {
                        message: pending.message,
                        retry: Some(state),
                    });
                }
                RetryDecision::Exhausted { attempts, action } => {
                    exhausted.push(ExhaustedMessage {
                        message: pending.message,
                        attempts,
                        action,
                    });
                }
            }
        }

        if !succeeded.is_empty() {
            self.tracker.mark_all_resolved(&succeeded);
            self.metrics.add_succeeded(succeeded.len());
        }

        self.resolve_exhausted(exhausted).await?;
        Ok(retry)
    }

    /// Stage the due messages, dropping unparseable ones when allowed
    fn prepare(&mut self, due: &mut Vec<Pending>) -> Result<(), BatchFailure> {
        while !due.is_empty() {
            let messages: Vec<Message> = due.iter().map(|p| p.message.clone()).collect();
            let error = match self.sink.prepare(&messages) {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };

            let droppable = match (&error, self.config.on_deserialization_error) {
                (
                    SinkError::Deserialization {
                        offending: Some(offending),
                        ..
                    },
                    DeserializationPolicy::DropMessage,
                ) => due.iter().position(|p| &p.message.id() == offending),
                _ => None,
            };

            let Some(index) = droppable else {
                return Err(BatchFailure::Prepare(error));
            };

            let dropped = due.remove(index).message;
            warn!(
                worker = self.config.worker_id,
                topic = %dropped.topic,
                partition = dropped.partition,
                offset = dropped.offset,
                error = %error,
                "Unparseable message dropped"
            );
            self.tracker
                .mark_resolved(&dropped.topic_partition(), dropped.offset);
            self.metrics.add_dropped(1);
            obs::record_message_dropped(&self.sink_name, "deserialization", 1);
        }
        Ok(())
    }

    async fn execute(&mut self, staged: usize) -> Result<Failures, BatchFailure> {
        let started = Instant::now();
        let result = self.sink.execute().await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(failed) => {
                obs::record_sink_execute(&self.sink_name, staged, failed.len(), latency_ms);
                self.sink_stats
                    .record_execute(staged, failed.len(), latency_ms);
                Ok(Failures::Subset(failed.iter().map(Message::id).collect()))
            }
            Err(e) if e.is_retriable() => {
                warn!(
                    worker = self.config.worker_id,
                    sink = %self.sink_name,
                    staged,
                    error = %e,
                    "No usable backend response, every staged message will be retried"
                );
                obs::record_backend_unavailable(&self.sink_name);
                self.sink_stats.record_unavailable();
                Ok(Failures::All)
            }
            Err(e) => Err(BatchFailure::Execute(e)),
        }
    }

    async fn resolve_exhausted(
        &mut self,
        exhausted: Vec<ExhaustedMessage>,
    ) -> Result<(), BatchFailure> {
        if exhausted.is_empty() {
            return Ok(());
        }

        let (mut to_dead_letter, mut to_drop): (Vec<_>, Vec<_>) = exhausted
            .into_iter()
            .partition(|e| e.action == ExhaustedAction::DeadLetter);

        if !to_dead_letter.is_empty() && self.dead_letter.is_none() {
            error!(
                sink = %self.sink_name,
                messages = to_dead_letter.len(),
                "No dead-letter destination configured, dropping"
            );
            to_drop.append(&mut to_dead_letter);
        }

        if !to_drop.is_empty() {
            for exhausted in &to_drop {
                warn!(
                    sink = %self.sink_name,
                    message = %exhausted.id(),
                    partition = exhausted.message.partition,
                    offset = exhausted.message.offset,
                    attempts = exhausted.attempts,
                    "Retry budget exhausted, message dropped"
                );
            }
            self.tracker
                .mark_all_resolved(to_drop.iter().map(|e| &e.message));
            self.metrics.add_dropped(to_drop.len());
            obs::record_message_dropped(&self.sink_name, "retry_exhausted", to_drop.len());
        }

        let Some(dead_letter) = self.dead_letter.as_mut() else {
            return Ok(());
        };
        if to_dead_letter.is_empty() {
            return Ok(());
        }

        for exhausted in &to_dead_letter {
            warn!(
                sink = %self.sink_name,
                partition = exhausted.message.partition,
                offset = exhausted.message.offset,
                attempts = exhausted.attempts,
                "Retry budget exhausted, forwarding to dead letter"
            );
        }

        let messages: Vec<Message> = to_dead_letter.into_iter().map(|e| e.message).collect();
        dead_letter
            .send(&messages)
            .await
            .map_err(BatchFailure::DeadLetter)?;

        self.tracker.mark_all_resolved(&messages);
        self.metrics.add_dead_lettered(messages.len());
        obs::record_dead_lettered(&self.sink_name, messages.len());
        Ok(())
    }

    async fn commit(&mut self) {
        self.transition(LoopState::Committing);
        let offsets = self.tracker.commit_ready_offsets();
        if offsets.is_empty() {
            return;
        }

        match self.source.commit(&offsets).await {
            Ok(()) => {
                self.metrics.inc_commits();
                obs::record_offsets_committed(&offsets);
                debug!(
                    worker = self.config.worker_id,
                    partitions = offsets.len(),
                    "Offsets committed"
                );
            }
            Err(e) => {
                error!(
                    worker = self.config.worker_id,
                    partitions = offsets.len(),
                    error = %e,
                    "Commit failed"
                );
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.sink.close().await {
            error!(sink = %self.sink_name, error = %e, "Close failed on shutdown");
        }
        if let Some(dead_letter) = self.dead_letter.as_mut() {
            if let Err(e) = dead_letter.close().await {
                error!(dlq = %dead_letter.name(), error = %e, "Dead-letter close failed on shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{SourceError, TopicPartition};
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, VecDeque};
    use tokio::sync::Notify;

    type Commits = Arc<Mutex<Vec<BTreeMap<TopicPartition, i64>>>>;

    /// Hands out scripted poll results, then reports exhaustion
    struct ScriptedSource {
        polls: VecDeque<Result<Batch, SourceError>>,
        commits: Commits,
        /// Block instead of reporting exhaustion
        hang_when_empty: bool,
    }

    impl ScriptedSource {
        fn new(batches: Vec<Batch>) -> (Self, Commits) {
            let commits = Commits::default();
            let source = Self {
                polls: batches.into_iter().map(Ok).collect(),
                commits: Arc::clone(&commits),
                hang_when_empty: false,
            };
            (source, commits)
        }
    }

    impl LogSource for ScriptedSource {
        async fn poll(&mut self) -> Result<Option<Batch>, SourceError> {
            match self.polls.pop_front() {
                Some(Ok(batch)) => Ok(Some(batch)),
                Some(Err(e)) => Err(e),
                None if self.hang_when_empty => {
                    std::future::pending::<()>().await;
                    Ok(None)
                }
                None => Ok(None),
            }
        }

        async fn commit(
            &mut self,
            offsets: &BTreeMap<TopicPartition, i64>,
        ) -> Result<(), SourceError> {
            self.commits.lock().push(offsets.clone());
            Ok(())
        }
    }

    #[derive(Debug, Clone)]
    enum Step {
        Fail(Vec<i64>),
        Unavailable,
    }

    #[derive(Debug, Default)]
    struct SinkLog {
        executed: Vec<Vec<i64>>,
        /// Executes that ran to the end
        completed: usize,
        closes: usize,
    }

    /// Holds `execute` open until released
    #[derive(Default)]
    struct ExecuteGate {
        entered: Notify,
        release: Notify,
    }

    /// Fails according to a script, records every execute
    struct ScriptedSink {
        script: VecDeque<Step>,
        always_fail: HashSet<i64>,
        unparseable: HashSet<i64>,
        staged: Vec<Message>,
        log: Arc<Mutex<SinkLog>>,
        gate: Option<Arc<ExecuteGate>>,
    }

    impl ScriptedSink {
        fn new(script: Vec<Step>) -> (Self, Arc<Mutex<SinkLog>>) {
            let log = Arc::new(Mutex::new(SinkLog::default()));
            let sink = Self {
                script: script.into(),
                always_fail: HashSet::new(),
                unparseable: HashSet::new(),
                staged: Vec::new(),
                log: Arc::clone(&log),
                gate: None,
            };
            (sink, log)
        }
    }

    impl Sink for ScriptedSink {
        fn name(&self) -> &str {
            "scripted"
        }

        fn prepare(&mut self, batch: &[Message]) -> Result<(), SinkError> {
            self.staged.clear();
            if let Some(bad) = batch.iter().find(|m| self.unparseable.contains(&m.offset)) {
                return Err(SinkError::deserialization(
                    "scripted",
                    "unparseable",
                    Some(bad.id()),
                ));
            }
            self.staged = batch.to_vec();
            Ok(())
        }

        async fn execute(&mut self) -> Result<Vec<Message>, SinkError> {
            let staged = std::mem::take(&mut self.staged);
            self.log
                .lock()
                .executed
                .push(staged.iter().map(|m| m.offset).collect());

            if let Some(gate) = &self.gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
            self.log.lock().completed += 1;

            let failing: HashSet<i64> = match self.script.pop_front() {
                Some(Step::Unavailable) => {
                    return Err(SinkError::backend_unavailable("scripted", "no reply"))
                }
                Some(Step::Fail(offsets)) => offsets.into_iter().collect(),
                None => HashSet::new(),
            };
            Ok(staged
                .into_iter()
                .filter(|m| failing.contains(&m.offset) || self.always_fail.contains(&m.offset))
                .collect())
        }

        async fn close(&mut self) -> Result<(), SinkError> {
            self.log.lock().closes += 1;
            Ok(())
        }
    }

    fn batch(offsets: impl IntoIterator<Item = i64>) -> Batch {
        offsets
            .into_iter()
            .map(|offset| Message::new("", format!("m{offset}"), "events", 0, offset))
            .collect::<Vec<_>>()
            .into()
    }

    fn config(max_attempts: Option<u32>) -> LoopConfig {
        LoopConfig {
            retry: RetryPolicy::fixed(max_attempts, Duration::from_millis(10)),
            ..LoopConfig::default()
        }
    }

    fn tp() -> TopicPartition {
        TopicPartition::new("events", 0)
    }

    #[tokio::test]
    async fn test_partial_failure_retries_only_failed_subset() {
        let (source, commits) = ScriptedSource::new(vec![batch(0..3)]);
        let (sink, log) = ScriptedSink::new(vec![Step::Fail(vec![1])]);
        let tracker = Arc::new(OffsetTracker::new());

        let outcome = DispatchLoop::new(config(Some(3)), source, sink, Arc::clone(&tracker))
            .run(CancellationToken::new())
            .await;

        assert_eq!(outcome.stop_reason, StopReason::SourceExhausted);
        assert_eq!(log.lock().executed, vec![vec![0, 1, 2], vec![1]]);
        assert_eq!(outcome.report.retries, 1);
        assert_eq!(outcome.report.succeeded, 3);
        assert_eq!(outcome.report.commits, 1);
        assert_eq!(commits.lock().as_slice(), &[BTreeMap::from([(tp(), 2)])]);
        assert_eq!(log.lock().closes, 1);
    }

    #[tokio::test]
    async fn test_backend_unavailable_retries_every_staged_message() {
        let (source, commits) = ScriptedSource::new(vec![batch(0..2)]);
        let (sink, log) = ScriptedSink::new(vec![Step::Unavailable]);

        let outcome = DispatchLoop::new(config(Some(3)), source, sink, Arc::new(OffsetTracker::new()))
            .run(CancellationToken::new())
            .await;

        assert_eq!(log.lock().executed, vec![vec![0, 1], vec![0, 1]]);
        assert_eq!(outcome.report.retries, 2);
        assert_eq!(outcome.sink_stats.unavailable, 1);
        assert_eq!(commits.lock().last(), Some(&BTreeMap::from([(tp(), 1)])));
    }

    #[tokio::test]
    async fn test_filtered_messages_are_resolved_without_sinking() {
        let (source, commits) = ScriptedSource::new(vec![batch(0..3)]);
        let (sink, log) = ScriptedSink::new(vec![]);
        let filter: Arc<dyn MessageFilter> = Arc::new(|m: &Message| m.offset != 1);

        let outcome = DispatchLoop::new(config(Some(3)), source, sink, Arc::new(OffsetTracker::new()))
            .with_filter(filter)
            .run(CancellationToken::new())
            .await;

        assert_eq!(log.lock().executed, vec![vec![0, 2]]);
        assert_eq!(outcome.report.filtered, 1);
        assert_eq!(outcome.report.resolved(), 3);
        assert_eq!(commits.lock().as_slice(), &[BTreeMap::from([(tp(), 2)])]);
    }

    #[tokio::test]
    async fn test_exhausted_message_is_dropped_and_committed() {
        let (source, commits) = ScriptedSource::new(vec![batch(0..2)]);
        let (mut sink, log) = ScriptedSink::new(vec![]);
        sink.always_fail.insert(0);

        let outcome = DispatchLoop::new(config(Some(2)), source, sink, Arc::new(OffsetTracker::new()))
            .run(CancellationToken::new())
            .await;

        assert_eq!(log.lock().executed, vec![vec![0, 1], vec![0]]);
        assert_eq!(outcome.report.dropped, 1);
        assert_eq!(outcome.report.succeeded, 1);
        assert_eq!(commits.lock().as_slice(), &[BTreeMap::from([(tp(), 1)])]);
    }

    #[tokio::test]
    async fn test_exhausted_message_goes_to_dead_letter() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetter::blob("scripted", &dir.path().to_string_lossy()).unwrap();

        let (source, commits) = ScriptedSource::new(vec![batch(0..2)]);
        let (mut sink, _log) = ScriptedSink::new(vec![]);
        sink.always_fail.insert(1);

        let mut config = config(Some(1));
        config.retry = config.retry.with_on_exhausted(ExhaustedAction::DeadLetter);

        let outcome = DispatchLoop::new(config, source, sink, Arc::new(OffsetTracker::new()))
            .with_dead_letter(dlq)
            .run(CancellationToken::new())
            .await;

        assert_eq!(outcome.report.dead_lettered, 1);
        assert_eq!(outcome.report.retries, 0);
        assert_eq!(commits.lock().as_slice(), &[BTreeMap::from([(tp(), 1)])]);
        assert!(dir.path().join("events").exists());
    }

    #[tokio::test]
    async fn test_dead_letter_failure_fails_batch_and_blocks_commit() {
        let dir = tempfile::tempdir().unwrap();
        // The dead-letter topic directory cannot be created
        std::fs::write(dir.path().join("events"), b"").unwrap();
        let dlq = DeadLetter::blob("scripted", &dir.path().to_string_lossy()).unwrap();

        let (source, commits) = ScriptedSource::new(vec![batch(0..2)]);
        let (mut sink, _log) = ScriptedSink::new(vec![]);
        sink.always_fail.insert(0);

        let mut config = config(Some(1));
        config.retry = config.retry.with_on_exhausted(ExhaustedAction::DeadLetter);
        let tracker = Arc::new(OffsetTracker::new());

        let outcome = DispatchLoop::new(config, source, sink, Arc::clone(&tracker))
            .with_dead_letter(dlq)
            .run(CancellationToken::new())
            .await;

        assert_eq!(outcome.report.failed_batches, 1);
        assert!(commits.lock().is_empty());
        assert_eq!(tracker.pending(&tp()), 1);
    }

    #[tokio::test]
    async fn test_drop_message_policy_sinks_the_rest() {
        let (source, commits) = ScriptedSource::new(vec![batch(0..3)]);
        let (mut sink, log) = ScriptedSink::new(vec![]);
        sink.unparseable.insert(1);

        let config = LoopConfig {
            on_deserialization_error: DeserializationPolicy::DropMessage,
            ..config(Some(3))
        };
        let outcome = DispatchLoop::new(config, source, sink, Arc::new(OffsetTracker::new()))
            .run(CancellationToken::new())
            .await;

        assert_eq!(log.lock().executed, vec![vec![0, 2]]);
        assert_eq!(outcome.report.dropped, 1);
        assert_eq!(commits.lock().as_slice(), &[BTreeMap::from([(tp(), 2)])]);
    }

    #[tokio::test]
    async fn test_abort_batch_policy_leaves_offsets_uncommitted() {
        let (source, commits) = ScriptedSource::new(vec![batch(0..2), batch(2..3)]);
        let (mut sink, log) = ScriptedSink::new(vec![]);
        sink.unparseable.insert(1);

        let outcome = DispatchLoop::new(config(Some(3)), source, sink, Arc::new(OffsetTracker::new()))
            .run(CancellationToken::new())
            .await;

        // Second batch still processed, commit stalls behind the aborted one
        assert_eq!(outcome.report.failed_batches, 1);
        assert_eq!(log.lock().executed, vec![vec![2]]);
        assert!(commits.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stop_worker_policy() {
        let (source, _commits) = ScriptedSource::new(vec![batch(0..1), batch(1..2)]);
        let (mut sink, log) = ScriptedSink::new(vec![]);
        sink.unparseable.insert(0);

        let config = LoopConfig {
            on_batch_failure: BatchFailurePolicy::StopWorker,
            ..config(Some(3))
        };
        let outcome = DispatchLoop::new(config, source, sink, Arc::new(OffsetTracker::new()))
            .run(CancellationToken::new())
            .await;

        assert_eq!(outcome.stop_reason, StopReason::BatchFailure);
        assert!(log.lock().executed.is_empty());
        assert_eq!(log.lock().closes, 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_retry_wait() {
        let (mut source, commits) = ScriptedSource::new(vec![batch(0..2)]);
        source.hang_when_empty = true;
        let (mut sink, log) = ScriptedSink::new(vec![]);
        sink.always_fail.insert(1);

        let config = LoopConfig {
            retry: RetryPolicy::fixed(None, Duration::from_secs(3600)),
            ..LoopConfig::default()
        };
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            DispatchLoop::new(config, source, sink, Arc::new(OffsetTracker::new()))
                .run(cancel.clone()),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
        assert_eq!(log.lock().executed.len(), 1);
        // Offset 0 is committed, offset 1 stays unresolved
        assert_eq!(commits.lock().as_slice(), &[BTreeMap::from([(tp(), 0)])]);
        assert_eq!(log.lock().closes, 1);
    }

    #[tokio::test]
    async fn test_cancel_waits_for_in_flight_execute() {
        let (mut source, commits) = ScriptedSource::new(vec![batch(0..3)]);
        source.hang_when_empty = true;
        let (mut sink, log) = ScriptedSink::new(vec![]);
        let gate = Arc::new(ExecuteGate::default());
        sink.gate = Some(Arc::clone(&gate));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            DispatchLoop::new(config(Some(3)), source, sink, Arc::new(OffsetTracker::new()))
                .run(cancel.clone()),
        );

        gate.entered.notified().await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        assert_eq!(log.lock().completed, 0);

        gate.release.notify_one();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
        assert_eq!(log.lock().completed, 1);
        assert_eq!(outcome.report.succeeded, 3);
        assert_eq!(commits.lock().as_slice(), &[BTreeMap::from([(tp(), 2)])]);
        assert_eq!(log.lock().closes, 1);
    }

    #[tokio::test]
    async fn test_poll_error_is_retried() {
        let (mut source, commits) = ScriptedSource::new(vec![]);
        source.polls = VecDeque::from([Err(SourceError::poll("broker down")), Ok(batch(0..1))]);
        let (sink, _log) = ScriptedSink::new(vec![]);

        let config = LoopConfig {
            poll_error_backoff: Duration::from_millis(1),
            ..config(Some(3))
        };
        let outcome = DispatchLoop::new(config, source, sink, Arc::new(OffsetTracker::new()))
            .run(CancellationToken::new())
            .await;

        assert_eq!(outcome.report.succeeded, 1);
        assert_eq!(commits.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_noop() {
        let (source, commits) = ScriptedSource::new(vec![Batch::empty(), batch(0..1)]);
        let (sink, log) = ScriptedSink::new(vec![]);

        let outcome = DispatchLoop::new(config(Some(3)), source, sink, Arc::new(OffsetTracker::new()))
            .run(CancellationToken::new())
            .await;

        assert_eq!(outcome.report.batches, 1);
        assert_eq!(log.lock().executed.len(), 1);
        assert_eq!(commits.lock().len(), 1);
    }
}
