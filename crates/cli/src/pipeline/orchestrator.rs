//! Pipeline orchestrator - coordinates all components.
//!
//! One log source is shared by `parallelism` dispatch loops; each loop owns
//! its sink and dead-letter destination, and all of them resolve offsets in
//! one shared tracker. The source registers offsets in that tracker as it
//! hands batches out.

use std::collections::VecDeque;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use contracts::{AcceptAll, FilterRule, MessageFilter, OffsetRegistry, PipelineBlueprint};
use dispatcher::{
    AnySink, DeadLetter, DispatchLoop, LoopConfig, LoopOutcome, OffsetTracker, SinkFactory,
    WorkerPool,
};
use ingestion::{load_json_lines, parse_json_lines, LogProducer, MemoryLogSource, SourceOptions};
use tokio::io::AsyncBufReadExt;
use tracing::{debug, error, info, warn};

use super::PipelineStats;
use crate::error::CliError;

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// The pipeline blueprint
    pub blueprint: PipelineBlueprint,

    /// Pipeline timeout (None = no timeout)
    pub timeout: Option<Duration>,

    /// Metrics server port (None = disabled)
    pub metrics_port: Option<u16>,
}

/// Main pipeline orchestrator
pub struct Pipeline {
    config: PipelineConfig,
    factory: SinkFactory,
}

impl Pipeline {
    /// Create a new pipeline with the given configuration
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            factory: SinkFactory::new(),
        }
    }

    /// Use a factory whose stores the caller keeps a handle to
    #[cfg(test)]
    pub fn with_factory(mut self, factory: SinkFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Run until every worker exhausts the source, `shutdown` resolves or
    /// the timeout elapses
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<PipelineStats> {
        let start_time = Instant::now();
        let blueprint = &self.config.blueprint;

        // Initialize Metrics (optional)
        if let Some(port) = self.config.metrics_port {
            observability::init_metrics_only(port)?;
            info!("Metrics endpoint available on port {}", port);
        }

        let tracker = Arc::new(OffsetTracker::new());
        // Clones register offsets at dequeue, before a sibling can commit past them
        let source = open_source(blueprint)?
            .with_registry(Arc::clone(&tracker) as Arc<dyn OffsetRegistry>);
        let commits = source.commits().clone();
        let filter: Arc<dyn MessageFilter> = match &blueprint.filter {
            Some(config) => Arc::new(FilterRule::from_config(config)),
            None => Arc::new(AcceptAll),
        };

        // Build every loop up front so configuration errors surface before any work starts
        let parallelism = blueprint.workers.parallelism.max(1);
        let mut loops = VecDeque::with_capacity(parallelism);
        for worker_id in 0..parallelism {
            let sink = self
                .factory
                .create(&blueprint.sink)
                .context("Failed to create sink")?;
            let mut dispatch_loop = DispatchLoop::<MemoryLogSource, AnySink>::new(
                LoopConfig::from_blueprint(worker_id, blueprint),
                source.clone(),
                sink,
                Arc::clone(&tracker),
            )
            .with_filter(Arc::clone(&filter));

            if let Some(config) = &blueprint.dead_letter {
                let dead_letter = DeadLetter::from_config(&blueprint.sink.name, config)
                    .context("Failed to create dead-letter destination")?;
                dispatch_loop = dispatch_loop.with_dead_letter(dead_letter);
            }
            loops.push_back(dispatch_loop);
        }
        drop(source);

        let grace = Duration::from_millis(blueprint.workers.shutdown_grace_ms);
        let mut pool: WorkerPool<Option<LoopOutcome>> = WorkerPool::new(parallelism, grace);
        pool.start(|ctx| {
            let dispatch_loop = loops.pop_front();
            async move {
                match dispatch_loop {
                    Some(dispatch_loop) => Some(dispatch_loop.run(ctx.cancel).await),
                    None => None,
                }
            }
        })?;

        info!(
            parallelism,
            sink = %blueprint.sink.name,
            grace_ms = grace.as_millis() as u64,
            "Pipeline started"
        );

        let timeout = async {
            match self.config.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        let completed = tokio::select! {
            exits = pool.await_completion() => Some(exits?),
            _ = shutdown => {
                warn!("Received shutdown signal, stopping workers...");
                None
            }
            _ = timeout => {
                warn!(timeout = ?self.config.timeout, "Pipeline timeout reached, stopping workers...");
                None
            }
        };

        let (exits, abandoned) = match completed {
            Some(exits) => (exits, Vec::new()),
            None => {
                let report = pool.stop().await?;
                (report.finished, report.abandoned)
            }
        };

        let mut stats = PipelineStats::new(parallelism);
        for exit in exits {
            match exit.result {
                Ok(Some(outcome)) => stats.record_outcome(&outcome),
                Ok(None) => {}
                Err(message) => {
                    error!(worker = exit.id, error = %message, "Worker panicked");
                    stats.panicked += 1;
                }
            }
        }
        stats.abandoned = abandoned;
        stats.committed = commits.snapshot();
        stats.pending_offsets = tracker.total_pending();
        stats.duration = start_time.elapsed();

        Ok(stats)
    }
}

/// Bounded source over the input file, or a stdin-fed channel
fn open_source(blueprint: &PipelineBlueprint) -> Result<MemoryLogSource> {
    let options = SourceOptions::from_config(&blueprint.source);

    match &blueprint.source.input {
        Some(path) => {
            let messages = load_json_lines(Path::new(path), &blueprint.source.default_topic)
                .map_err(|e| CliError::input_load(path.clone(), e.to_string()))?;
            Ok(MemoryLogSource::bounded(messages, options))
        }
        None => {
            info!("No input file configured, reading JSON lines from stdin");
            let (producer, source) = MemoryLogSource::channel(options);
            tokio::spawn(feed_stdin(
                producer,
                blueprint.source.default_topic.clone(),
            ));
            Ok(source)
        }
    }
}

/// Append stdin records until EOF, then close the log
///
/// Offsets are assigned by the producer; malformed lines are skipped.
async fn feed_stdin(producer: LogProducer, default_topic: String) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0usize;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read stdin");
                break;
            }
        };
        line_no += 1;

        let records = match parse_json_lines(&line, &default_topic) {
            Ok(records) => records,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed input record");
                continue;
            }
        };

        for record in records {
            if let Err(e) = producer
                .append(&record.topic, record.partition, record.key, record.value)
                .await
            {
                debug!(error = %e, "Log closed, stopping stdin reader");
                return;
            }
        }
    }

    debug!(lines = line_no, "stdin closed");
    producer.close();
}
