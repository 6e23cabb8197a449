//! PipelineBlueprint - Config Loader output
//!
//! Describes the complete pipeline: log source, worker pool, retry policy,
//! dead-letter routing, filtering and the delivery sink.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

/// Configuration version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConfigVersion {
    #[default]
    V1,
}

/// Complete pipeline blueprint
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PipelineBlueprint {
    /// Configuration version
    #[serde(default)]
    pub version: ConfigVersion,

    /// What a worker does after a batch-level failure
    #[serde(default)]
    pub on_batch_failure: BatchFailurePolicy,

    /// Log source settings
    #[serde(default)]
    #[validate(nested)]
    pub source: SourceConfig,

    /// Worker pool settings
    #[serde(default)]
    #[validate(nested)]
    pub workers: WorkerConfig,

    /// Retry policy
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,

    /// Dead-letter destination (required when `retry.on_exhausted = "dead_letter"`)
    #[serde(default)]
    pub dead_letter: Option<DeadLetterConfig>,

    /// Deserialization failure handling
    #[serde(default)]
    pub deserialization: DeserializationConfig,

    /// Optional message filter
    #[serde(default)]
    pub filter: Option<FilterConfig>,

    /// Delivery sink
    #[validate(nested)]
    pub sink: SinkConfig,
}

/// Log source configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SourceConfig {
    /// JSON-lines input file (bounded backfill)
    #[serde(default)]
    pub input: Option<String>,

    /// Topic assigned to input records that do not name one
    #[serde(default = "default_topic")]
    pub default_topic: String,

    /// Maximum messages per poll
    #[serde(default = "default_max_batch_size")]
    #[validate(range(min = 1))]
    pub max_batch_size: usize,

    /// How long a poll waits for the first message
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            input: None,
            default_topic: default_topic(),
            max_batch_size: default_max_batch_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

fn default_topic() -> String {
    "events".to_string()
}

fn default_max_batch_size() -> usize {
    500
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct WorkerConfig {
    /// Number of concurrent dispatch loops
    #[serde(default = "default_parallelism")]
    #[validate(range(min = 1))]
    pub parallelism: usize,

    /// Grace period for in-flight work on stop
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

fn default_parallelism() -> usize {
    1
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

/// Backoff kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    #[default]
    Exponential,
}

/// Terminal action for messages whose retry budget is spent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedAction {
    /// Log and resolve
    #[default]
    Drop,
    /// Forward to the dead-letter destination
    DeadLetter,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RetryConfig {
    /// Attempt budget per message, including the first write (0 = retry forever)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff kind
    #[serde(default)]
    pub backoff: BackoffKind,

    /// First retry delay
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Delay ceiling
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Exponential growth factor
    #[serde(default = "default_factor")]
    #[validate(range(min = 1.0))]
    pub factor: f64,

    /// Randomization (0.0 - 1.0)
    #[serde(default)]
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter: f64,

    /// Terminal action
    #[serde(default)]
    pub on_exhausted: ExhaustedAction,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffKind::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
            jitter: 0.0,
            on_exhausted: ExhaustedAction::default(),
        }
    }
}

impl RetryConfig {
    /// Attempt budget, `None` when unlimited
    pub fn attempt_budget(&self) -> Option<u32> {
        (self.max_attempts > 0).then_some(self.max_attempts)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_factor() -> f64 {
    2.0
}

/// Dead-letter destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// Destination type (`log` or `blob`)
    pub sink_type: SinkType,

    /// Type-specific parameters
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Handling of messages the parser rejects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeserializationPolicy {
    /// Abort the whole batch
    #[default]
    AbortBatch,
    /// Drop the offending message and sink the rest
    DropMessage,
}

/// Deserialization configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeserializationConfig {
    #[serde(default)]
    pub on_error: DeserializationPolicy,
}

/// Worker behaviour after a batch-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchFailurePolicy {
    /// Report and keep polling
    #[default]
    Continue,
    /// Report and stop the worker
    StopWorker,
}

/// Message filter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Keep messages whose key starts with this prefix
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// JSON payload field to compare
    #[serde(default)]
    pub json_field: Option<String>,

    /// Expected value (JSON literal or plain string)
    #[serde(default)]
    pub equals: Option<String>,
}

/// Sink configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SinkConfig {
    /// Sink name
    #[validate(length(min = 1))]
    pub name: String,

    /// Sink type
    pub sink_type: SinkType,

    /// Type-specific parameters
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Sink type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkType {
    /// Log output
    Log,
    /// Key-value store (list push / hash field set)
    Kv,
    /// Document store (upsert by primary key)
    Document,
    /// Partitioned files
    Blob,
    /// HTTP POST
    Http,
}

impl SinkType {
    /// Parameters a sink of this type cannot run without
    pub fn required_params(&self) -> &'static [&'static str] {
        match self {
            SinkType::Log => &[],
            SinkType::Kv => &["key_template"],
            SinkType::Document => &["primary_key"],
            SinkType::Blob => &["base_path"],
            SinkType::Http => &["url"],
        }
    }
}
