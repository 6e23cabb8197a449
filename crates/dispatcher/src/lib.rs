//! # Dispatcher
//!
//! 消息投递模块。
//!
//! 负责：
//! - 消费 `Batch`，按 prepare / execute 写入 sink
//! - 失败消息按退避策略重试，耗尽后丢弃或转入死信
//! - 仅提交无空洞的 offset 前缀（at-least-once）
//! - 多 worker 并行，限时优雅停止

pub mod dead_letter;
pub mod dispatch_loop;
pub mod error;
pub mod metrics;
pub mod offsets;
pub mod pool;
pub mod retry;
pub mod sinks;

pub use contracts::{Batch, Message, Sink};
pub use dead_letter::DeadLetter;
pub use dispatch_loop::{DispatchLoop, LoopConfig, LoopOutcome, LoopState, StopReason};
pub use error::{BackendError, DispatcherError, ExhaustedMessage, PoolError};
pub use metrics::{LoopMetrics, LoopReport};
pub use offsets::OffsetTracker;
pub use pool::{PoolState, StopReport, WorkerContext, WorkerExit, WorkerPool};
pub use retry::{Backoff, RetryDecision, RetryPolicy, RetryScheduler, RetryState};
pub use sinks::{AnySink, BlobSink, DocumentSink, HttpSink, KvSink, LogSink, SinkFactory};
