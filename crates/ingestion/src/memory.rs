//! 内存日志源
//!
//! `async-channel` 支撑的分区日志，多个 worker 克隆同一个 source 即可
//! 以消费组方式分摊消息。出队与 offset 登记在同一把锁内完成。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender, TryRecvError};
use contracts::{
    Batch, LogSource, Message, OffsetRegistry, SourceConfig, SourceError, TopicPartition,
};
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Poll 行为配置
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// 单次 poll 最多返回的消息数
    pub max_batch_size: usize,

    /// 等待第一条消息的时长
    pub poll_timeout: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self::from_config(&SourceConfig::default())
    }
}

impl SourceOptions {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size.max(1),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
        }
    }
}

/// Commits received by every clone of a source
///
/// Keeps the highest committed offset per partition.
#[derive(Debug, Clone, Default)]
pub struct CommitLog {
    inner: Arc<Mutex<CommitLogInner>>,
}

#[derive(Debug, Default)]
struct CommitLogInner {
    offsets: BTreeMap<TopicPartition, i64>,
    calls: usize,
}

impl CommitLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, offsets: &BTreeMap<TopicPartition, i64>) {
        let mut inner = self.inner.lock();
        inner.calls += 1;
        for (tp, offset) in offsets {
            let committed = inner.offsets.entry(tp.clone()).or_insert(*offset);
            *committed = (*committed).max(*offset);
        }
    }

    pub fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.inner.lock().offsets.get(tp).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<TopicPartition, i64> {
        self.inner.lock().offsets.clone()
    }

    /// Number of commit calls
    pub fn calls(&self) -> usize {
        self.inner.lock().calls
    }
}

/// Producer side of a memory log
///
/// Assigns sequential offsets per partition.
#[derive(Debug, Clone)]
pub struct LogProducer {
    tx: Sender<Message>,
    next_offsets: Arc<Mutex<HashMap<TopicPartition, i64>>>,
}

impl LogProducer {
    /// Append a record, returning its offset
    pub async fn append(
        &self,
        topic: &str,
        partition: i32,
        key: impl Into<bytes::Bytes>,
        value: impl Into<bytes::Bytes>,
    ) -> Result<i64, SourceError> {
        let offset = {
            let mut next = self.next_offsets.lock();
            let slot = next
                .entry(TopicPartition::new(topic, partition))
                .or_insert(0);
            let offset = *slot;
            *slot += 1;
            offset
        };

        let message = Message::new(key, value, topic, partition, offset)
            .with_timestamp(chrono::Utc::now().timestamp_millis());
        self.send(message).await?;
        Ok(offset)
    }

    /// Send a message with its own offset
    pub async fn send(&self, message: Message) -> Result<(), SourceError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| SourceError::poll("memory log closed"))
    }

    /// No more messages; sources drain what is queued then report exhaustion
    pub fn close(&self) {
        self.tx.close();
    }
}

/// Channel-backed [`LogSource`]
#[derive(Debug, Clone)]
pub struct MemoryLogSource {
    rx: Receiver<Message>,
    options: SourceOptions,
    commits: CommitLog,
    /// Shared by every clone; held from dequeue until the batch is registered
    dequeue_lock: Arc<tokio::sync::Mutex<()>>,
    registry: Option<Arc<dyn OffsetRegistry>>,
}

impl MemoryLogSource {
    /// Unbounded log fed by a [`LogProducer`]
    pub fn channel(options: SourceOptions) -> (LogProducer, Self) {
        let (tx, rx) = async_channel::unbounded();
        let producer = LogProducer {
            tx,
            next_offsets: Arc::new(Mutex::new(HashMap::new())),
        };
        (producer, Self::from_receiver(rx, options))
    }

    /// Closed log holding exactly `messages`
    pub fn bounded(messages: Vec<Message>, options: SourceOptions) -> Self {
        let (tx, rx) = async_channel::unbounded();
        for message in messages {
            // Unbounded and still open, so this cannot fail
            let _ = tx.try_send(message);
        }
        tx.close();

        Self::from_receiver(rx, options)
    }

    fn from_receiver(rx: Receiver<Message>, options: SourceOptions) -> Self {
        Self {
            rx,
            options,
            commits: CommitLog::new(),
            dequeue_lock: Arc::new(tokio::sync::Mutex::new(())),
            registry: None,
        }
    }

    /// Register every polled batch before any other clone can dequeue
    ///
    /// Set this before cloning the source for workers.
    pub fn with_registry(mut self, registry: Arc<dyn OffsetRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn commits(&self) -> &CommitLog {
        &self.commits
    }

    /// Messages waiting to be polled
    pub fn queued(&self) -> usize {
        self.rx.len()
    }
}

impl LogSource for MemoryLogSource {
    async fn poll(&mut self) -> Result<Option<Batch>, SourceError> {
        let dequeue = async {
            let _guard = self.dequeue_lock.lock().await;
            let first = self.rx.recv().await.ok()?;

            let mut messages = Vec::with_capacity(self.options.max_batch_size);
            messages.push(first);
            while messages.len() < self.options.max_batch_size {
                match self.rx.try_recv() {
                    Ok(message) => messages.push(message),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }

            let batch = Batch::new(messages);
            if let Some(registry) = &self.registry {
                registry.register(&batch);
            }
            Some(batch)
        };

        let batch = match tokio::time::timeout(self.options.poll_timeout, dequeue).await {
            Err(_) => return Ok(Some(Batch::empty())),
            Ok(None) => {
                debug!("memory log closed and drained");
                return Ok(None);
            }
            Ok(Some(batch)) => batch,
        };

        metrics::gauge!("sinkpipe_source_queue_depth").set(self.rx.len() as f64);
        trace!(messages = batch.len(), queued = self.rx.len(), "polled batch");
        Ok(Some(batch))
    }

    async fn commit(&mut self, offsets: &BTreeMap<TopicPartition, i64>) -> Result<(), SourceError> {
        self.commits.record(offsets);
        trace!(partitions = offsets.len(), "offsets committed");
        Ok(())
    }
}
