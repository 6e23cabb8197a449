//! Message - log source output
//!
//! Immutable records pulled from the durable log, plus the batch and
//! bookkeeping identifiers built on top of them.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Topic + partition pair
///
/// Offsets are only comparable within one `TopicPartition`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Log message
///
/// Never mutated after creation. Cloning is cheap (`Bytes` payloads).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message key (may be empty)
    pub key: Bytes,

    /// Message payload
    pub value: Bytes,

    /// Source topic
    pub topic: String,

    /// Source partition
    pub partition: i32,

    /// Offset within the partition
    pub offset: i64,

    /// Producer timestamp (epoch millis)
    pub timestamp: i64,
}

impl Message {
    /// Create a message with timestamp 0
    pub fn new(
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            topic: topic.into(),
            partition,
            offset,
            timestamp: 0,
        }
    }

    /// Set the producer timestamp
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Topic + partition of this message
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Bookkeeping identity of this message
    pub fn id(&self) -> MessageRef {
        MessageRef {
            topic_partition: self.topic_partition(),
            offset: self.offset,
        }
    }

    /// Key as UTF-8 (lossy)
    pub fn key_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }
}

/// Identity of a message inside the log
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageRef {
    pub topic_partition: TopicPartition,
    pub offset: i64,
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.topic_partition, self.offset)
    }
}

/// Messages pulled together in one poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    messages: Vec<Message>,
}

impl Batch {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }
}

impl From<Vec<Message>> for Batch {
    fn from(messages: Vec<Message>) -> Self {
        Self::new(messages)
    }
}

impl IntoIterator for Batch {
    type Item = Message;
    type IntoIter = std::vec::IntoIter<Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

/// Backend-native write unit derived from one message
///
/// `origin` indexes the originating message in the slice handed to
/// `Sink::prepare`, so per-entry failures can be traced back.
#[derive(Debug, Clone, PartialEq)]
pub struct DataEntry<T> {
    pub origin: usize,
    pub body: T,
}

impl<T> DataEntry<T> {
    pub fn new(origin: usize, body: T) -> Self {
        Self { origin, body }
    }
}
