//! JSON-lines 输入加载
//!
//! 每行一条记录：`{key, value, topic, partition, offset, timestamp}`，
//! 只有 `value` 是必填字段。

use std::collections::HashMap;
use std::path::Path;

use contracts::{Message, SourceError, TopicPartition};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
struct JsonRecord {
    #[serde(default)]
    key: Option<String>,
    value: serde_json::Value,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    partition: i32,
    #[serde(default)]
    offset: Option<i64>,
    #[serde(default)]
    timestamp: i64,
}

/// Load every record of a JSON-lines file
pub fn load_json_lines(path: impl AsRef<Path>, default_topic: &str) -> Result<Vec<Message>, SourceError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let messages = parse_json_lines(&content, default_topic)?;
    info!(path = %path.display(), messages = messages.len(), "loaded input records");
    Ok(messages)
}

/// Parse JSON-lines text
///
/// String values are taken verbatim, any other JSON value is re-serialized.
/// Records without an offset continue after the highest offset seen so far
/// in their partition.
pub fn parse_json_lines(content: &str, default_topic: &str) -> Result<Vec<Message>, SourceError> {
    let mut next_offsets: HashMap<TopicPartition, i64> = HashMap::new();
    let mut messages = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: JsonRecord = serde_json::from_str(line).map_err(|e| SourceError::InvalidRecord {
            line: index + 1,
            message: e.to_string(),
        })?;

        let topic = record.topic.unwrap_or_else(|| default_topic.to_string());
        let next = next_offsets
            .entry(TopicPartition::new(topic.clone(), record.partition))
            .or_insert(0);
        let offset = record.offset.unwrap_or(*next);
        let following = offset.checked_add(1).ok_or_else(|| SourceError::InvalidRecord {
            line: index + 1,
            message: format!("offset {} is out of range", offset),
        })?;
        *next = (*next).max(following);

        let value = match record.value {
            serde_json::Value::String(text) => text.into_bytes(),
            other => other.to_string().into_bytes(),
        };

        messages.push(
            Message::new(
                record.key.unwrap_or_default().into_bytes(),
                value,
                topic,
                record.partition,
                offset,
            )
            .with_timestamp(record.timestamp),
        );
    }

    Ok(messages)
}
