//! Dead-letter destination for messages whose retry budget is spent

use std::collections::HashMap;

use contracts::{DeadLetterConfig, Message, Sink, SinkError, SinkType};
use tracing::{error, instrument};

use crate::error::DispatcherError;
use crate::sinks::{BlobSink, LogSink};

/// Dead-letter sink (log or blob)
pub enum DeadLetter {
    Log(LogSink),
    Blob(BlobSink),
}

impl DeadLetter {
    /// Build the destination named by `config`
    ///
    /// `name` identifies the owning pipeline sink in logs.
    pub fn from_config(name: &str, config: &DeadLetterConfig) -> Result<Self, DispatcherError> {
        let dlq_name = format!("{}-dlq", name);
        match config.sink_type {
            SinkType::Log => Ok(DeadLetter::Log(LogSink::new(dlq_name))),
            SinkType::Blob => BlobSink::from_params(&dlq_name, &config.params)
                .map(DeadLetter::Blob)
                .map_err(|e| DispatcherError::sink_creation(&dlq_name, e.to_string())),
            other => Err(DispatcherError::sink_creation(
                dlq_name,
                format!("unsupported dead-letter type {:?}", other),
            )),
        }
    }

    /// Blob destination under `base_path`
    pub fn blob(name: &str, base_path: &str) -> Result<Self, DispatcherError> {
        let params = HashMap::from([("base_path".to_string(), base_path.to_string())]);
        Self::from_config(
            name,
            &DeadLetterConfig {
                sink_type: SinkType::Blob,
                params,
            },
        )
    }

    pub fn name(&self) -> &str {
        match self {
            DeadLetter::Log(sink) => sink.name(),
            DeadLetter::Blob(sink) => sink.name(),
        }
    }

    /// Write every message or fail
    #[instrument(name = "dead_letter_send", skip(self, messages), fields(dlq = %self.name(), messages = messages.len()))]
    pub async fn send(&mut self, messages: &[Message]) -> Result<(), SinkError> {
        if messages.is_empty() {
            return Ok(());
        }

        match self {
            DeadLetter::Log(sink) => write_all(sink, messages).await,
            DeadLetter::Blob(sink) => write_all(sink, messages).await,
        }
    }

    pub async fn close(&mut self) -> Result<(), SinkError> {
        match self {
            DeadLetter::Log(sink) => sink.close().await,
            DeadLetter::Blob(sink) => sink.close().await,
        }
    }
}

async fn write_all<S: Sink>(sink: &mut S, messages: &[Message]) -> Result<(), SinkError> {
    sink.prepare(messages)?;
    let failed = sink.execute().await?;
    if failed.is_empty() {
        return Ok(());
    }

    error!(
        dlq = %sink.name(),
        failed = failed.len(),
        "Dead-letter write incomplete"
    );
    Err(SinkError::backend_unavailable(
        sink.name(),
        format!("{} of {} messages not written", failed.len(), messages.len()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_blob_dead_letter_writes_records() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_string_lossy().to_string();
        let mut dlq = DeadLetter::blob("orders", &base).unwrap();
        assert_eq!(dlq.name(), "orders-dlq");

        let message = Message::new("k", r#"{"id":1}"#, "orders", 0, 5).with_timestamp(0);
        dlq.send(&[message]).await.unwrap();
        dlq.close().await.unwrap();

        let hour_dir = dir.path().join("orders/dt=1970-01-01/hr=00");
        assert_eq!(fs::read_dir(hour_dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_closed_dead_letter_fails() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_string_lossy().to_string();
        let mut dlq = DeadLetter::blob("orders", &base).unwrap();
        dlq.close().await.unwrap();

        let message = Message::new("", "{}", "orders", 0, 0);
        assert!(dlq.send(&[message]).await.is_err());
    }

    #[test]
    fn test_unsupported_type() {
        let config = DeadLetterConfig {
            sink_type: SinkType::Kv,
            params: HashMap::new(),
        };
        assert!(DeadLetter::from_config("x", &config).is_err());
    }
}
