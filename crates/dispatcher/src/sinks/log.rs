//! LogSink - logs message summaries via tracing

use contracts::{Message, Sink, SinkError};
use tracing::{debug, info, instrument};

/// Payload bytes shown per message
const PREVIEW_LEN: usize = 128;

/// Sink that logs message summaries for debugging
pub struct LogSink {
    name: String,
    staged: Vec<Message>,
    closed: bool,
}

impl LogSink {
    /// Create a new LogSink with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            staged: Vec::new(),
            closed: false,
        }
    }

    fn log_message_summary(&self, message: &Message) {
        let end = message.value.len().min(PREVIEW_LEN);
        let preview = String::from_utf8_lossy(&message.value[..end]);

        info!(
            sink = %self.name,
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            timestamp = message.timestamp,
            key = %message.key_str(),
            bytes = message.value.len(),
            preview = %preview,
            "Message received"
        );
    }
}

impl Sink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&mut self, batch: &[Message]) -> Result<(), SinkError> {
        self.staged = batch.to_vec();
        Ok(())
    }

    #[instrument(
        name = "log_sink_execute",
        skip(self),
        fields(sink = %self.name, staged = self.staged.len())
    )]
    async fn execute(&mut self) -> Result<Vec<Message>, SinkError> {
        for message in std::mem::take(&mut self.staged) {
            self.log_message_summary(&message);
        }
        Ok(Vec::new())
    }

    #[instrument(name = "log_sink_close", skip(self))]
    async fn close(&mut self) -> Result<(), SinkError> {
        if self.closed {
            debug!(sink = %self.name, "LogSink already closed");
            return Ok(());
        }
        self.closed = true;
        info!(sink = %self.name, "LogSink closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_sink_never_fails() {
        let mut sink = LogSink::new("test_log");
        sink.prepare(&[
            Message::new("k", "v", "t", 0, 0),
            Message::new("", vec![0xff, 0xfe], "t", 0, 1),
        ])
        .unwrap();

        assert!(sink.execute().await.unwrap().is_empty());
        // Staged messages are consumed by execute
        assert!(sink.execute().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_sink_name_and_close() {
        let mut sink = LogSink::new("my_logger");
        assert_eq!(sink.name(), "my_logger");
        sink.close().await.unwrap();
        sink.close().await.unwrap();
    }
}
