//! KvSink - list pushes / hash field sets in one transaction per execute

mod client;
mod memory;
mod parser;
mod ttl;

use std::collections::{BTreeSet, HashMap};

use contracts::{DataEntry, Message, SinkError, Sink};
use tracing::{debug, info, instrument, warn};

pub use self::client::{KvCommand, KvConnection, KvReply, KvTransaction, LocalKvConnection};
pub use self::memory::{KvFault, MemoryKvStore};
pub use self::parser::{parser_from_params, KvEntry, KvHashSetParser, KvListParser, KvParser};
pub use self::ttl::TtlPolicy;

/// Sink writing to a key-value backend
pub struct KvSink<C> {
    name: String,
    parser: Box<dyn KvParser>,
    ttl: TtlPolicy,
    /// `None` once closed
    connection: Option<C>,
    staged: Vec<Message>,
    transaction: KvTransaction,
}

impl<C: KvConnection> KvSink<C> {
    pub fn new(
        name: impl Into<String>,
        parser: Box<dyn KvParser>,
        ttl: TtlPolicy,
        connection: C,
    ) -> Self {
        Self {
            name: name.into(),
            parser,
            ttl,
            connection: Some(connection),
            staged: Vec::new(),
            transaction: KvTransaction::new(),
        }
    }

    /// Create from params map (for factory)
    pub fn from_params(
        name: impl Into<String>,
        params: &HashMap<String, String>,
        connection: C,
    ) -> Result<Self, String> {
        let parser = parser_from_params(params)?;
        let ttl = TtlPolicy::from_params(params)?;
        Ok(Self::new(name, parser, ttl, connection))
    }

    fn stage(&mut self, entries: Vec<DataEntry<KvEntry>>) {
        let mut transaction = KvTransaction::new();
        for entry in entries {
            let key = entry.body.key().to_string();
            transaction.push(entry.origin, entry.body.into_command());
            self.ttl.apply(&mut transaction, &key, entry.origin);
        }
        self.transaction = transaction;
    }
}

impl<C: KvConnection> Sink for KvSink<C> {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        name = "kv_sink_prepare",
        skip(self, batch),
        fields(sink = %self.name, messages = batch.len())
    )]
    fn prepare(&mut self, batch: &[Message]) -> Result<(), SinkError> {
        self.staged.clear();
        self.transaction = KvTransaction::new();

        let mut entries = Vec::with_capacity(batch.len());
        for (origin, message) in batch.iter().enumerate() {
            let parsed = self.parser.parse(message).map_err(|e| {
                SinkError::deserialization(&self.name, e, Some(message.id()))
            })?;
            entries.extend(parsed.into_iter().map(|entry| DataEntry::new(origin, entry)));
        }

        self.stage(entries);
        self.staged = batch.to_vec();
        Ok(())
    }

    #[instrument(
        name = "kv_sink_execute",
        skip(self),
        fields(sink = %self.name, staged = self.staged.len(), commands = self.transaction.len())
    )]
    async fn execute(&mut self) -> Result<Vec<Message>, SinkError> {
        let staged = std::mem::take(&mut self.staged);
        let transaction = std::mem::take(&mut self.transaction);
        if staged.is_empty() {
            return Ok(Vec::new());
        }
        if transaction.is_empty() {
            debug!(sink = %self.name, "Staged messages produced no commands");
            return Ok(Vec::new());
        }

        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| SinkError::closed(&self.name))?;

        let replies = connection
            .exec(&transaction)
            .await
            .map_err(|e| SinkError::backend_unavailable(&self.name, e.to_string()))?;

        let replies = match replies {
            None => {
                return Err(SinkError::backend_unavailable(&self.name, "no reply to EXEC"));
            }
            Some(replies) if replies.is_empty() => {
                return Err(SinkError::backend_unavailable(&self.name, "empty reply to EXEC"));
            }
            Some(replies) if replies.len() != transaction.len() => {
                return Err(SinkError::backend_unavailable(
                    &self.name,
                    format!(
                        "expected {} replies, got {}",
                        transaction.len(),
                        replies.len()
                    ),
                ));
            }
            Some(replies) => replies,
        };

        let mut failed = BTreeSet::new();
        for (index, reply) in replies.iter().enumerate() {
            if let KvReply::Error(error) = reply {
                let Some(origin) = transaction.origin(index) else {
                    continue;
                };
                if let Some(message) = staged.get(origin) {
                    warn!(
                        sink = %self.name,
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %error,
                        "Command failed"
                    );
                }
                failed.insert(origin);
            }
        }

        Ok(failed
            .into_iter()
            .filter_map(|origin| staged.get(origin).cloned())
            .collect())
    }

    #[instrument(name = "kv_sink_close", skip(self), fields(sink = %self.name))]
    async fn close(&mut self) -> Result<(), SinkError> {
        let Some(mut connection) = self.connection.take() else {
            debug!(sink = %self.name, "KvSink already closed");
            return Ok(());
        };

        self.staged.clear();
        connection
            .close()
            .await
            .map_err(|e| SinkError::connection(&self.name, e.to_string()))?;
        info!(sink = %self.name, "KvSink closed");
        Ok(())
    }
}
