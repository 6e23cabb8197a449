//! DocumentSink - bulk upserts / updates keyed by a payload primary key

mod client;
mod memory;

use std::collections::HashMap;

use contracts::{DataEntry, Message, Sink, SinkError};
use observability::metrics;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

pub use self::client::{DocumentOp, DocumentStore, LocalDocumentStore, WriteOutcome};
pub use self::memory::{DocumentFault, MemoryDocumentStore};
use crate::sinks::template::{lookup, parse_object, scalar_to_string};

/// Parsed document with its primary key
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocument {
    pub primary_key: String,
    pub document: Map<String, Value>,
}

/// Turns a message into a document
pub trait DocumentParser: Send + Sync {
    fn parse(&self, message: &Message) -> Result<ParsedDocument, String>;
}

/// JSON object payload, primary key read from a configured field
#[derive(Debug, Clone)]
pub struct JsonDocumentParser {
    primary_key: String,
}

impl JsonDocumentParser {
    pub fn new(primary_key: impl Into<String>) -> Self {
        Self {
            primary_key: primary_key.into(),
        }
    }
}

impl DocumentParser for JsonDocumentParser {
    fn parse(&self, message: &Message) -> Result<ParsedDocument, String> {
        let document = parse_object(message)?;
        let key = lookup(&document, &self.primary_key)
            .ok_or_else(|| format!("missing primary key '{}'", self.primary_key))?;
        let primary_key = scalar_to_string(key, &self.primary_key)?;
        Ok(ParsedDocument {
            primary_key,
            document,
        })
    }
}

/// Write mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DocumentMode {
    #[default]
    Upsert,
    /// Never create missing documents
    UpdateOnly,
}

/// Document sink settings
#[derive(Debug, Clone)]
pub struct DocumentSinkConfig {
    pub collection: String,
    pub mode: DocumentMode,
    /// Error codes that are dropped instead of retried
    pub retry_code_blacklist: Vec<i32>,
}

impl DocumentSinkConfig {
    /// Create config from params map
    pub fn from_params(sink_name: &str, params: &HashMap<String, String>) -> Result<Self, String> {
        let collection = params
            .get("collection")
            .cloned()
            .unwrap_or_else(|| sink_name.to_string());

        let mode = match params.get("mode").map(String::as_str) {
            Some("upsert") | None => DocumentMode::Upsert,
            Some("update_only") => DocumentMode::UpdateOnly,
            Some(other) => return Err(format!("unknown mode '{}'", other)),
        };

        let retry_code_blacklist = params
            .get("retry_code_blacklist")
            .map(String::as_str)
            .unwrap_or("11000")
            .split(',')
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(|code| {
                code.parse()
                    .map_err(|e| format!("invalid error code '{}': {}", code, e))
            })
            .collect::<Result<Vec<i32>, String>>()?;

        Ok(Self {
            collection,
            mode,
            retry_code_blacklist,
        })
    }
}

/// Sink writing to a document store
pub struct DocumentSink<D> {
    name: String,
    config: DocumentSinkConfig,
    parser: Box<dyn DocumentParser>,
    store: Option<D>,
    staged: Vec<Message>,
    ops: Vec<DataEntry<DocumentOp>>,
}

impl<D: DocumentStore> DocumentSink<D> {
    pub fn new(
        name: impl Into<String>,
        config: DocumentSinkConfig,
        parser: Box<dyn DocumentParser>,
        store: D,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            parser,
            store: Some(store),
            staged: Vec::new(),
            ops: Vec::new(),
        }
    }

    /// Create from params map (for factory)
    pub fn from_params(
        name: impl Into<String>,
        params: &HashMap<String, String>,
        store: D,
    ) -> Result<Self, String> {
        let name = name.into();
        let primary_key = params
            .get("primary_key")
            .ok_or_else(|| "missing 'primary_key' parameter".to_string())?;
        let config = DocumentSinkConfig::from_params(&name, params)?;
        Ok(Self::new(
            name,
            config,
            Box::new(JsonDocumentParser::new(primary_key.clone())),
            store,
        ))
    }

    fn to_op(&self, parsed: ParsedDocument) -> DocumentOp {
        match self.config.mode {
            DocumentMode::Upsert => DocumentOp::Upsert {
                id: parsed.primary_key,
                document: parsed.document,
            },
            DocumentMode::UpdateOnly => DocumentOp::Update {
                id: parsed.primary_key,
                document: parsed.document,
            },
        }
    }
}

impl<D: DocumentStore> Sink for DocumentSink<D> {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        name = "document_sink_prepare",
        skip(self, batch),
        fields(sink = %self.name, messages = batch.len())
    )]
    fn prepare(&mut self, batch: &[Message]) -> Result<(), SinkError> {
        self.staged.clear();
        self.ops.clear();

        let mut ops = Vec::with_capacity(batch.len());
        for (origin, message) in batch.iter().enumerate() {
            let parsed = self.parser.parse(message).map_err(|e| {
                SinkError::deserialization(&self.name, e, Some(message.id()))
            })?;
            ops.push(DataEntry::new(origin, self.to_op(parsed)));
        }

        self.ops = ops;
        self.staged = batch.to_vec();
        Ok(())
    }

    #[instrument(
        name = "document_sink_execute",
        skip(self),
        fields(sink = %self.name, collection = %self.config.collection, staged = self.staged.len())
    )]
    async fn execute(&mut self) -> Result<Vec<Message>, SinkError> {
        let staged = std::mem::take(&mut self.staged);
        let entries = std::mem::take(&mut self.ops);
        if staged.is_empty() {
            return Ok(Vec::new());
        }

        let store = self
            .store
            .as_mut()
            .ok_or_else(|| SinkError::closed(&self.name))?;

        let (origins, ops): (Vec<usize>, Vec<DocumentOp>) = entries
            .into_iter()
            .map(|entry| (entry.origin, entry.body))
            .unzip();

        let outcomes = store
            .bulk_write(&self.config.collection, &ops)
            .await
            .map_err(|e| SinkError::backend_unavailable(&self.name, e.to_string()))?
            .ok_or_else(|| SinkError::backend_unavailable(&self.name, "no bulk write reply"))?;

        if outcomes.len() != ops.len() {
            return Err(SinkError::backend_unavailable(
                &self.name,
                format!("expected {} results, got {}", ops.len(), outcomes.len()),
            ));
        }

        let mut failed = Vec::new();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            let Some(message) = staged.get(origins[index]) else {
                continue;
            };
            match outcome {
                WriteOutcome::Inserted | WriteOutcome::Modified => {}
                WriteOutcome::NotFound => {
                    warn!(
                        sink = %self.name,
                        id = ops[index].id(),
                        partition = message.partition,
                        offset = message.offset,
                        "Update target not found, document not created"
                    );
                    metrics::record_message_dropped(&self.name, "document_missing", 1);
                }
                WriteOutcome::Failed { code, message: error }
                    if self.config.retry_code_blacklist.contains(&code) =>
                {
                    warn!(
                        sink = %self.name,
                        code,
                        error = %error,
                        partition = message.partition,
                        offset = message.offset,
                        "Non-retriable write error, message dropped"
                    );
                    metrics::record_message_dropped(&self.name, "blacklisted_code", 1);
                }
                WriteOutcome::Failed { code, message: error } => {
                    warn!(
                        sink = %self.name,
                        code,
                        error = %error,
                        partition = message.partition,
                        offset = message.offset,
                        "Write failed"
                    );
                    failed.push(message.clone());
                }
            }
        }

        Ok(failed)
    }

    #[instrument(name = "document_sink_close", skip(self), fields(sink = %self.name))]
    async fn close(&mut self) -> Result<(), SinkError> {
        let Some(mut store) = self.store.take() else {
            debug!(sink = %self.name, "DocumentSink already closed");
            return Ok(());
        };

        self.staged.clear();
        store
            .close()
            .await
            .map_err(|e| SinkError::connection(&self.name, e.to_string()))?;
        info!(sink = %self.name, "DocumentSink closed");
        Ok(())
    }
}
