//! Sink implementations
//!
//! Contains LogSink, KvSink, DocumentSink, BlobSink and HttpSink, plus the
//! [`AnySink`] enum used when the backend is chosen from configuration.

mod blob;
mod document;
mod http;
mod kv;
mod log;
pub(crate) mod template;

use contracts::{Message, SinkConfig, SinkError, SinkType, Sink};
use tracing::instrument;

pub use self::blob::{partition_dir, BlobRecord, BlobSink, BlobSinkConfig, RecordMetadata};
pub use self::document::{
    DocumentFault, DocumentMode, DocumentOp, DocumentParser, DocumentSink, DocumentSinkConfig,
    DocumentStore, JsonDocumentParser, LocalDocumentStore, MemoryDocumentStore, ParsedDocument,
    WriteOutcome,
};
pub use self::http::{HttpSink, HttpSinkConfig, RetryableStatus};
pub use self::kv::{
    parser_from_params, KvCommand, KvConnection, KvEntry, KvFault, KvHashSetParser, KvListParser,
    KvParser, KvReply, KvSink, KvTransaction, LocalKvConnection, MemoryKvStore, TtlPolicy,
};
pub use self::log::LogSink;
pub use self::template::KeyTemplate;

use crate::error::DispatcherError;

/// Runtime-selected sink
pub enum AnySink {
    Log(LogSink),
    Kv(KvSink<MemoryKvStore>),
    Document(DocumentSink<MemoryDocumentStore>),
    Blob(BlobSink),
    Http(HttpSink),
}

impl Sink for AnySink {
    fn name(&self) -> &str {
        match self {
            AnySink::Log(sink) => sink.name(),
            AnySink::Kv(sink) => sink.name(),
            AnySink::Document(sink) => sink.name(),
            AnySink::Blob(sink) => sink.name(),
            AnySink::Http(sink) => sink.name(),
        }
    }

    fn prepare(&mut self, batch: &[Message]) -> Result<(), SinkError> {
        match self {
            AnySink::Log(sink) => sink.prepare(batch),
            AnySink::Kv(sink) => sink.prepare(batch),
            AnySink::Document(sink) => sink.prepare(batch),
            AnySink::Blob(sink) => sink.prepare(batch),
            AnySink::Http(sink) => sink.prepare(batch),
        }
    }

    async fn execute(&mut self) -> Result<Vec<Message>, SinkError> {
        match self {
            AnySink::Log(sink) => sink.execute().await,
            AnySink::Kv(sink) => sink.execute().await,
            AnySink::Document(sink) => sink.execute().await,
            AnySink::Blob(sink) => sink.execute().await,
            AnySink::Http(sink) => sink.execute().await,
        }
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        match self {
            AnySink::Log(sink) => sink.close().await,
            AnySink::Kv(sink) => sink.close().await,
            AnySink::Document(sink) => sink.close().await,
            AnySink::Blob(sink) => sink.close().await,
            AnySink::Http(sink) => sink.close().await,
        }
    }
}

/// Builds sinks from configuration
///
/// Key-value and document sinks are backed by in-process stores shared by
/// every sink this factory creates.
#[derive(Debug, Clone, Default)]
pub struct SinkFactory {
    kv_store: MemoryKvStore,
    document_store: MemoryDocumentStore,
}

impl SinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stores(kv_store: MemoryKvStore, document_store: MemoryDocumentStore) -> Self {
        Self {
            kv_store,
            document_store,
        }
    }

    pub fn kv_store(&self) -> &MemoryKvStore {
        &self.kv_store
    }

    pub fn document_store(&self) -> &MemoryDocumentStore {
        &self.document_store
    }

    /// Create a sink from configuration
    #[instrument(
        name = "sink_factory_create",
        skip(self, config),
        fields(sink = %config.name, sink_type = ?config.sink_type)
    )]
    pub fn create(&self, config: &SinkConfig) -> Result<AnySink, DispatcherError> {
        let creation = |message: String| DispatcherError::sink_creation(&config.name, message);

        match config.sink_type {
            SinkType::Log => Ok(AnySink::Log(LogSink::new(&config.name))),
            SinkType::Kv => KvSink::from_params(&config.name, &config.params, self.kv_store.clone())
                .map(AnySink::Kv)
                .map_err(creation),
            SinkType::Document => DocumentSink::from_params(
                &config.name,
                &config.params,
                self.document_store.clone(),
            )
            .map(AnySink::Document)
            .map_err(creation),
            SinkType::Blob => BlobSink::from_params(&config.name, &config.params)
                .map(AnySink::Blob)
                .map_err(|e| creation(e.to_string())),
            SinkType::Http => HttpSink::from_params(&config.name, &config.params)
                .map(AnySink::Http)
                .map_err(|e| creation(e.to_string())),
        }
    }
}
