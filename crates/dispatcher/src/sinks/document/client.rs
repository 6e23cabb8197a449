//! Document store client interface

use serde_json::{Map, Value};

use crate::error::BackendError;

/// One bulk write operation
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOp {
    /// Replace the document, creating it when missing
    Upsert {
        id: String,
        document: Map<String, Value>,
    },
    /// Merge fields into an existing document only
    Update {
        id: String,
        document: Map<String, Value>,
    },
}

impl DocumentOp {
    pub fn id(&self) -> &str {
        match self {
            DocumentOp::Upsert { id, .. } | DocumentOp::Update { id, .. } => id,
        }
    }
}

/// Result of one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Modified,
    /// Update target does not exist
    NotFound,
    Failed { code: i32, message: String },
}

/// Document backend connection
#[trait_variant::make(DocumentStore: Send)]
pub trait LocalDocumentStore {
    /// Unordered bulk write
    ///
    /// `Ok(None)` means the server acknowledged nothing; otherwise one outcome
    /// per operation, in order.
    async fn bulk_write(
        &mut self,
        collection: &str,
        ops: &[DocumentOp],
    ) -> Result<Option<Vec<WriteOutcome>>, BackendError>;

    async fn close(&mut self) -> Result<(), BackendError>;
}
