//! In-process document store

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::client::{DocumentOp, DocumentStore, WriteOutcome};
use crate::error::BackendError;

/// Scripted outcome for one bulk write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentFault {
    NoReply,
    Transport(String),
    /// Operations at these indexes fail with `code`
    FailOps { indexes: Vec<usize>, code: i32 },
}

type Collection = BTreeMap<String, Map<String, Value>>;

#[derive(Debug, Default)]
struct DocumentState {
    collections: HashMap<String, Collection>,
    faults: VecDeque<DocumentFault>,
    bulk_calls: usize,
    close_calls: usize,
}

/// Shared in-memory document store
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    state: Arc<Mutex<DocumentState>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_fault(&self, fault: DocumentFault) {
        self.state.lock().faults.push_back(fault);
    }

    /// Seed a document
    pub fn insert(&self, collection: &str, id: &str, document: Map<String, Value>) {
        self.state
            .lock()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document);
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Map<String, Value>> {
        self.state
            .lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id).cloned())
    }

    pub fn count(&self, collection: &str) -> usize {
        self.state
            .lock()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    pub fn bulk_calls(&self) -> usize {
        self.state.lock().bulk_calls
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }
}

fn apply(docs: &mut Collection, op: &DocumentOp) -> WriteOutcome {
    match op {
        DocumentOp::Upsert { id, document } => match docs.insert(id.clone(), document.clone()) {
            Some(_) => WriteOutcome::Modified,
            None => WriteOutcome::Inserted,
        },
        DocumentOp::Update { id, document } => match docs.get_mut(id) {
            Some(existing) => {
                for (field, value) in document {
                    existing.insert(field.clone(), value.clone());
                }
                WriteOutcome::Modified
            }
            None => WriteOutcome::NotFound,
        },
    }
}

impl DocumentStore for MemoryDocumentStore {
    async fn bulk_write(
        &mut self,
        collection: &str,
        ops: &[DocumentOp],
    ) -> Result<Option<Vec<WriteOutcome>>, BackendError> {
        let mut state = self.state.lock();
        state.bulk_calls += 1;

        let (failing, code) = match state.faults.pop_front() {
            None => (Vec::new(), 0),
            Some(DocumentFault::NoReply) => return Ok(None),
            Some(DocumentFault::Transport(message)) => return Err(BackendError::new(message)),
            Some(DocumentFault::FailOps { indexes, code }) => (indexes, code),
        };

        let docs = state.collections.entry(collection.to_string()).or_default();
        let outcomes = ops
            .iter()
            .enumerate()
            .map(|(index, op)| {
                if failing.contains(&index) {
                    WriteOutcome::Failed {
                        code,
                        message: format!("injected failure for '{}'", op.id()),
                    }
                } else {
                    apply(docs, op)
                }
            })
            .collect();

        Ok(Some(outcomes))
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.state.lock().close_calls += 1;
        Ok(())
    }
}
