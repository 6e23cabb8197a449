//! Key-value client interface
//!
//! Modelled on a Redis transaction: commands are queued, then sent as one
//! MULTI/EXEC block that yields one reply per command.

use crate::error::BackendError;

/// Command queued inside a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvCommand {
    /// Prepend to a list
    LPush { key: String, value: String },
    /// Set one hash field
    HSet {
        key: String,
        field: String,
        value: String,
    },
    /// Relative TTL in seconds
    Expire { key: String, seconds: u64 },
    /// Absolute expiry as epoch seconds
    ExpireAt { key: String, timestamp: u64 },
}

impl KvCommand {
    pub fn key(&self) -> &str {
        match self {
            KvCommand::LPush { key, .. }
            | KvCommand::HSet { key, .. }
            | KvCommand::Expire { key, .. }
            | KvCommand::ExpireAt { key, .. } => key,
        }
    }
}

/// Reply to one queued command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvReply {
    Ok,
    Integer(i64),
    Error(String),
}

#[derive(Debug, Clone)]
struct QueuedCommand {
    origin: usize,
    command: KvCommand,
}

/// Commands staged for one EXEC
///
/// Every command remembers the index of the staged message it came from.
#[derive(Debug, Clone, Default)]
pub struct KvTransaction {
    queued: Vec<QueuedCommand>,
}

impl KvTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, origin: usize, command: KvCommand) {
        self.queued.push(QueuedCommand { origin, command });
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    pub fn commands(&self) -> impl Iterator<Item = &KvCommand> {
        self.queued.iter().map(|queued| &queued.command)
    }

    /// Originating message index of command `index`
    pub fn origin(&self, index: usize) -> Option<usize> {
        self.queued.get(index).map(|queued| queued.origin)
    }
}

/// Key-value backend connection
#[trait_variant::make(KvConnection: Send)]
pub trait LocalKvConnection {
    /// Run the transaction
    ///
    /// `Ok(None)` means the server returned no reply (aborted transaction or
    /// lost connection); `Ok(Some(replies))` holds one reply per command.
    async fn exec(&mut self, transaction: &KvTransaction)
        -> Result<Option<Vec<KvReply>>, BackendError>;

    /// Release the connection
    async fn close(&mut self) -> Result<(), BackendError>;
}
