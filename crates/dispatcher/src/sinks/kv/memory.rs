//! In-process key-value store
//!
//! Implements [`KvConnection`] with lists, hashes and key expiry on the tokio
//! clock. Clones share the same data. Faults can be queued to script the
//! outcome of upcoming EXEC calls.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::time::Instant;

use super::client::{KvCommand, KvConnection, KvReply, KvTransaction};
use crate::error::BackendError;

/// Scripted outcome for one EXEC call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvFault {
    /// EXEC returns no reply
    NoReply,
    /// EXEC returns an empty reply list
    EmptyReply,
    /// Transport error
    Transport(String),
    /// Commands at these indexes fail, the rest are applied
    FailCommands(Vec<usize>),
}

#[derive(Debug, Default)]
struct KvState {
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    expirations: HashMap<String, Instant>,
    faults: VecDeque<KvFault>,
    exec_calls: usize,
    close_calls: usize,
}

impl KvState {
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .expirations
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        self.expirations.remove(key);
        let list = self.lists.remove(key).is_some();
        let hash = self.hashes.remove(key).is_some();
        list || hash
    }

    fn exists(&self, key: &str) -> bool {
        self.lists.contains_key(key) || self.hashes.contains_key(key)
    }

    fn apply(&mut self, command: &KvCommand, now: Instant) -> KvReply {
        match command {
            KvCommand::LPush { key, value } => {
                if self.hashes.contains_key(key) {
                    return wrong_type();
                }
                let list = self.lists.entry(key.clone()).or_default();
                list.push_front(value.clone());
                KvReply::Integer(list.len() as i64)
            }
            KvCommand::HSet { key, field, value } => {
                if self.lists.contains_key(key) {
                    return wrong_type();
                }
                let hash = self.hashes.entry(key.clone()).or_default();
                let created = hash.insert(field.clone(), value.clone()).is_none();
                KvReply::Integer(created as i64)
            }
            KvCommand::Expire { key, seconds } => {
                if !self.exists(key) {
                    return KvReply::Integer(0);
                }
                self.expirations
                    .insert(key.clone(), now + Duration::from_secs(*seconds));
                KvReply::Integer(1)
            }
            KvCommand::ExpireAt { key, timestamp } => {
                if !self.exists(key) {
                    return KvReply::Integer(0);
                }
                let now_secs = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|elapsed| elapsed.as_secs())
                    .unwrap_or(0);
                if *timestamp <= now_secs {
                    self.remove(key);
                } else {
                    self.expirations
                        .insert(key.clone(), now + Duration::from_secs(timestamp - now_secs));
                }
                KvReply::Integer(1)
            }
        }
    }
}

fn wrong_type() -> KvReply {
    KvReply::Error("WRONGTYPE Operation against a key holding the wrong kind of value".to_string())
}

/// Shared in-memory key-value store
#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    state: Arc<Mutex<KvState>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcome of the next EXEC without a queued fault
    pub fn inject_fault(&self, fault: KvFault) {
        self.state.lock().faults.push_back(fault);
    }

    /// List contents, most recent push first
    pub fn lrange(&self, key: &str) -> Vec<String> {
        let mut state = self.state.lock();
        state.purge_expired(Instant::now());
        state
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn hgetall(&self, key: &str) -> HashMap<String, String> {
        let mut state = self.state.lock();
        state.purge_expired(Instant::now());
        state.hashes.get(key).cloned().unwrap_or_default()
    }

    pub fn exists(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        state.purge_expired(Instant::now());
        state.exists(key)
    }

    /// Remaining time to live, `None` for missing or persistent keys
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge_expired(now);
        state
            .expirations
            .get(key)
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    pub fn exec_calls(&self) -> usize {
        self.state.lock().exec_calls
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }
}

impl KvConnection for MemoryKvStore {
    async fn exec(
        &mut self,
        transaction: &KvTransaction,
    ) -> Result<Option<Vec<KvReply>>, BackendError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.exec_calls += 1;
        state.purge_expired(now);

        let failing = match state.faults.pop_front() {
            None => Vec::new(),
            Some(KvFault::NoReply) => return Ok(None),
            Some(KvFault::EmptyReply) => return Ok(Some(Vec::new())),
            Some(KvFault::Transport(message)) => return Err(BackendError::new(message)),
            Some(KvFault::FailCommands(indexes)) => indexes,
        };

        let replies = transaction
            .commands()
            .enumerate()
            .map(|(index, command)| {
                if failing.contains(&index) {
                    KvReply::Error("ERR injected failure".to_string())
                } else {
                    state.apply(command, now)
                }
            })
            .collect();

        Ok(Some(replies))
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.state.lock().close_calls += 1;
        Ok(())
    }
}
