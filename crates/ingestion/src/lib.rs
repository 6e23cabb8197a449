//! # Ingestion
//!
//! Log source implementations.
//!
//! Responsibilities:
//! - Channel-backed `MemoryLogSource`, cloned once per worker
//! - Record commits in a shared `CommitLog`
//! - Load JSON-lines input files for bounded backfill runs
//!
//! ## Usage Example
//!
//! ```ignore
//! use ingestion::{load_json_lines, MemoryLogSource, SourceOptions};
//!
//! let messages = load_json_lines("input.jsonl", "events")?;
//! let source = MemoryLogSource::bounded(messages, SourceOptions::default());
//!
//! // One clone per worker; they share the queue and the commit log
//! let worker_source = source.clone();
//! ```

mod json_lines;
mod memory;

pub use json_lines::{load_json_lines, parse_json_lines};
pub use memory::{CommitLog, LogProducer, MemoryLogSource, SourceOptions};
