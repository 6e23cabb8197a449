//! # Contracts
//!
//! Frozen interface contracts, defining inter-module data structures and traits.
//! All business crates can only depend on this crate, reverse dependencies are prohibited.
//!
//! ## Delivery Model
//! - At-least-once: an offset is committed only after its message was sunk,
//!   filtered out, dropped or dead-lettered
//! - Offsets are ordered per `TopicPartition` only

mod error;
mod filter;
mod message;
mod pipeline;
mod sink;
mod source;

pub use error::*;
pub use filter::{AcceptAll, FilterRule, MessageFilter};
pub use message::*;
pub use pipeline::*;
pub use sink::*;
pub use source::*;
