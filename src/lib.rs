//! # mnemon
//!
//! Hybrid memory retrieval and pruning engine for conversational AI agents.
//!
//! Ranks candidate memories by a weighted blend of semantic similarity,
//! lexical overlap, and recency; filters near-duplicates; packs the result
//! under a token budget; and prunes low-value items in the background with
//! a full audit trail. SQLite-backed, consumed as a library by a larger
//! agent system.

pub mod budget;
pub mod config;
pub mod diversity;
pub mod engine;
pub mod error;
pub mod model;
pub mod prune;
pub mod rank;
pub mod store;
pub mod telemetry;

pub use engine::{ContextRequest, Engine};
pub use error::{Error, Result};
pub use model::{Category, ContextBundle, ItemId, MemoryItem, NewMemoryItem, UpsertResult};
pub use store::{ItemStore, SqliteStore};
