//! Error types for mnemon.

use thiserror::Error;

use crate::model::ItemId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("memory item not found: {0}")]
    NotFound(ItemId),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("audit write failed for item {item_id}: {reason}")]
    AuditWriteFailure { item_id: ItemId, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
