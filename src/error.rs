//! Error types for the schema file engine.
//!
//! The storage layer (codec, segment, page, record) returns the typed
//! [`StoreError`] so that callers can branch on control-flow variants:
//! `SchemaFile` catches [`StoreError::SegmentOverflow`] to drive segment
//! growth and chaining, and [`StoreError::PageOverflow`] to allocate a new
//! page. Every other variant propagates. Orchestration layers wrap these
//! into `eyre::Report` via `?`.

use thiserror::Error;

/// Result alias for the storage layer.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Inserting a key that already exists in a segment.
    #[error("record key already exists: {0}")]
    DuplicateKey(String),

    /// Update or delete of a key the segment chain does not hold.
    #[error("record key not found: {0}")]
    KeyNotFound(String),

    /// The segment has no room for the operation. Recovered internally by
    /// growth or chaining; never surfaced to the store API.
    #[error("segment overflow")]
    SegmentOverflow,

    /// The page has no contiguous free space for a segment allocation.
    #[error("page overflow: requested {requested} bytes, {available} free")]
    PageOverflow { requested: usize, available: usize },

    /// A single record exceeds the maximum segment size. Fatal to the
    /// operation.
    #[error("colossal record for key {key}: {size} bytes exceeds one segment")]
    ColossalRecord { key: String, size: usize },

    /// An invariant violation detected while parsing a page or segment.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Underlying read/write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        StoreError::Corrupt(msg.into())
    }
}
