//! Error types for labelq.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::ItemId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("item not found: {0}")]
    NotFound(ItemId),

    /// The presented lease token is not the item's current lease. The caller
    /// lost the item (expired, released, or already finalized) and must
    /// reserve again.
    #[error("reservation mismatch for item {0}: lease is no longer held")]
    ReservationMismatch(ItemId),

    #[error("storage error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("image source unavailable at {}: {source}", path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The caller's lease is stale; it should re-reserve rather than retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ReservationMismatch(_))
    }

    /// Transient store failures that may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
