//! Error types for the WarpGrid coordination store.

use thiserror::Error;

/// Result type alias for coordination store operations.
pub type CoordResult<T> = Result<T, CoordError>;

/// Errors returned by a [`Connection`](crate::Connection).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordError {
    #[error("node does not exist: {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("version conflict on {0}")]
    BadVersion(String),

    #[error("ephemeral node cannot have children: {0}")]
    NoChildrenForEphemerals(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("session expired")]
    SessionExpired,

    #[error("connection closed")]
    Closed,
}

impl CoordError {
    /// True for the errors a watch loop should survive by re-reading.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordError::NoNode(_) | CoordError::BadVersion(_))
    }
}
