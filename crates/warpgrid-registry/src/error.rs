//! Error types for the WarpGrid registry.

use thiserror::Error;
use warpgrid_coord::CoordError;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur while reading or writing registry records.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Coord(#[from] CoordError),

    #[error("invalid {record}: {reason}")]
    Validation { record: &'static str, reason: String },

    #[error("could not {action} path {path}: {message}")]
    Lookup {
        action: &'static str,
        path: String,
        message: String,
    },

    #[error("cannot update {key}: found {children} local items")]
    Conflict { key: String, children: usize },

    #[error("invalid pattern {pattern}: {reason}")]
    Pattern { pattern: String, reason: String },
}

impl RegistryError {
    pub(crate) fn invalid(record: &'static str, reason: impl Into<String>) -> Self {
        RegistryError::Validation {
            record,
            reason: reason.into(),
        }
    }
}
