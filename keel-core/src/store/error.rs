//! Store error types.

use thiserror::Error;

use crate::resource::{InvalidResource, ResourceId};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(ResourceId),

    /// Operation conflicts with existing resources.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Version mismatch (optimistic concurrency control).
    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u64, actual: u64 },

    /// Resource failed validation.
    #[error("invalid resource: {0}")]
    Invalid(#[from] InvalidResource),

    /// A stored record could not be decoded.
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    /// Database error.
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    /// Internal error.
    #[error("internal: {0}")]
    Internal(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
