//! Store error types.

use thiserror::Error;

use crate::resource::{ResourceRef, Version};

/// Errors that can occur during store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(ResourceRef),

    /// A resource with this reference already exists.
    #[error("already exists: {0}")]
    AlreadyExists(ResourceRef),

    /// Version mismatch (optimistic concurrency control).
    #[error("version mismatch on {reference}: expected {expected}, got {actual}")]
    VersionMismatch {
        reference: ResourceRef,
        expected: Version,
        actual: Version,
    },

    /// The store could not be reached; the request may succeed if retried.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionMismatch { .. })
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
