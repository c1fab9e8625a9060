//! Controller error taxonomy.

use std::time::Duration;

use thiserror::Error;

use crate::resource::ResourceRef;
use crate::store::StoreError;

/// Errors surfaced by dispatch, patching and convergence waits.
#[derive(Debug, Error)]
pub enum Error {
    /// One handler failed or panicked. Isolated to that handler.
    #[error("handler {name} failed: {message}")]
    Handler { name: String, message: String },

    /// Optimistic-concurrency rejection that outlived the retry budget.
    #[error("conflict on {reference} after {attempts} attempt(s)")]
    Conflict {
        reference: ResourceRef,
        attempts: u32,
    },

    /// A deadline passed while waiting for a lock, a write or convergence.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Reading the round's starting state failed.
    #[error("transient read failure: {0}")]
    TransientRead(#[source] StoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether re-running the same work later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Handler { .. }
            | Error::Conflict { .. }
            | Error::Timeout { .. }
            | Error::TransientRead(_) => true,
            Error::Store(e) => matches!(
                e,
                StoreError::Unavailable(_) | StoreError::VersionMismatch { .. }
            ),
            Error::Serialization(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
