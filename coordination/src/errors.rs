// Error handling framework

use thiserror::Error;

/// Failures reported by the shared object store.
///
/// Lease contention and stale conditional writes are not errors; they are
/// ordinary outcomes carried in `Option` / outcome enums on the store trait.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Transient store failure: {0}")]
    Transient(String),
}

/// Errors surfaced by the lease handle and the scheduling primitives.
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Lease on '{target}' was lost or already released")]
    LeaseLost { target: String },

    #[error("Coordinated action failed: {0}")]
    Action(#[source] anyhow::Error),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_io_error() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Transient(err.to_string())
        }
    }
}
