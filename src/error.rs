//! Error taxonomy for the cache core.

use thiserror::Error;

use crate::key::QueryKey;

/// Failure reported by the caller-supplied remote data source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Transport-level failure before any response arrived.
    #[error("network failure: {0}")]
    Network(String),
    /// Non-2xx response with a server-provided message.
    #[error("server responded {status}: {message}")]
    Server { status: u16, message: String },
}

impl RemoteError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }
}

/// Errors surfaced by cache operations.
///
/// `SequenceConflict` and `RollbackFailure` are fatal for their key: the
/// stored value can no longer be trusted and must be re-fetched from scratch.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// Input rejected before dispatch; the remote call was never issued.
    #[error("validation failed: {0}")]
    Validation(String),
    /// A page resolution arrived that does not continue the stored sequence.
    #[error("page {got} does not continue the sequence ending at page {expected}")]
    SequenceConflict { expected: u32, got: u32 },
    /// An optimistic snapshot could not be restored; the entry was evicted.
    #[error("rollback failed for key `{key}`: {reason}")]
    RollbackFailure { key: QueryKey, reason: String },
}

impl CacheError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// True for conditions that invalidate the key's stored value entirely.
    pub fn is_fatal_for_key(&self) -> bool {
        matches!(
            self,
            CacheError::SequenceConflict { .. } | CacheError::RollbackFailure { .. }
        )
    }
}
