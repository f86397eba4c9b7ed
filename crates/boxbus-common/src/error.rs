//! Error types for the boxbus coordination layer
//!
//! Every store call in the workspace funnels through this one closed
//! enumeration, so callers match on fault kinds instead of transport
//! details.

/// Fault taxonomy for cluster coordination operations.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The key-value store could not be reached. Watch loops retry with
    /// backoff; synchronous callers see this immediately.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The key does not exist. Registry and config reads treat this as
    /// empty state rather than a failure.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// A conditional write lost the race: the store's current value did
    /// not match the expected previous value, or the key already existed.
    #[error("compare-and-swap failed for {0}")]
    CasFailed(String),

    /// The store rejected the request for a non-retriable reason.
    #[error("store rejected request: {0}")]
    Rejected(String),

    /// A held lock's lease could not be kept alive.
    #[error("lock lost")]
    LockLost,

    /// The mutex was released and cannot be reused.
    #[error("lock is no longer usable")]
    LockClosed,

    /// No box currently hosts the requested service.
    #[error("no box registered for service '{0}'")]
    ServiceNotFound(String),

    /// A section, key, or lock name failed validation.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// The store returned a document this layer could not decode.
    #[error("malformed store document: {0}")]
    Parse(String),
}

impl ClusterError {
    /// Whether this is a connectivity fault that watch loops retry.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ClusterError::StoreUnavailable(_))
    }

    /// Whether this is key absence, treated as empty state by readers.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::KeyNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
