//! Error taxonomy shared by every SAGE crate
//!
//! Expected governance conditions (validation, not-found, conflict,
//! terminal state) are typed variants callers branch on. Infrastructure
//! failures (storage connections, queries, transport) are separate
//! variants a caller may retry; every mutating SAGE operation is
//! idempotent, so retries are safe.

use thiserror::Error;

/// Storage-layer errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Row not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness or concurrent-update conflict
    #[error("conflict: {0}")]
    Conflict(String),

    /// The row is in a terminal state and rejects the transition
    #[error("terminal state: {0}")]
    TerminalState(String),

    /// The data failed a storage-level validity check
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Could not reach the backing store
    #[error("connection error: {0}")]
    Connection(String),

    /// A query failed
    #[error("query error: {0}")]
    Query(String),

    /// Row content could not be serialized or deserialized
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Transport-layer errors
#[derive(Debug, Error)]
pub enum BusError {
    /// The topic channel is closed
    #[error("channel closed: {0}")]
    Closed(String),

    /// Publishing failed after retries were exhausted
    #[error("publish failed: {0}")]
    PublishFailed(String),
}

/// Result type alias for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Top-level errors returned by the governance services
#[derive(Debug, Error)]
pub enum GovernanceError {
    /// Input failed validation
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation conflicts with existing state
    #[error("conflict: {0}")]
    Conflict(String),

    /// The entity is in a terminal state and rejects the operation
    #[error("terminal state: {0}")]
    TerminalState(String),

    /// The change is missing or no longer eligible for the operation
    #[error("change not registered: {0}")]
    NotRegistered(String),

    /// Storage infrastructure failure
    #[error("storage error: {0}")]
    Storage(StoreError),

    /// Transport infrastructure failure
    #[error("transport error: {0}")]
    Transport(#[from] BusError),
}

/// Result type alias for governance operations
pub type GovernanceResult<T> = Result<T, GovernanceError>;

/// Lifts expected store conditions into their governance counterparts;
/// infrastructure failures stay wrapped as [`GovernanceError::Storage`].
impl From<StoreError> for GovernanceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => GovernanceError::NotFound(msg),
            StoreError::Conflict(msg) => GovernanceError::Conflict(msg),
            StoreError::TerminalState(msg) => GovernanceError::TerminalState(msg),
            StoreError::InvalidData(msg) => GovernanceError::Validation(msg),
            other => GovernanceError::Storage(other),
        }
    }
}
