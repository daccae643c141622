//! Mesh error types

use crate::store::StoreError;
use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = std::result::Result<T, MeshError>;

/// Errors raised by the channel distribution mesh
#[derive(Debug, Error)]
pub enum MeshError {
    // ==================== Substrate Faults ====================
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    // ==================== Data Faults ====================
    #[error("invalid channel spec {spec:?}: {reason}")]
    InvalidSpec { spec: String, reason: String },

    #[error("malformed channel document at {path}: {reason}")]
    MalformedDocument { path: String, reason: String },

    #[error("unknown operation mode {0:?}")]
    InvalidMode(String),

    // ==================== Protocol Violations ====================
    #[error("no callback registered for importer {0}")]
    NoCallbackRegistered(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // ==================== Dispatch Faults ====================
    #[error("callback for importer {importer} failed: {reason}")]
    CallbackFailed { importer: String, reason: String },

    // ==================== Lifecycle ====================
    #[error("distributer is shutting down")]
    ShuttingDown,
}

impl MeshError {
    /// True when the fault means "the path we were watching went away" —
    /// expected during shutdown and rebalance races, never logged as an
    /// error.
    pub fn is_gone(&self) -> bool {
        matches!(self, MeshError::Store(e) if e.is_gone())
    }

    /// True for faults that a compare-and-set retry loop recovers from.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            MeshError::Store(StoreError::BadVersion { .. })
                | MeshError::Store(StoreError::ConnectionLoss)
        )
    }

    /// True for faults that indicate a bug in the calling framework rather
    /// than an environmental condition.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            MeshError::NoCallbackRegistered(_) | MeshError::InvalidArgument(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gone_classification() {
        let err = MeshError::Store(StoreError::NoNode("/import/host/h1".into()));
        assert!(err.is_gone());
        assert!(!err.is_retriable());

        let err = MeshError::Store(StoreError::SessionExpired);
        assert!(err.is_gone());
    }

    #[test]
    fn test_retriable_classification() {
        let err = MeshError::Store(StoreError::BadVersion {
            path: "/import/master".into(),
            expected: 3,
            actual: 4,
        });
        assert!(err.is_retriable());
        assert!(!err.is_gone());
    }

    #[test]
    fn test_protocol_violation_classification() {
        assert!(MeshError::NoCallbackRegistered("kafka".into()).is_protocol_violation());
        assert!(!MeshError::ShuttingDown.is_protocol_violation());
    }
}
