//! Import layer error types

use floe_mesh::MeshError;
use thiserror::Error;
use url::Url;

/// Result type for import operations
pub type ImportResult<T> = std::result::Result<T, ImportError>;

/// Errors raised by the importer lifecycle layer
#[derive(Debug, Error)]
pub enum ImportError {
    // ==================== Protocol Violations ====================
    #[error("importer {0} is stopping; the mesh must not hand it new work")]
    StoppingViolation(String),

    #[error("importer {importer} was assigned unconfigured resource {uri}")]
    UnconfiguredResource { importer: String, uri: Url },

    #[error("importer {importer} cannot transition from {state}: {reason}")]
    InvalidTransition {
        importer: String,
        state: &'static str,
        reason: String,
    },

    // ==================== Worker Faults ====================
    #[error("importer {importer} worker for {uri} failed: {reason}")]
    WorkerFailed {
        importer: String,
        uri: Url,
        reason: String,
    },

    #[error("importer {importer} factory refused {uri}: {reason}")]
    CreateFailed {
        importer: String,
        uri: Url,
        reason: String,
    },

    // ==================== Mesh ====================
    #[error("mesh error: {0}")]
    Mesh(#[from] MeshError),
}

impl ImportError {
    /// True for faults that indicate a bug in the calling framework
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ImportError::StoppingViolation(_)
                | ImportError::UnconfiguredResource { .. }
                | ImportError::InvalidTransition { .. }
        )
    }
}
