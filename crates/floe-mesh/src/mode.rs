//! Cluster operational mode

use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Externally-driven cluster pause/resume state, mirrored from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationMode {
    Running,
    Paused,
    Initializing,
}

impl OperationMode {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            OperationMode::Running => b"RUNNING",
            OperationMode::Paused => b"PAUSED",
            OperationMode::Initializing => b"INITIALIZING",
        }
    }

    pub fn from_bytes(data: &[u8]) -> MeshResult<Self> {
        match data {
            b"RUNNING" => Ok(OperationMode::Running),
            b"PAUSED" => Ok(OperationMode::Paused),
            b"INITIALIZING" => Ok(OperationMode::Initializing),
            other => Err(MeshError::InvalidMode(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(std::str::from_utf8(self.as_bytes()).expect("mode names are ascii"))
    }
}

/// An [`OperationMode`] tagged with the store version that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionedOperationMode {
    pub mode: OperationMode,
    pub version: i64,
}

impl VersionedOperationMode {
    pub fn new(mode: OperationMode, version: i64) -> Self {
        Self { mode, version }
    }
}

impl fmt::Display for VersionedOperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.mode, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_round_trip() {
        for mode in [
            OperationMode::Running,
            OperationMode::Paused,
            OperationMode::Initializing,
        ] {
            assert_eq!(OperationMode::from_bytes(mode.as_bytes()).unwrap(), mode);
        }
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let err = OperationMode::from_bytes(b"HALTED").unwrap_err();
        assert!(matches!(err, MeshError::InvalidMode(m) if m == "HALTED"));
    }
}
