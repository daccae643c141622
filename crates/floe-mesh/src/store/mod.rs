//! Coordination substrate facade
//!
//! The mesh runs against a ZooKeeper-like store: a hierarchical namespace
//! of versioned nodes with ephemeral and sequential create modes and
//! one-shot watches. [`MeshStore`] is the subset the coordinator needs;
//! [`memory::MemoryMeshStore`] is an in-process implementation with full
//! session semantics used by single-node deployments and tests.

pub mod memory;

use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;
use tokio::sync::oneshot;

/// Version wildcard for unconditional writes and deletes
pub const ANY_VERSION: i64 = -1;

/// Result type for substrate operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Substrate fault taxonomy
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node does not exist: {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("version mismatch on {path}: expected {expected}, actual {actual}")]
    BadVersion {
        path: String,
        expected: i64,
        actual: i64,
    },

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("session expired")]
    SessionExpired,

    #[error("connection lost")]
    ConnectionLoss,

    #[error("store is closed")]
    Closed,

    #[error("bad path: {0}")]
    BadPath(String),
}

impl StoreError {
    /// "The path went away" — a legitimate outcome during shutdown and
    /// rebalance races, propagated as absence rather than logged as error.
    pub fn is_gone(&self) -> bool {
        matches!(self, StoreError::NoNode(_) | StoreError::SessionExpired)
    }

    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StoreError::BadVersion { .. } | StoreError::ConnectionLoss
        )
    }
}

/// Node creation modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed automatically when the creating session goes away
    Ephemeral,
    /// Ephemeral, with a monotonically increasing zero-padded suffix
    /// appended to the requested path by the store
    EphemeralSequential,
}

/// Per-node version counters, both monotonically increasing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeStat {
    /// Data version: bumped on every `set_data`
    pub version: i64,
    /// Child-list version: bumped on every child create/delete
    pub cversion: i64,
}

/// What a one-shot watch fired for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    DataChanged,
    ChildrenChanged,
    NodeDeleted,
    SessionExpired,
}

/// One-shot watch handle: resolves at most once, on the first relevant
/// mutation after the read that installed it
pub type Watch = oneshot::Receiver<WatchEvent>;

/// Reply to a data read
#[derive(Debug)]
pub struct DataReply {
    pub data: Vec<u8>,
    pub stat: NodeStat,
    pub watch: Option<Watch>,
}

/// Reply to a children listing
#[derive(Debug)]
pub struct ChildrenReply {
    pub children: BTreeSet<String>,
    pub stat: NodeStat,
    pub watch: Option<Watch>,
}

/// The coordination substrate contract
///
/// All calls are version-aware: writes and deletes take an expected data
/// version (or [`ANY_VERSION`]), reads return the node's current
/// [`NodeStat`]. Reads optionally install a one-shot watch; callers re-arm
/// by issuing a fresh read after the watch fires.
#[async_trait]
pub trait MeshStore: Send + Sync + 'static {
    /// Create a node. Returns the actual path, which differs from the
    /// requested one for [`CreateMode::EphemeralSequential`].
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<String>;

    /// Delete a node, conditioned on `version` unless [`ANY_VERSION`]
    async fn delete(&self, path: &str, version: i64) -> StoreResult<()>;

    /// Read node content, optionally installing a one-shot data watch
    async fn get_data(&self, path: &str, watch: bool) -> StoreResult<DataReply>;

    /// Write node content, conditioned on `version` unless [`ANY_VERSION`]
    async fn set_data(&self, path: &str, data: &[u8], version: i64) -> StoreResult<NodeStat>;

    /// List direct children (basenames), optionally installing a one-shot
    /// children watch
    async fn get_children(&self, path: &str, watch: bool) -> StoreResult<ChildrenReply>;

    /// Stat a node without reading it
    async fn exists(&self, path: &str) -> StoreResult<Option<NodeStat>>;
}

/// Last path segment
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Join a parent path and a child basename
pub fn join_path(parent: &str, child: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), child)
}

/// Create `path` and any missing ancestors. Ancestors get empty content,
/// the final node gets `data`. An already existing node is success.
pub async fn ensure_path(store: &dyn MeshStore, path: &str, data: &[u8]) -> StoreResult<()> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(StoreError::BadPath(path.to_string()));
    }
    let mut current = String::new();
    for (i, segment) in segments.iter().enumerate() {
        current.push('/');
        current.push_str(segment);
        let content = if i + 1 == segments.len() { data } else { &[] };
        match store.create(&current, content, CreateMode::Persistent).await {
            Ok(_) | Err(StoreError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basename() {
        assert_eq!(basename("/import/host/h1"), "h1");
        assert_eq!(basename("/import"), "import");
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/import/host", "h1"), "/import/host/h1");
        assert_eq!(join_path("/import/host/", "h1"), "/import/host/h1");
    }
}
