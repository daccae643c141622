//! In-process coordination store with session semantics
//!
//! Implements the full [`MeshStore`] contract over a process-local
//! hierarchical namespace: versioned nodes, ephemeral and sequential
//! creates, one-shot watches, and sessions whose expiry removes their
//! ephemeral nodes and fires the affected watches. Single-node deployments
//! run against it directly; tests use [`MemorySession::expire`] to simulate
//! node disconnects.

use super::{
    ChildrenReply, CreateMode, DataReply, MeshStore, NodeStat, StoreError, StoreResult, WatchEvent,
    ANY_VERSION,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug)]
struct NodeRecord {
    data: Vec<u8>,
    version: i64,
    cversion: i64,
    next_sequential: i64,
    ephemeral_owner: Option<u64>,
}

impl NodeRecord {
    fn new(data: Vec<u8>, ephemeral_owner: Option<u64>) -> Self {
        Self {
            data,
            version: 0,
            cversion: 0,
            next_sequential: 0,
            ephemeral_owner,
        }
    }

    fn stat(&self) -> NodeStat {
        NodeStat {
            version: self.version,
            cversion: self.cversion,
        }
    }
}

type WatchList = Vec<(u64, oneshot::Sender<WatchEvent>)>;

#[derive(Default)]
struct Core {
    nodes: BTreeMap<String, NodeRecord>,
    data_watches: HashMap<String, WatchList>,
    child_watches: HashMap<String, WatchList>,
    /// session id → expired flag
    sessions: HashMap<u64, bool>,
    next_session: u64,
}

impl Core {
    fn fire_data(&mut self, path: &str, event: WatchEvent) {
        if let Some(watches) = self.data_watches.remove(path) {
            for (_, tx) in watches {
                let _ = tx.send(event);
            }
        }
    }

    fn fire_children(&mut self, path: &str, event: WatchEvent) {
        if let Some(watches) = self.child_watches.remove(path) {
            for (_, tx) in watches {
                let _ = tx.send(event);
            }
        }
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{path}/");
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .next()
            .is_some()
    }

    fn children_of(&self, path: &str) -> BTreeSet<String> {
        let prefix = format!("{path}/");
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| !k[prefix.len()..].contains('/'))
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect()
    }

    /// Remove a node and fire the watches a deletion triggers
    fn remove_node(&mut self, path: &str) {
        self.nodes.remove(path);
        if let Some((parent, _)) = path.rsplit_once('/') {
            if let Some(record) = self.nodes.get_mut(parent) {
                record.cversion += 1;
            }
            let parent = parent.to_string();
            self.fire_children(&parent, WatchEvent::ChildrenChanged);
        }
        self.fire_data(path, WatchEvent::NodeDeleted);
        self.fire_children(path, WatchEvent::NodeDeleted);
    }
}

fn validate_path(path: &str) -> StoreResult<()> {
    let well_formed = path.starts_with('/')
        && path.len() > 1
        && !path.ends_with('/')
        && !path.contains("//");
    if well_formed {
        Ok(())
    } else {
        Err(StoreError::BadPath(path.to_string()))
    }
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "",
        Some((parent, _)) => parent,
    }
}

/// Process-local store; hand out [`MemorySession`] handles with
/// [`MemoryMeshStore::session`]
#[derive(Clone, Default)]
pub struct MemoryMeshStore {
    core: Arc<Mutex<Core>>,
}

impl MemoryMeshStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session. Ephemeral nodes created through the returned
    /// handle live exactly as long as the session.
    pub fn session(&self) -> MemorySession {
        let mut core = self.core.lock();
        core.next_session += 1;
        let id = core.next_session;
        core.sessions.insert(id, false);
        MemorySession {
            core: Arc::clone(&self.core),
            id,
        }
    }
}

/// A session handle onto a [`MemoryMeshStore`]
#[derive(Clone)]
pub struct MemorySession {
    core: Arc<Mutex<Core>>,
    id: u64,
}

impl MemorySession {
    /// Expire this session: its ephemeral nodes are removed (firing the
    /// watches a deletion fires), its outstanding watches resolve with
    /// [`WatchEvent::SessionExpired`], and every later call through this
    /// handle fails with [`StoreError::SessionExpired`].
    pub fn expire(&self) {
        let mut core = self.core.lock();
        let core = &mut *core;
        if core.sessions.insert(self.id, true) == Some(true) {
            return;
        }

        let ephemerals: Vec<String> = core
            .nodes
            .iter()
            .filter(|(_, r)| r.ephemeral_owner == Some(self.id))
            .map(|(k, _)| k.clone())
            .collect();
        for path in ephemerals {
            core.remove_node(&path);
        }

        let mut orphaned = Vec::new();
        for watches in core
            .data_watches
            .values_mut()
            .chain(core.child_watches.values_mut())
        {
            let mut kept = Vec::with_capacity(watches.len());
            for (session, tx) in watches.drain(..) {
                if session == self.id {
                    orphaned.push(tx);
                } else {
                    kept.push((session, tx));
                }
            }
            *watches = kept;
        }
        for tx in orphaned {
            let _ = tx.send(WatchEvent::SessionExpired);
        }
    }

    fn check_alive(&self, core: &Core) -> StoreResult<()> {
        match core.sessions.get(&self.id) {
            Some(false) => Ok(()),
            Some(true) => Err(StoreError::SessionExpired),
            None => Err(StoreError::Closed),
        }
    }
}

#[async_trait]
impl MeshStore for MemorySession {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<String> {
        validate_path(path)?;
        let mut core = self.core.lock();
        self.check_alive(&core)?;

        let parent = parent_of(path).to_string();
        if !parent.is_empty() {
            let record = core
                .nodes
                .get(&parent)
                .ok_or_else(|| StoreError::NoNode(parent.clone()))?;
            if record.ephemeral_owner.is_some() {
                return Err(StoreError::BadPath(format!(
                    "{parent} is ephemeral and cannot have children"
                )));
            }
        }

        let final_path = match mode {
            CreateMode::EphemeralSequential => {
                let counter = if parent.is_empty() {
                    0
                } else {
                    let record = core.nodes.get_mut(&parent).expect("checked above");
                    let counter = record.next_sequential;
                    record.next_sequential += 1;
                    counter
                };
                format!("{path}{counter:010}")
            }
            _ => path.to_string(),
        };

        if core.nodes.contains_key(&final_path) {
            return Err(StoreError::NodeExists(final_path));
        }

        let ephemeral_owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral | CreateMode::EphemeralSequential => Some(self.id),
        };
        core.nodes
            .insert(final_path.clone(), NodeRecord::new(data.to_vec(), ephemeral_owner));
        if !parent.is_empty() {
            core.nodes.get_mut(&parent).expect("checked above").cversion += 1;
            core.fire_children(&parent, WatchEvent::ChildrenChanged);
        }
        Ok(final_path)
    }

    async fn delete(&self, path: &str, version: i64) -> StoreResult<()> {
        validate_path(path)?;
        let mut core = self.core.lock();
        self.check_alive(&core)?;

        let record = core
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        if version != ANY_VERSION && record.version != version {
            return Err(StoreError::BadVersion {
                path: path.to_string(),
                expected: version,
                actual: record.version,
            });
        }
        if core.has_children(path) {
            return Err(StoreError::NotEmpty(path.to_string()));
        }
        core.remove_node(path);
        Ok(())
    }

    async fn get_data(&self, path: &str, watch: bool) -> StoreResult<DataReply> {
        validate_path(path)?;
        let mut core = self.core.lock();
        self.check_alive(&core)?;

        let (data, stat) = {
            let record = core
                .nodes
                .get(path)
                .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
            (record.data.clone(), record.stat())
        };
        let watch = watch.then(|| {
            let (tx, rx) = oneshot::channel();
            core.data_watches
                .entry(path.to_string())
                .or_default()
                .push((self.id, tx));
            rx
        });
        Ok(DataReply { data, stat, watch })
    }

    async fn set_data(&self, path: &str, data: &[u8], version: i64) -> StoreResult<NodeStat> {
        validate_path(path)?;
        let mut core = self.core.lock();
        self.check_alive(&core)?;

        let stat = {
            let record = core
                .nodes
                .get_mut(path)
                .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
            if version != ANY_VERSION && record.version != version {
                return Err(StoreError::BadVersion {
                    path: path.to_string(),
                    expected: version,
                    actual: record.version,
                });
            }
            record.data = data.to_vec();
            record.version += 1;
            record.stat()
        };
        core.fire_data(path, WatchEvent::DataChanged);
        Ok(stat)
    }

    async fn get_children(&self, path: &str, watch: bool) -> StoreResult<ChildrenReply> {
        validate_path(path)?;
        let mut core = self.core.lock();
        self.check_alive(&core)?;

        let stat = core
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?
            .stat();
        let children = core.children_of(path);
        let watch = watch.then(|| {
            let (tx, rx) = oneshot::channel();
            core.child_watches
                .entry(path.to_string())
                .or_default()
                .push((self.id, tx));
            rx
        });
        Ok(ChildrenReply {
            children,
            stat,
            watch,
        })
    }

    async fn exists(&self, path: &str) -> StoreResult<Option<NodeStat>> {
        validate_path(path)?;
        let core = self.core.lock();
        self.check_alive(&core)?;
        Ok(core.nodes.get(path).map(NodeRecord::stat))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ensure_path;

    fn session() -> MemorySession {
        MemoryMeshStore::new().session()
    }

    #[tokio::test]
    async fn test_create_and_read() {
        let s = session();
        s.create("/root", b"", CreateMode::Persistent).await.unwrap();
        s.create("/root/a", b"hello", CreateMode::Persistent)
            .await
            .unwrap();

        let reply = s.get_data("/root/a", false).await.unwrap();
        assert_eq!(reply.data, b"hello");
        assert_eq!(reply.stat.version, 0);
        assert!(reply.watch.is_none());
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let s = session();
        let err = s
            .create("/root/a", b"", CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoNode(p) if p == "/root"));
    }

    #[tokio::test]
    async fn test_versioned_writes() {
        let s = session();
        s.create("/n", b"v0", CreateMode::Persistent).await.unwrap();

        let stat = s.set_data("/n", b"v1", 0).await.unwrap();
        assert_eq!(stat.version, 1);

        let err = s.set_data("/n", b"v2", 0).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::BadVersion {
                expected: 0,
                actual: 1,
                ..
            }
        ));

        s.set_data("/n", b"v2", ANY_VERSION).await.unwrap();
        assert_eq!(s.get_data("/n", false).await.unwrap().data, b"v2");
    }

    #[tokio::test]
    async fn test_sequential_creates_are_ordered() {
        let s = session();
        s.create("/dir", b"", CreateMode::Persistent).await.unwrap();

        let first = s
            .create("/dir/candidate_", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let second = s
            .create("/dir/candidate_", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap();

        assert_eq!(first, "/dir/candidate_0000000000");
        assert_eq!(second, "/dir/candidate_0000000001");
        assert!(first < second);
    }

    #[tokio::test]
    async fn test_children_listing_and_cversion() {
        let s = session();
        s.create("/dir", b"", CreateMode::Persistent).await.unwrap();
        s.create("/dir/b", b"", CreateMode::Persistent).await.unwrap();
        s.create("/dir/a", b"", CreateMode::Persistent).await.unwrap();
        s.create("/dir/a/nested", b"", CreateMode::Persistent)
            .await
            .unwrap();

        let reply = s.get_children("/dir", false).await.unwrap();
        assert_eq!(
            reply.children.iter().collect::<Vec<_>>(),
            ["a", "b"].iter().collect::<Vec<_>>()
        );
        assert_eq!(reply.stat.cversion, 2);
    }

    #[tokio::test]
    async fn test_data_watch_fires_once_on_change() {
        let s = session();
        s.create("/n", b"v0", CreateMode::Persistent).await.unwrap();

        let reply = s.get_data("/n", true).await.unwrap();
        let watch = reply.watch.unwrap();

        s.set_data("/n", b"v1", ANY_VERSION).await.unwrap();
        assert_eq!(watch.await.unwrap(), WatchEvent::DataChanged);

        // second mutation does not fire the consumed watch; a fresh read
        // re-arms
        let reply = s.get_data("/n", true).await.unwrap();
        let watch = reply.watch.unwrap();
        s.delete("/n", ANY_VERSION).await.unwrap();
        assert_eq!(watch.await.unwrap(), WatchEvent::NodeDeleted);
    }

    #[tokio::test]
    async fn test_children_watch_fires_on_membership_change() {
        let s = session();
        s.create("/dir", b"", CreateMode::Persistent).await.unwrap();

        let watch = s.get_children("/dir", true).await.unwrap().watch.unwrap();
        s.create("/dir/a", b"", CreateMode::Persistent).await.unwrap();
        assert_eq!(watch.await.unwrap(), WatchEvent::ChildrenChanged);

        let watch = s.get_children("/dir", true).await.unwrap().watch.unwrap();
        s.delete("/dir/a", ANY_VERSION).await.unwrap();
        assert_eq!(watch.await.unwrap(), WatchEvent::ChildrenChanged);
    }

    #[tokio::test]
    async fn test_session_expiry_removes_ephemerals() {
        let store = MemoryMeshStore::new();
        let owner = store.session();
        let observer = store.session();

        owner.create("/dir", b"", CreateMode::Persistent).await.unwrap();
        owner
            .create("/dir/alive", b"", CreateMode::Ephemeral)
            .await
            .unwrap();

        let watch = observer
            .get_children("/dir", true)
            .await
            .unwrap()
            .watch
            .unwrap();

        owner.expire();

        assert_eq!(watch.await.unwrap(), WatchEvent::ChildrenChanged);
        let reply = observer.get_children("/dir", false).await.unwrap();
        assert!(reply.children.is_empty());

        // the expired session is dead to further calls
        let err = owner.get_data("/dir", false).await.unwrap_err();
        assert!(matches!(err, StoreError::SessionExpired));
    }

    #[tokio::test]
    async fn test_session_expiry_resolves_own_watches() {
        let store = MemoryMeshStore::new();
        let s = store.session();
        s.create("/n", b"", CreateMode::Persistent).await.unwrap();
        let watch = s.get_data("/n", true).await.unwrap().watch.unwrap();

        s.expire();
        assert_eq!(watch.await.unwrap(), WatchEvent::SessionExpired);
    }

    #[tokio::test]
    async fn test_delete_refuses_non_empty() {
        let s = session();
        s.create("/dir", b"", CreateMode::Persistent).await.unwrap();
        s.create("/dir/a", b"", CreateMode::Persistent).await.unwrap();

        let err = s.delete("/dir", ANY_VERSION).await.unwrap_err();
        assert!(matches!(err, StoreError::NotEmpty(_)));
    }

    #[tokio::test]
    async fn test_ensure_path_is_idempotent() {
        let s = session();
        ensure_path(&s, "/a/b/c", b"leaf").await.unwrap();
        ensure_path(&s, "/a/b/c", b"ignored").await.unwrap();

        assert_eq!(s.get_data("/a/b/c", false).await.unwrap().data, b"leaf");
        assert_eq!(s.get_data("/a/b", false).await.unwrap().data, b"");
    }

    #[tokio::test]
    async fn test_ephemeral_cannot_have_children() {
        let s = session();
        s.create("/e", b"", CreateMode::Ephemeral).await.unwrap();
        let err = s
            .create("/e/child", b"", CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BadPath(_)));
    }

    #[tokio::test]
    async fn test_bad_paths_rejected() {
        let s = session();
        for path in ["", "/", "relative", "/a//b", "/trailing/"] {
            assert!(matches!(
                s.get_data(path, false).await.unwrap_err(),
                StoreError::BadPath(_)
            ));
        }
    }
}
