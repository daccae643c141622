//! End-to-end mesh distribution tests: several distributers share one
//! in-process store, channels are proposed, the leader spreads them, and
//! registered callbacks observe their slices. Session expiry simulates
//! node failure.

use floe_mesh::{
    ChannelChangeCallback, ChannelDistributer, ImporterChannelAssignment, MemoryMeshStore,
    MeshConfig, MeshError, MeshResult, MeshStore, OperationMode, VersionedOperationMode,
    ANY_VERSION,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Collects every notification it receives
#[derive(Default)]
struct TestCallback {
    assignments: Mutex<Vec<ImporterChannelAssignment>>,
    modes: Mutex<Vec<VersionedOperationMode>>,
}

impl TestCallback {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn assignments(&self) -> Vec<ImporterChannelAssignment> {
        self.assignments.lock().clone()
    }

    /// The set of URIs this importer holds according to the latest delta
    fn current(&self) -> BTreeSet<Url> {
        self.assignments
            .lock()
            .last()
            .map(|a| a.assigned().clone())
            .unwrap_or_default()
    }

    fn modes(&self) -> Vec<VersionedOperationMode> {
        self.modes.lock().clone()
    }
}

impl ChannelChangeCallback for TestCallback {
    fn on_assignment_change(&self, assignment: ImporterChannelAssignment) -> MeshResult<()> {
        self.assignments.lock().push(assignment);
        Ok(())
    }

    fn on_cluster_mode_change(&self, mode: VersionedOperationMode) -> MeshResult<()> {
        self.modes.lock().push(mode);
        Ok(())
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn start_node(store: &MemoryMeshStore, host: &str) -> ChannelDistributer {
    init_tracing();
    ChannelDistributer::start(
        Arc::new(store.session()),
        host,
        OperationMode::Running,
        MeshConfig::default(),
    )
    .await
    .unwrap()
}

fn uris(raw: &[&str]) -> BTreeSet<Url> {
    raw.iter().map(|u| Url::parse(u).unwrap()).collect()
}

#[tokio::test]
async fn test_single_host_receives_all_channels() {
    let store = MemoryMeshStore::new();
    let node = start_node(&store, "host-1").await;
    assert!(node.is_leader());

    let callback = TestCallback::new();
    node.register_callback("A", callback.clone()).unwrap();
    node.register_channels("A", uris(&["kafka://uri1", "kafka://uri2"]))
        .await
        .unwrap();

    wait_until("both channels assigned to the only host", || {
        callback.current() == uris(&["kafka://uri1", "kafka://uri2"])
    })
    .await;

    let specs = node.assigned_specs();
    assert_eq!(specs.len(), 2);
    assert!(specs.values().all(|h| h == "host-1"));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_two_hosts_split_channels_fairly() {
    let store = MemoryMeshStore::new();
    let node1 = start_node(&store, "host-1").await;
    let node2 = start_node(&store, "host-2").await;

    let cb1 = TestCallback::new();
    let cb2 = TestCallback::new();
    node1.register_callback("A", cb1.clone()).unwrap();
    node2.register_callback("A", cb2.clone()).unwrap();

    wait_until("both hosts joined", || {
        node1.live_hosts().len() == 2 && node2.live_hosts().len() == 2
    })
    .await;

    node1
        .register_channels("A", uris(&["kafka://uri1", "kafka://uri2"]))
        .await
        .unwrap();

    wait_until("one channel per host", || {
        cb1.current().len() == 1 && cb2.current().len() == 1
    })
    .await;
    assert_eq!(
        cb1.current().union(&cb2.current()).count(),
        2,
        "the two slices must cover both channels"
    );

    node1.shutdown().await.unwrap();
    node2.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_registration_without_callback_is_a_noop() {
    let store = MemoryMeshStore::new();
    let node = start_node(&store, "host-1").await;

    // the incomplete-startup race: a never-started importer being torn down
    node.register_channels("A", BTreeSet::new()).await.unwrap();
    assert!(node.master_channels().is_empty());

    // a non-empty proposal for an unknown importer is a framework bug
    let err = node
        .register_channels("A", uris(&["kafka://uri1"]))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::NoCallbackRegistered(_)));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_merge_is_idempotent() {
    let store = MemoryMeshStore::new();
    let observer = store.session();
    let node = start_node(&store, "host-1").await;

    let callback = TestCallback::new();
    node.register_callback("A", callback.clone()).unwrap();
    node.register_channels("A", uris(&["kafka://uri1"]))
        .await
        .unwrap();

    let version_after_first = observer
        .get_data("/import/master", false)
        .await
        .unwrap()
        .stat
        .version;

    // an identical proposal must not produce a second write
    node.register_channels("A", uris(&["kafka://uri1"]))
        .await
        .unwrap();
    let version_after_second = observer
        .get_data("/import/master", false)
        .await
        .unwrap()
        .stat
        .version;
    assert_eq!(version_after_first, version_after_second);

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_host_channels_are_redistributed() {
    let store = MemoryMeshStore::new();
    let session2 = Arc::new(store.session());

    let node1 = start_node(&store, "host-1").await;
    let node2 = ChannelDistributer::start(
        session2.clone(),
        "host-2",
        OperationMode::Running,
        MeshConfig::default(),
    )
    .await
    .unwrap();

    let cb1 = TestCallback::new();
    let cb2 = TestCallback::new();
    node1.register_callback("A", cb1.clone()).unwrap();
    node2.register_callback("A", cb2.clone()).unwrap();

    wait_until("both hosts joined", || node1.live_hosts().len() == 2).await;

    node1
        .register_channels("A", uris(&["kafka://uri1", "kafka://uri2"]))
        .await
        .unwrap();
    wait_until("channels spread over both hosts", || {
        cb1.current().len() == 1 && cb2.current().len() == 1
    })
    .await;

    // simulated disconnect: host-2's ephemeral nodes vanish
    session2.expire();

    wait_until("host-2 purged from membership", || {
        node1.live_hosts() == ["host-1".to_string()].into_iter().collect()
    })
    .await;
    wait_until("survivor owns everything", || {
        cb1.current() == uris(&["kafka://uri1", "kafka://uri2"])
    })
    .await;

    let specs = node1.assigned_specs();
    assert!(specs.values().all(|h| h == "host-1"));

    node1.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_buffered_assignment_replays_on_registration() {
    let store = MemoryMeshStore::new();
    let node1 = start_node(&store, "host-1").await;
    let node2 = start_node(&store, "host-2").await;

    // only host-2 registers the callback; host-1 will receive a slice of
    // X's channels with nobody to hand it to and must buffer it
    let cb2 = TestCallback::new();
    node2.register_callback("X", cb2.clone()).unwrap();

    wait_until("both hosts joined", || node2.live_hosts().len() == 2).await;

    node2
        .register_channels("X", uris(&["kafka://uri1", "kafka://uri2"]))
        .await
        .unwrap();

    wait_until("host-1 holds a slice in the spec map", || {
        node1
            .assigned_specs()
            .values()
            .any(|h| h == "host-1")
    })
    .await;

    // late registration replays the buffered assignment exactly once
    let late = TestCallback::new();
    node1.register_callback("X", late.clone()).unwrap();

    wait_until("buffered assignment replayed", || {
        !late.assignments().is_empty()
    })
    .await;
    assert_eq!(late.assignments().len(), 1);
    assert_eq!(late.current().len(), 1);

    node1.shutdown().await.unwrap();
    node2.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unregistration_is_final() {
    let store = MemoryMeshStore::new();
    let node = start_node(&store, "host-1").await;

    let first = TestCallback::new();
    node.register_callback("A", first.clone()).unwrap();
    node.register_channels("A", uris(&["kafka://uri1"]))
        .await
        .unwrap();
    wait_until("initial assignment delivered", || {
        !first.assignments().is_empty()
    })
    .await;

    node.unregister_callback("A");

    // re-registration is a no-op: the designation stays dead
    let second = TestCallback::new();
    node.register_callback("A", second.clone()).unwrap();
    let err = node
        .register_channels("A", uris(&["kafka://uri2"]))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::NoCallbackRegistered(_)));

    // force another per-host delta; the dead designation must stay silent
    let other = TestCallback::new();
    node.register_callback("B", other.clone()).unwrap();
    node.register_channels("B", uris(&["file:///data.csv"]))
        .await
        .unwrap();
    wait_until("B assigned", || !other.assignments().is_empty()).await;

    assert!(second.assignments().is_empty());

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_mode_changes_fan_out() {
    let store = MemoryMeshStore::new();
    let admin = store.session();
    let node = start_node(&store, "host-1").await;

    let callback = TestCallback::new();
    node.register_callback("A", callback.clone()).unwrap();

    admin
        .set_data("/import/mode", b"PAUSED", ANY_VERSION)
        .await
        .unwrap();

    wait_until("pause observed", || {
        callback
            .modes()
            .iter()
            .any(|m| m.mode == OperationMode::Paused)
    })
    .await;
    assert_eq!(node.operation_mode().mode, OperationMode::Paused);

    admin
        .set_data("/import/mode", b"RUNNING", ANY_VERSION)
        .await
        .unwrap();
    wait_until("resume observed", || {
        callback
            .modes()
            .iter()
            .any(|m| m.mode == OperationMode::Running)
    })
    .await;

    let tag = node.cluster_tag().await.unwrap();
    assert_eq!(tag, "2");

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_leadership_fails_over() {
    let store = MemoryMeshStore::new();
    let session1 = Arc::new(store.session());

    let node1 = ChannelDistributer::start(
        session1.clone(),
        "host-1",
        OperationMode::Running,
        MeshConfig::default(),
    )
    .await
    .unwrap();
    let node2 = start_node(&store, "host-2").await;

    let cb1 = TestCallback::new();
    let cb2 = TestCallback::new();
    node1.register_callback("A", cb1.clone()).unwrap();
    node2.register_callback("A", cb2.clone()).unwrap();

    wait_until("both hosts joined", || node2.live_hosts().len() == 2).await;
    assert!(node1.is_leader());
    assert!(!node2.is_leader());

    node1
        .register_channels("A", uris(&["kafka://uri1", "kafka://uri2"]))
        .await
        .unwrap();
    wait_until("channels spread over both hosts", || {
        cb1.current().len() == 1 && cb2.current().len() == 1
    })
    .await;

    // the leader drops off the mesh; the survivor inherits leadership and
    // the dead host's channels
    session1.expire();

    wait_until("host-2 takes over leadership", || node2.is_leader()).await;
    wait_until("host-2 owns everything", || {
        cb2.current() == uris(&["kafka://uri1", "kafka://uri2"])
    })
    .await;

    node2.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_new_channels_land_on_the_underloaded_host() {
    let store = MemoryMeshStore::new();
    let node1 = start_node(&store, "host-1").await;

    let cb1 = TestCallback::new();
    node1.register_callback("A", cb1.clone()).unwrap();
    node1
        .register_channels("A", uris(&["kafka://uri1", "kafka://uri2"]))
        .await
        .unwrap();
    wait_until("initial assignment", || cb1.current().len() == 2).await;

    // a second host joins; the stable channels stay put
    let node2 = start_node(&store, "host-2").await;
    let cb2 = TestCallback::new();
    node2.register_callback("A", cb2.clone()).unwrap();
    wait_until("both hosts joined", || node1.live_hosts().len() == 2).await;

    node1.rebalance().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cb1.current().len(), 2, "stable assignments must not move");

    // two new channels must both land on the empty host
    node1
        .register_channels(
            "A",
            uris(&[
                "kafka://uri1",
                "kafka://uri2",
                "kafka://uri3",
                "kafka://uri4",
            ]),
        )
        .await
        .unwrap();

    wait_until("new channels fill the underloaded host", || {
        cb2.current() == uris(&["kafka://uri3", "kafka://uri4"])
    })
    .await;
    assert_eq!(cb1.current(), uris(&["kafka://uri1", "kafka://uri2"]));

    node1.shutdown().await.unwrap();
    node2.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_removes_ephemeral_presence() {
    let store = MemoryMeshStore::new();
    let observer = store.session();
    let node1 = start_node(&store, "host-1").await;
    let node2 = start_node(&store, "host-2").await;

    wait_until("both hosts joined", || node2.live_hosts().len() == 2).await;

    node1.shutdown().await.unwrap();

    wait_until("host-1 left the mesh", || {
        node2.live_hosts() == ["host-2".to_string()].into_iter().collect()
    })
    .await;
    wait_until("host-2 inherits leadership", || node2.is_leader()).await;

    let hosts = observer.get_children("/import/host", false).await.unwrap();
    assert_eq!(hosts.children.iter().collect::<Vec<_>>(), vec!["host-2"]);

    // shutdown is idempotent
    node1.shutdown().await.unwrap();
    node2.shutdown().await.unwrap();
}
