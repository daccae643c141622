//! The channel distributer
//!
//! One [`ChannelDistributer`] runs per node. It merges channel proposals
//! into the cluster-wide master list, participates in leader election,
//! mirrors the channel assignments the leader writes for this host, and
//! dispatches per-importer assignment deltas to registered callbacks.
//! When a node leaves the mesh its assigned channels are redistributed
//! among the surviving nodes.

use crate::assign;
use crate::config::{MeshConfig, MeshPaths};
use crate::error::{MeshError, MeshResult};
use crate::mode::{OperationMode, VersionedOperationMode};
use crate::monitor;
use crate::spec::{decode_spec_list, encode_spec_list, ChannelSpec, ImporterChannelAssignment};
use crate::stamped::Stamped;
use crate::store::{ensure_path, CreateMode, MeshStore, StoreError, ANY_VERSION};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Notification interface registered per importer designation
///
/// Implementations must be idempotent: deltas are delivered at least once.
/// Per-importer invocation order is preserved; cross-importer order is not.
pub trait ChannelChangeCallback: Send + Sync {
    /// This importer's slice of the host's assignment changed
    fn on_assignment_change(&self, assignment: ImporterChannelAssignment) -> MeshResult<()>;

    /// The cluster operational mode changed
    fn on_cluster_mode_change(&self, mode: VersionedOperationMode) -> MeshResult<()>;
}

/// Event routed through the dispatcher task
pub(crate) enum DispatchEvent {
    Assignment(ImporterChannelAssignment),
    Mode(VersionedOperationMode),
}

pub(crate) struct DistributerCore {
    pub(crate) store: Arc<dyn MeshStore>,
    pub(crate) host_id: String,
    pub(crate) paths: MeshPaths,
    pub(crate) config: MeshConfig,
    /// Our election candidate node, as created by the store
    pub(crate) candidate: String,
    pub(crate) done: AtomicBool,
    pub(crate) is_leader: AtomicBool,

    /// The globally agreed, to-be-distributed channel set; stamp mirrors
    /// the master node's data version
    pub(crate) channels: Stamped<BTreeSet<ChannelSpec>>,
    /// Last-known actual per-host assignment, rebuilt per host update
    pub(crate) specs: Stamped<BTreeMap<ChannelSpec, String>>,
    /// Live membership; the per-host counter is a data-version watermark
    /// used to reject stale assignment updates. Stamp mirrors the host
    /// directory's child-list version.
    pub(crate) hosts: Stamped<BTreeMap<String, Arc<AtomicI64>>>,
    /// Registered per-importer callbacks
    pub(crate) callbacks: Stamped<BTreeMap<String, Arc<dyn ChannelChangeCallback>>>,
    /// Designations explicitly torn down; one-way
    pub(crate) unregistered: Stamped<BTreeSet<String>>,
    /// Mirrored cluster operational mode; stamp mirrors the mode node's
    /// data version
    pub(crate) mode: Stamped<OperationMode>,

    /// Assignments whose importer has not registered yet. The lock also
    /// serializes callback-map swaps with queue replay.
    pub(crate) undispatched: Mutex<VecDeque<ImporterChannelAssignment>>,

    dispatch_tx: Mutex<Option<mpsc::UnboundedSender<DispatchEvent>>>,
    pub(crate) shutdown: broadcast::Sender<()>,
    pub(crate) assign_seq: AtomicU64,
    pub(crate) nonce: u64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DistributerCore {
    pub(crate) fn done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub(crate) fn track_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Queue an event for the dispatcher. Dropped silently after shutdown.
    pub(crate) fn post(&self, event: DispatchEvent) {
        if self.done() {
            return;
        }
        if let Some(tx) = self.dispatch_tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Route one assignment: registered → invoke, unregistered → discard,
    /// otherwise buffer for replay on registration.
    fn route_assignment(&self, assignment: ImporterChannelAssignment) {
        let callback = {
            let queue = &mut *self.undispatched.lock();
            let callbacks = self.callbacks.reference();
            match callbacks.get(assignment.importer()) {
                Some(cb) => Some(Arc::clone(cb)),
                None => {
                    if self
                        .unregistered
                        .reference()
                        .contains(assignment.importer())
                    {
                        if !assignment.added().is_empty() {
                            warn!(
                                host = %self.host_id,
                                "discarding assignment to unregistered importer {assignment}"
                            );
                        }
                    } else {
                        if !assignment.assigned().is_empty() {
                            warn!(
                                host = %self.host_id,
                                importer = %assignment.importer(),
                                "channels assigned to an importer with no registered callback; buffering"
                            );
                        }
                        queue.push_back(assignment.clone());
                    }
                    None
                }
            }
        };
        if let Some(callback) = callback {
            if let Err(e) = callback.on_assignment_change(assignment.clone()) {
                tracing::error!(
                    host = %self.host_id,
                    importer = %assignment.importer(),
                    "assignment callback failed: {e}"
                );
            }
        }
    }

    /// Fan a mode change out to every registered callback; one callback's
    /// failure never stops the others.
    fn fan_out_mode(&self, mode: VersionedOperationMode) {
        for (importer, callback) in self.callbacks.reference().iter() {
            if self.done() {
                break;
            }
            if let Err(e) = callback.on_cluster_mode_change(mode) {
                tracing::error!(
                    host = %self.host_id,
                    importer = %importer,
                    "cluster mode callback failed: {e}"
                );
            }
        }
    }
}

async fn run_dispatcher(core: Arc<DistributerCore>, mut rx: mpsc::UnboundedReceiver<DispatchEvent>) {
    while let Some(event) = rx.recv().await {
        if core.done() {
            continue;
        }
        match event {
            DispatchEvent::Assignment(assignment) => core.route_assignment(assignment),
            DispatchEvent::Mode(mode) => core.fan_out_mode(mode),
        }
    }
}

/// Per-node handle onto the channel distribution mesh
#[derive(Clone)]
pub struct ChannelDistributer {
    core: Arc<DistributerCore>,
}

impl ChannelDistributer {
    /// Generate a unique host id for processes without a stable one
    pub fn generate_host_id() -> String {
        format!("host-{}", uuid::Uuid::new_v4())
    }

    /// Join the distribution mesh:
    ///
    /// 1. primes the namespace (mode node, host directory, master node)
    /// 2. creates this host's ephemeral node and an election candidate
    /// 3. arms the mode, election, membership, and master-list monitors
    ///
    /// Returns once every monitor has completed its first pass, so callers
    /// observe a fully joined mesh.
    pub async fn start(
        store: Arc<dyn MeshStore>,
        host_id: impl Into<String>,
        start_mode: OperationMode,
        config: MeshConfig,
    ) -> MeshResult<Self> {
        let host_id = host_id.into();
        if host_id.trim().is_empty() {
            return Err(MeshError::InvalidArgument("host id is empty".into()));
        }
        if start_mode == OperationMode::Initializing {
            return Err(MeshError::InvalidArgument(
                "start mode must be RUNNING or PAUSED".into(),
            ));
        }
        let paths = config.paths();

        ensure_path(store.as_ref(), &paths.mode_path, start_mode.as_bytes()).await?;
        ensure_path(store.as_ref(), &paths.host_dn, b"[]").await?;
        ensure_path(store.as_ref(), &paths.master_dn, b"[]").await?;

        match store
            .create(&paths.host_path(&host_id), b"[]", CreateMode::Ephemeral)
            .await
        {
            Ok(_) | Err(StoreError::NodeExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let candidate = store
            .create(&paths.candidate_prefix, b"[]", CreateMode::EphemeralSequential)
            .await?;

        let (shutdown, _) = broadcast::channel(1);
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        let core = Arc::new(DistributerCore {
            store,
            host_id,
            paths,
            config,
            candidate,
            done: AtomicBool::new(false),
            is_leader: AtomicBool::new(false),
            channels: Stamped::default(),
            specs: Stamped::default(),
            hosts: Stamped::default(),
            callbacks: Stamped::default(),
            unregistered: Stamped::default(),
            mode: Stamped::new(OperationMode::Running),
            undispatched: Mutex::new(VecDeque::new()),
            dispatch_tx: Mutex::new(Some(dispatch_tx)),
            shutdown,
            assign_seq: AtomicU64::new(0),
            nonce: rand::random(),
            tasks: Mutex::new(Vec::new()),
        });

        core.track_task(tokio::spawn(run_dispatcher(Arc::clone(&core), dispatch_rx)));
        if let Err(e) = monitor::arm_monitors(&core).await {
            core.done.store(true, Ordering::SeqCst);
            let _ = core.shutdown.send(());
            return Err(e);
        }

        info!(host = %core.host_id, "joined the channel distribution mesh");
        Ok(Self { core })
    }

    pub fn host_id(&self) -> &str {
        &self.core.host_id
    }

    /// Whether this node currently holds mesh leadership
    pub fn is_leader(&self) -> bool {
        self.core.is_leader()
    }

    /// The mirrored cluster operational mode
    pub fn operation_mode(&self) -> VersionedOperationMode {
        let (mode, version) = self.core.mode.get();
        VersionedOperationMode::new(*mode, version)
    }

    /// A short tag summarizing the version of the coordination state the
    /// hosting process cares about (the mode node's data version)
    pub async fn cluster_tag(&self) -> MeshResult<String> {
        let stat = self.core.store.exists(&self.core.paths.mode_path).await?;
        Ok(stat.map(|s| s.version).unwrap_or(0).to_string())
    }

    /// Register channels for the given importer, merging them into the
    /// cluster-wide master list via a compare-and-set retry loop. Proposing
    /// the set already registered is a no-op. A callback must be registered
    /// first — except that proposing an *empty* set for a never-registered
    /// importer is tolerated, covering teardown of an importer that never
    /// finished starting.
    pub async fn register_channels(
        &self,
        importer: &str,
        uris: BTreeSet<Url>,
    ) -> MeshResult<()> {
        let core = &self.core;
        if importer.trim().is_empty() {
            return Err(MeshError::InvalidArgument("importer is empty".into()));
        }

        if !core.callbacks.reference().contains_key(importer) {
            if uris.is_empty() {
                info!(
                    host = %core.host_id,
                    importer = %importer,
                    "skipping channel un-registration; importer never finished initialization"
                );
                return Ok(());
            }
            return Err(MeshError::NoCallbackRegistered(importer.to_string()));
        }

        let proposed: BTreeSet<ChannelSpec> = uris
            .into_iter()
            .map(|uri| ChannelSpec::new(importer, uri))
            .collect::<MeshResult<_>>()?;

        info!(host = %core.host_id, importer = %importer, count = proposed.len(), "proposing channels");

        // retry writes when merging with stale data
        loop {
            let (prev, stamp) = core.channels.get();
            let current: BTreeSet<ChannelSpec> = prev
                .iter()
                .filter(|s| s.importer() == importer)
                .cloned()
                .collect();
            if current == proposed {
                return Ok(());
            }

            let mut master: BTreeSet<ChannelSpec> = prev
                .iter()
                .filter(|s| s.importer() != importer)
                .cloned()
                .collect();
            master.extend(proposed.iter().cloned());
            let data = encode_spec_list(&master);

            match core
                .store
                .set_data(&core.paths.master_dn, &data, stamp)
                .await
            {
                Ok(stat) => {
                    // mirror the merge locally so readers need not wait for
                    // the watch to fire
                    let (_, local) = core.channels.get();
                    if local < stat.version {
                        let _ = core.channels.compare_and_set(local, master, stat.version);
                    }
                    return Ok(());
                }
                Err(StoreError::BadVersion { .. }) => {
                    debug!(host = %core.host_id, importer = %importer, "master list moved; re-merging");
                    self.refresh_master().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pull the current master list from the store into the local mirror
    pub(crate) async fn refresh_master(&self) -> MeshResult<()> {
        let core = &self.core;
        let reply = core.store.get_data(&core.paths.master_dn, false).await?;
        let specs = decode_spec_list(&core.paths.master_dn, &reply.data)?;
        let (_, stamp) = core.channels.get();
        if stamp < reply.stat.version {
            let _ = core
                .channels
                .compare_and_set(stamp, specs, reply.stat.version);
        }
        Ok(())
    }

    /// Register the callback for an importer designation and replay any
    /// buffered assignments destined for it. Registering a designation that
    /// was explicitly unregistered is a no-op — unregistration is one-way.
    pub fn register_callback(
        &self,
        importer: &str,
        callback: Arc<dyn ChannelChangeCallback>,
    ) -> MeshResult<()> {
        let core = &self.core;
        if importer.trim().is_empty() {
            return Err(MeshError::InvalidArgument("importer is empty".into()));
        }
        if core.done() {
            return Ok(());
        }
        if core.unregistered.reference().contains(importer) {
            warn!(
                host = %core.host_id,
                importer = %importer,
                "ignoring callback registration for an unregistered importer"
            );
            return Ok(());
        }

        let queue = &mut *core.undispatched.lock();

        let next = loop {
            let (prev, stamp) = core.callbacks.get();
            let mut next = (*prev).clone();
            next.insert(importer.to_string(), Arc::clone(&callback));
            if core.callbacks.compare_and_set(stamp, next.clone(), stamp + 1) {
                break next;
            }
        };

        let unregistered = core.unregistered.reference();
        let mut retained = VecDeque::with_capacity(queue.len());
        while let Some(assignment) = queue.pop_front() {
            if next.contains_key(assignment.importer()) {
                core.post(DispatchEvent::Assignment(assignment));
            } else if unregistered.contains(assignment.importer()) {
                if !assignment.added().is_empty() {
                    warn!(
                        host = %core.host_id,
                        "discarding assignment to unregistered importer {assignment}"
                    );
                }
            } else {
                retained.push_back(assignment);
            }
        }
        *queue = retained;
        Ok(())
    }

    /// Unregister an importer designation. One-way: the designation can
    /// never re-register, and buffered assignments for it are discarded.
    pub fn unregister_callback(&self, importer: &str) {
        let core = &self.core;
        if importer.trim().is_empty()
            || !core.callbacks.reference().contains_key(importer)
            || core.unregistered.reference().contains(importer)
            || core.done()
        {
            return;
        }

        let queue = &mut *core.undispatched.lock();

        loop {
            let (prev, stamp) = core.callbacks.get();
            if !prev.contains_key(importer) {
                break;
            }
            let mut next = (*prev).clone();
            next.remove(importer);
            if core.callbacks.compare_and_set(stamp, next, stamp + 1) {
                break;
            }
        }

        let unregistered = loop {
            let (prev, stamp) = core.unregistered.get();
            if prev.contains(importer) {
                break prev;
            }
            let mut next = (*prev).clone();
            next.insert(importer.to_string());
            if core.unregistered.compare_and_set(stamp, next, stamp + 1) {
                break core.unregistered.reference();
            }
        };

        queue.retain(|assignment| !unregistered.contains(assignment.importer()));
    }

    /// Leave the mesh: stop accepting work, drain the monitors and the
    /// dispatcher, then remove this node's ephemeral host and candidate
    /// entries.
    pub async fn shutdown(&self) -> MeshResult<()> {
        let core = &self.core;
        if core.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(host = %core.host_id, "leaving the channel distribution mesh");

        let _ = core.shutdown.send(());
        core.dispatch_tx.lock().take();

        // wait for completion, not for a deadline
        let tasks = std::mem::take(&mut *core.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        self.delete_tolerant(&core.paths.host_path(&core.host_id))
            .await?;
        self.delete_tolerant(&core.candidate).await?;
        Ok(())
    }

    /// Delete a node, tolerating outcomes that mean it is already gone or
    /// the substrate connection is
    async fn delete_tolerant(&self, path: &str) -> MeshResult<()> {
        match self.core.store.delete(path, ANY_VERSION).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_gone() => Ok(()),
            Err(StoreError::ConnectionLoss) | Err(StoreError::Closed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn core(&self) -> &Arc<DistributerCore> {
        &self.core
    }
}

// Observation helpers for the hosting process and health surfaces
impl ChannelDistributer {
    /// Snapshot of the mirrored master channel list
    pub fn master_channels(&self) -> BTreeSet<ChannelSpec> {
        (*self.core.channels.reference()).clone()
    }

    /// Snapshot of the last-known per-host assignment
    pub fn assigned_specs(&self) -> BTreeMap<ChannelSpec, String> {
        (*self.core.specs.reference()).clone()
    }

    /// Snapshot of live mesh membership
    pub fn live_hosts(&self) -> BTreeSet<String> {
        self.core.hosts.reference().keys().cloned().collect()
    }

    /// Trigger a rebalance pass as if a monitor had requested one.
    /// Leader-only; a no-op elsewhere.
    pub async fn rebalance(&self) {
        if self.core.is_leader() && !self.core.done() {
            assign::run_assign(&self.core).await;
        }
    }
}
