//! Importer lifecycle manager
//!
//! One manager runs per importer type per node. It owns the importer
//! workers for that type: in run-everywhere mode it starts one worker per
//! configured resource outright; otherwise it registers the configured
//! resources as channel proposals with the mesh and starts/stops workers
//! as [`on_change`](ImporterLifeCycleManager::on_change) deltas arrive.
//! The active worker map is an immutable snapshot swapped by compare-and-
//! set, so concurrent deltas race visibly and retry instead of corrupting
//! the map.

use crate::error::{ImportError, ImportResult};
use crate::importer::{Importer, ImporterContext, ImporterFactory, ResourceConfig};
use crate::procedure::ProcedureInvoker;
use crate::stats::ImportStatsSink;
use floe_mesh::{
    ChannelChangeCallback, ChannelDistributer, ImporterChannelAssignment, MeshError, MeshResult,
    Stamped, VersionedOperationMode,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(30);

/// Manager lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Unstarted,
    Ready,
    Running,
    Stopping,
    Stopped,
}

impl ManagerState {
    fn name(&self) -> &'static str {
        match self {
            ManagerState::Unstarted => "UNSTARTED",
            ManagerState::Ready => "READY",
            ManagerState::Running => "RUNNING",
            ManagerState::Stopping => "STOPPING",
            ManagerState::Stopped => "STOPPED",
        }
    }
}

struct Worker {
    importer: Arc<dyn Importer>,
    stop_flag: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct ManagerCore {
    name: String,
    factory: Arc<dyn ImporterFactory>,
    distributer: ChannelDistributer,
    invoker: Arc<dyn ProcedureInvoker>,
    stats: Arc<dyn ImportStatsSink>,
    configs: Mutex<BTreeMap<Url, ResourceConfig>>,
    workers: Stamped<BTreeMap<Url, Arc<Worker>>>,
    /// One-way; read by many, written once
    stopping: AtomicBool,
    state: Mutex<ManagerState>,
    grace: Duration,
}

/// Starts and stops importer workers as resources are assigned and revoked
#[derive(Clone)]
pub struct ImporterLifeCycleManager {
    core: Arc<ManagerCore>,
}

/// Bridges mesh notifications into the manager
struct MeshCallback {
    core: Arc<ManagerCore>,
}

impl ChannelChangeCallback for MeshCallback {
    fn on_assignment_change(&self, assignment: ImporterChannelAssignment) -> MeshResult<()> {
        ImporterLifeCycleManager::apply_change(&self.core, assignment).map_err(|e| {
            MeshError::CallbackFailed {
                importer: self.core.name.clone(),
                reason: e.to_string(),
            }
        })
    }

    fn on_cluster_mode_change(&self, mode: VersionedOperationMode) -> MeshResult<()> {
        info!(importer = %self.core.name, mode = %mode, "cluster mode change observed");
        Ok(())
    }
}

impl ImporterLifeCycleManager {
    pub fn new(
        factory: Arc<dyn ImporterFactory>,
        distributer: ChannelDistributer,
        invoker: Arc<dyn ProcedureInvoker>,
        stats: Arc<dyn ImportStatsSink>,
    ) -> Self {
        Self::with_grace_period(factory, distributer, invoker, stats, DEFAULT_STOP_GRACE)
    }

    pub fn with_grace_period(
        factory: Arc<dyn ImporterFactory>,
        distributer: ChannelDistributer,
        invoker: Arc<dyn ProcedureInvoker>,
        stats: Arc<dyn ImportStatsSink>,
        grace: Duration,
    ) -> Self {
        Self {
            core: Arc::new(ManagerCore {
                name: factory.name().to_string(),
                factory,
                distributer,
                invoker,
                stats,
                configs: Mutex::new(BTreeMap::new()),
                workers: Stamped::default(),
                stopping: AtomicBool::new(false),
                state: Mutex::new(ManagerState::Unstarted),
                grace,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> ManagerState {
        *self.core.state.lock()
    }

    /// Resources with a live worker right now
    pub fn active_resources(&self) -> BTreeSet<Url> {
        self.core.workers.reference().keys().cloned().collect()
    }

    /// Merge newly-declared resource configurations with previously known
    /// ones. Declarations for an already-known URI supersede it; everything
    /// else is stable across reconfiguration.
    pub fn configure(
        &self,
        resources: impl IntoIterator<Item = ResourceConfig>,
    ) -> ImportResult<()> {
        let mut state = self.core.state.lock();
        match *state {
            ManagerState::Unstarted | ManagerState::Ready | ManagerState::Running => {}
            other => {
                return Err(ImportError::InvalidTransition {
                    importer: self.core.name.clone(),
                    state: other.name(),
                    reason: "cannot reconfigure a stopping manager".into(),
                })
            }
        }
        let mut configs = self.core.configs.lock();
        for resource in resources {
            configs.insert(resource.uri.clone(), resource);
        }
        if *state == ManagerState::Unstarted {
            *state = ManagerState::Ready;
        }
        Ok(())
    }

    /// Begin consuming. Run-everywhere importer types start one worker per
    /// configured resource immediately; the rest register with the mesh and
    /// propose the full configured set as this type's channels, consuming
    /// whatever slice the leader hands back through `on_change`.
    pub async fn ready_for_data(&self) -> ImportResult<()> {
        let core = &self.core;
        {
            let mut state = core.state.lock();
            if *state != ManagerState::Ready {
                return Err(ImportError::InvalidTransition {
                    importer: core.name.clone(),
                    state: state.name(),
                    reason: "ready_for_data requires a configured, unstarted manager".into(),
                });
            }
            *state = ManagerState::Running;
        }

        if core.factory.run_everywhere() {
            let configs: Vec<ResourceConfig> = core.configs.lock().values().cloned().collect();
            info!(
                importer = %core.name,
                resources = configs.len(),
                "run-everywhere importer starting all configured resources"
            );
            let uris: BTreeSet<Url> = configs.iter().map(|c| c.uri.clone()).collect();
            Self::apply_change_sets(core, &uris, &BTreeSet::new())?;
            return Ok(());
        }

        let uris: BTreeSet<Url> = core.configs.lock().keys().cloned().collect();
        core.distributer.register_callback(
            &core.name,
            Arc::new(MeshCallback {
                core: Arc::clone(core),
            }),
        )?;
        core.distributer.register_channels(&core.name, uris).await?;
        Ok(())
    }

    /// Apply an assignment delta: stop workers for removed resources, start
    /// workers for added ones. Safe against concurrent deltas; duplicate
    /// additions are ignored. Raises a protocol violation if the mesh hands
    /// out new work mid-shutdown.
    pub fn on_change(&self, assignment: ImporterChannelAssignment) -> ImportResult<()> {
        Self::apply_change(&self.core, assignment)
    }

    fn apply_change(
        core: &Arc<ManagerCore>,
        assignment: ImporterChannelAssignment,
    ) -> ImportResult<()> {
        if core.stopping.load(Ordering::SeqCst) {
            if !assignment.added().is_empty() {
                let fault = ImportError::StoppingViolation(core.name.clone());
                tracing::error!(importer = %core.name, "{fault}");
                return Err(fault);
            }
            return Ok(());
        }
        Self::apply_change_sets(core, assignment.added(), assignment.removed())
    }

    fn apply_change_sets(
        core: &Arc<ManagerCore>,
        added: &BTreeSet<Url>,
        removed: &BTreeSet<Url>,
    ) -> ImportResult<()> {
        // swap the worker map first so a racing delta sees the new world,
        // then perform the side effects for the diff that actually applied
        let (stopped, started) = loop {
            let (prev, stamp) = core.workers.get();

            let mut to_stop: Vec<Arc<Worker>> = Vec::new();
            let mut next = (*prev).clone();
            for uri in removed {
                if let Some(worker) = next.remove(uri) {
                    to_stop.push(worker);
                }
            }

            let mut to_start: Vec<(ResourceConfig, Arc<Worker>)> = Vec::new();
            {
                let configs = core.configs.lock();
                for uri in added {
                    if next.contains_key(uri) {
                        debug!(importer = %core.name, uri = %uri, "worker already running; ignoring duplicate assignment");
                        continue;
                    }
                    let config = configs.get(uri).cloned().ok_or_else(|| {
                        let fault = ImportError::UnconfiguredResource {
                            importer: core.name.clone(),
                            uri: uri.clone(),
                        };
                        tracing::error!(importer = %core.name, "{fault}");
                        fault
                    })?;
                    let importer = core.factory.create(&config)?;
                    let worker = Arc::new(Worker {
                        importer,
                        stop_flag: Arc::new(AtomicBool::new(false)),
                        handle: Mutex::new(None),
                    });
                    next.insert(uri.clone(), Arc::clone(&worker));
                    to_start.push((config, worker));
                }
            }

            if core.workers.compare_and_set(stamp, next, stamp + 1) {
                break (to_stop, to_start);
            }
        };

        for worker in stopped {
            Self::spawn_stop(core, worker);
        }
        for (config, worker) in started {
            Self::spawn_accept(core, &config, &worker);
        }
        Ok(())
    }

    fn spawn_accept(core: &Arc<ManagerCore>, config: &ResourceConfig, worker: &Arc<Worker>) {
        let ctx = ImporterContext::new(
            core.name.clone(),
            config.procedure.clone(),
            Arc::clone(&worker.stop_flag),
            Arc::clone(&core.invoker),
            Arc::clone(&core.stats),
        );
        let importer = Arc::clone(&worker.importer);
        let name = core.name.clone();
        let procedure = config.procedure.clone();
        let uri = config.uri.clone();
        let stats = Arc::clone(&core.stats);

        info!(importer = %name, uri = %uri, "starting importer worker");
        let handle = tokio::spawn(async move {
            stats.report_initialized(&name, &procedure);
            match importer.accept(ctx).await {
                Ok(()) => debug!(importer = %name, uri = %uri, "importer worker finished"),
                Err(e) => {
                    stats.report_failure(&name, &procedure);
                    tracing::error!(importer = %name, uri = %uri, "importer worker failed: {e}");
                }
            }
        });
        *worker.handle.lock() = Some(handle);
    }

    /// Stop one worker in the background: flag, release, bounded join
    fn spawn_stop(core: &Arc<ManagerCore>, worker: Arc<Worker>) {
        worker.stop_flag.store(true, Ordering::SeqCst);
        let name = core.name.clone();
        let grace = core.grace;
        tokio::spawn(async move {
            worker.importer.stop().await;
            let handle = worker.handle.lock().take();
            if let Some(mut handle) = handle {
                if tokio::time::timeout(grace, &mut handle).await.is_err() {
                    warn!(
                        importer = %name,
                        uri = %worker.importer.uri(),
                        "worker did not stop within the grace period; aborting"
                    );
                    handle.abort();
                }
            }
        });
    }

    /// Flip the stopping flag, clear the worker map, stop every active
    /// worker, withdraw this type's channels from the mesh, and wait out
    /// the grace period for in-flight worker completion.
    pub async fn stop(&self) -> ImportResult<()> {
        let core = &self.core;
        if core.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *core.state.lock() = ManagerState::Stopping;
        info!(importer = %core.name, "stopping importer lifecycle manager");

        // clear the map first; a concurrent on_change now sees the
        // stopping flag and must not start anything
        let active = loop {
            let (prev, stamp) = core.workers.get();
            if core.workers.compare_and_set(stamp, BTreeMap::new(), stamp + 1) {
                break prev;
            }
        };

        for worker in active.values() {
            worker.stop_flag.store(true, Ordering::SeqCst);
        }
        for worker in active.values() {
            worker.importer.stop().await;
        }

        if !core.factory.run_everywhere() {
            core.distributer
                .register_channels(&core.name, BTreeSet::new())
                .await?;
            core.distributer.unregister_callback(&core.name);
        }

        let mut handles: Vec<JoinHandle<()>> = active
            .values()
            .filter_map(|w| w.handle.lock().take())
            .collect();
        if !handles.is_empty() {
            let drain = futures::future::join_all(handles.iter_mut());
            if tokio::time::timeout(core.grace, drain).await.is_err() {
                warn!(
                    importer = %core.name,
                    "workers did not drain within the grace period; aborting the stragglers"
                );
                for handle in &handles {
                    handle.abort();
                }
            }
        }

        *core.state.lock() = ManagerState::Stopped;
        Ok(())
    }
}
