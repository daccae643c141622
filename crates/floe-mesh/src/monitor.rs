//! Watch-driven background monitors
//!
//! Each monitor is a small finite-state task: issue a read that installs a
//! one-shot watch, process the result, then await the watch and re-arm by
//! issuing a fresh read. The done flag is checked before every read and
//! before every re-arm. A path that goes away ends the monitor quietly —
//! that is the expected shutdown/rebalance race, not an error. Malformed
//! node content is logged and the monitor waits for the data to change
//! again externally instead of spinning on it.

use crate::assign;
use crate::distributer::{DispatchEvent, DistributerCore};
use crate::error::MeshResult;
use crate::mode::{OperationMode, VersionedOperationMode};
use crate::spec::{decode_spec_list, ChannelAssignment, ChannelSpec};
use crate::store::{basename, Watch, WatchEvent};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Ready = Option<oneshot::Sender<MeshResult<()>>>;

fn send_ready(ready: &mut Ready, result: MeshResult<()>) {
    if let Some(tx) = ready.take() {
        let _ = tx.send(result);
    }
}

/// Await a one-shot watch, racing it against shutdown. Returns false when
/// the monitor should end.
async fn await_watch(core: &DistributerCore, watch: Watch) -> bool {
    let mut shutdown = core.shutdown.subscribe();
    // the done flag is raised before the shutdown broadcast, so this check
    // covers a signal sent before we subscribed
    if core.done() {
        return false;
    }
    tokio::select! {
        _ = shutdown.recv() => false,
        event = watch => match event {
            Ok(WatchEvent::SessionExpired) | Err(_) => false,
            Ok(_) => !core.done(),
        },
    }
}

/// Spawn the mode, election, membership, and master-list monitors, waiting
/// for each first pass before arming the next. The order matters: host
/// membership must be populated before the master list can trigger an
/// assignment pass, or a freshly elected leader would defer with "no live
/// hosts" and nothing would re-trigger it.
pub(crate) async fn arm_monitors(core: &Arc<DistributerCore>) -> MeshResult<()> {
    let (tx, rx) = oneshot::channel();
    core.track_task(tokio::spawn(monitor_operation_mode(
        Arc::clone(core),
        Some(tx),
    )));
    rx.await
        .map_err(|_| crate::error::MeshError::ShuttingDown)??;

    let (tx, rx) = oneshot::channel();
    core.track_task(tokio::spawn(monitor_election(Arc::clone(core), Some(tx))));
    rx.await
        .map_err(|_| crate::error::MeshError::ShuttingDown)??;

    let (tx, rx) = oneshot::channel();
    core.track_task(tokio::spawn(monitor_host_nodes(Arc::clone(core), Some(tx))));
    rx.await
        .map_err(|_| crate::error::MeshError::ShuttingDown)??;

    let (tx, rx) = oneshot::channel();
    core.track_task(tokio::spawn(monitor_master_channels(
        Arc::clone(core),
        Some(tx),
    )));
    rx.await
        .map_err(|_| crate::error::MeshError::ShuttingDown)??;

    Ok(())
}

/// Mirror the cluster operational mode and fan out changes
async fn monitor_operation_mode(core: Arc<DistributerCore>, mut ready: Ready) {
    loop {
        if core.done() {
            send_ready(&mut ready, Err(crate::error::MeshError::ShuttingDown));
            return;
        }
        let reply = match core.store.get_data(&core.paths.mode_path, true).await {
            Ok(reply) => reply,
            Err(e) if e.is_gone() => {
                send_ready(&mut ready, Err(e.into()));
                return;
            }
            Err(e) => {
                tracing::error!(host = %core.host_id, "unable to read the operation mode node: {e}");
                send_ready(&mut ready, Err(e.into()));
                return;
            }
        };
        let watch = reply.watch.expect("watch requested");

        match OperationMode::from_bytes(&reply.data) {
            Ok(next) => {
                let (prev, stamp) = core.mode.get();
                let applies = stamp <= reply.stat.version
                    && core.mode.compare_and_set(stamp, next, reply.stat.version);
                if applies && *prev != next {
                    info!(host = %core.host_id, mode = %next, "cluster operation mode changed");
                    if core.is_leader() && !core.done() && next == OperationMode::Running {
                        info!(
                            host = %core.host_id,
                            "LEADER assign channels task triggered on cluster state change"
                        );
                        assign::run_assign(&core).await;
                    }
                    core.post(DispatchEvent::Mode(VersionedOperationMode::new(
                        next,
                        reply.stat.version,
                    )));
                }
                send_ready(&mut ready, Ok(()));
            }
            Err(e) => {
                tracing::error!(host = %core.host_id, "undecodable operation mode content: {e}");
                send_ready(&mut ready, Err(e));
            }
        }

        if !await_watch(&core, watch).await {
            return;
        }
    }
}

/// Leadership is implicit: the lexicographically first candidate under the
/// election directory leads, and re-evaluation happens whenever the
/// candidate set changes. Losing a session removes the candidate, so
/// failover needs no resignation message.
async fn monitor_election(core: Arc<DistributerCore>, mut ready: Ready) {
    let own = basename(&core.candidate).to_string();
    loop {
        if core.done() {
            send_ready(&mut ready, Err(crate::error::MeshError::ShuttingDown));
            return;
        }
        let reply = match core.store.get_children(&core.paths.master_dn, true).await {
            Ok(reply) => reply,
            Err(e) if e.is_gone() => {
                send_ready(&mut ready, Err(e.into()));
                return;
            }
            Err(e) => {
                tracing::error!(host = %core.host_id, "unable to list election candidates: {e}");
                send_ready(&mut ready, Err(e.into()));
                return;
            }
        };
        let watch = reply.watch.expect("watch requested");
        let participants = reply.children.len();

        if !core.is_leader() && reply.children.iter().next() == Some(&own) {
            core.is_leader.store(true, Ordering::SeqCst);
            info!(host = %core.host_id, "LEADER is now the importer channel leader");
            // only rebalance right away if membership bookkeeping has
            // caught up with the electorate
            if core.hosts.reference().len() == participants {
                info!(
                    host = %core.host_id,
                    "LEADER assign channels task triggered on elector node change"
                );
                assign::run_assign(&core).await;
            }
        }
        send_ready(&mut ready, Ok(()));

        if !await_watch(&core, watch).await {
            return;
        }
    }
}

/// Mirror the master channel list; the leader recomputes assignments on
/// every accepted change
async fn monitor_master_channels(core: Arc<DistributerCore>, mut ready: Ready) {
    loop {
        if core.done() {
            send_ready(&mut ready, Err(crate::error::MeshError::ShuttingDown));
            return;
        }
        let reply = match core.store.get_data(&core.paths.master_dn, true).await {
            Ok(reply) => reply,
            Err(e) if e.is_gone() => {
                send_ready(&mut ready, Err(e.into()));
                return;
            }
            Err(e) => {
                tracing::error!(host = %core.host_id, "unable to read the master channel list: {e}");
                send_ready(&mut ready, Err(e.into()));
                return;
            }
        };
        let watch = reply.watch.expect("watch requested");

        match decode_spec_list(&core.paths.master_dn, &reply.data) {
            Ok(next) => {
                let (_, stamp) = core.channels.get();
                let applied = stamp <= reply.stat.version
                    && core.channels.compare_and_set(stamp, next, reply.stat.version);
                if applied {
                    debug!(host = %core.host_id, "received channel assignment master copy");
                    if core.is_leader() && !core.done() {
                        info!(
                            host = %core.host_id,
                            "LEADER assign channels task triggered on changed master copy receipt"
                        );
                        assign::run_assign(&core).await;
                    }
                }
                send_ready(&mut ready, Ok(()));
            }
            Err(e) => {
                tracing::error!(host = %core.host_id, "failed to parse the master channel list: {e}");
                send_ready(&mut ready, Err(e));
            }
        }

        if !await_watch(&core, watch).await {
            return;
        }
    }
}

/// Track mesh membership through the ephemeral host directory. Hosts that
/// leave are purged from the assignment map (the leader then redistributes
/// their channels); hosts that join get their assignment node mirrored.
async fn monitor_host_nodes(core: Arc<DistributerCore>, mut ready: Ready) {
    loop {
        if core.done() {
            send_ready(&mut ready, Err(crate::error::MeshError::ShuttingDown));
            return;
        }
        let reply = match core.store.get_children(&core.paths.host_dn, true).await {
            Ok(reply) => reply,
            Err(e) if e.is_gone() => {
                send_ready(&mut ready, Err(e.into()));
                return;
            }
            Err(e) => {
                tracing::error!(host = %core.host_id, "unable to list mesh host nodes: {e}");
                send_ready(&mut ready, Err(e.into()));
                return;
            }
        };
        let watch = reply.watch.expect("watch requested");

        process_membership(&core, &reply.children, reply.stat.cversion).await;
        send_ready(&mut ready, Ok(()));

        if !await_watch(&core, watch).await {
            return;
        }
    }
}

async fn process_membership(
    core: &Arc<DistributerCore>,
    children: &BTreeSet<String>,
    cversion: i64,
) {
    let (oldgen, hstamp) = core.hosts.get();
    if hstamp >= cversion {
        return;
    }

    let added: Vec<String> = children
        .iter()
        .filter(|h| !oldgen.contains_key(*h))
        .cloned()
        .collect();
    let removed: BTreeSet<String> = oldgen
        .keys()
        .filter(|h| !children.contains(*h))
        .cloned()
        .collect();

    let mut newgen: BTreeMap<String, Arc<AtomicI64>> = oldgen
        .iter()
        .filter(|(h, _)| !removed.contains(*h))
        .map(|(h, gen)| (h.clone(), Arc::clone(gen)))
        .collect();
    for host in &added {
        newgen.insert(host.clone(), Arc::new(AtomicI64::new(-1)));
    }

    if !core.hosts.compare_and_set(hstamp, newgen, cversion) {
        return;
    }

    if !removed.is_empty() {
        loop {
            let (prev, sstamp) = core.specs.get();
            let next: BTreeMap<ChannelSpec, String> = prev
                .iter()
                .filter(|(_, h)| !removed.contains(*h))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if core.specs.compare_and_set(sstamp, next, sstamp + 1) {
                break;
            }
        }
        info!(
            host = %core.host_id,
            "host(s) {removed:?} no longer servicing importer channels"
        );
        if core.is_leader() && !core.done() {
            info!(
                host = %core.host_id,
                "LEADER assign channels task triggered on node removal"
            );
            assign::run_assign(core).await;
        }
    }

    if !added.is_empty() && !core.done() {
        for host in added {
            info!(host = %core.host_id, node = %host, "starting to monitor host node");
            core.track_task(tokio::spawn(monitor_host_assignment(
                Arc::clone(core),
                host,
            )));
        }
    }
}

/// Mirror one host's assignment node. When the node belongs to this host,
/// accepted changes are exploded into per-importer deltas and posted to
/// the dispatcher. Updates whose data version is not strictly newer than
/// the host's watermark are rejected — duplicate or out-of-order watch
/// deliveries must not regress the assignment map.
async fn monitor_host_assignment(core: Arc<DistributerCore>, host: String) {
    let path = core.paths.host_path(&host);
    loop {
        if core.done() {
            return;
        }
        let reply = match core.store.get_data(&path, true).await {
            Ok(reply) => reply,
            Err(e) if e.is_gone() => {
                debug!(host = %core.host_id, node = %host, "host assignment node went away");
                return;
            }
            Err(e) => {
                tracing::error!(host = %core.host_id, node = %host, "unable to read host assignment node: {e}");
                return;
            }
        };
        let watch = reply.watch.expect("watch requested");

        match decode_spec_list(&path, &reply.data) {
            Ok(nspecs) => {
                apply_host_specs(&core, &host, &nspecs, reply.stat.version);
            }
            Err(e) => {
                tracing::error!(host = %core.host_id, node = %host, "failed to parse host assignment node: {e}");
            }
        }

        if !await_watch(&core, watch).await {
            return;
        }
    }
}

fn apply_host_specs(
    core: &Arc<DistributerCore>,
    host: &str,
    nspecs: &BTreeSet<ChannelSpec>,
    version: i64,
) {
    let watermark = core.hosts.reference().get(host).cloned().unwrap_or_else(|| {
        warn!(
            host = %core.host_id,
            node = %host,
            "no data watermark for host; membership bookkeeping is behind"
        );
        Arc::new(AtomicI64::new(-1))
    });

    // claim the node's data version; a claim that fails means this update
    // is stale or a concurrent delivery already won
    loop {
        let seen = watermark.load(Ordering::SeqCst);
        if seen >= version {
            warn!(
                host = %core.host_id,
                node = %host,
                seen,
                version,
                "rejecting stale host assignment update"
            );
            return;
        }
        if watermark
            .compare_exchange(seen, version, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            break;
        }
    }

    // rebuild the global spec map: drop everything previously attributed to
    // this host or now claimed by it, then re-insert the new claim
    let oldspecs: BTreeSet<ChannelSpec> = loop {
        let (prev, sstamp) = core.specs.get();
        let oldspecs = prev
            .iter()
            .filter(|(_, h)| h.as_str() == host)
            .map(|(k, _)| k.clone())
            .collect();
        let mut next: BTreeMap<ChannelSpec, String> = prev
            .iter()
            .filter(|(k, h)| h.as_str() != host && !nspecs.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for spec in nspecs {
            next.insert(spec.clone(), host.to_string());
        }
        if core.specs.compare_and_set(sstamp, next, sstamp + 1) {
            break oldspecs;
        }
    };

    if host == core.host_id && !core.done() {
        let assignment = ChannelAssignment::new(&oldspecs, nspecs, version);
        if !assignment.removed().is_empty() {
            info!(
                host = %core.host_id,
                "removing channel assignments: {:?}",
                assignment.removed()
            );
        }
        if !assignment.added().is_empty() {
            info!(
                host = %core.host_id,
                "adding channel assignments: {:?}",
                assignment.added()
            );
        }
        for per_importer in assignment.per_importer() {
            if core.done() {
                break;
            }
            core.post(DispatchEvent::Assignment(per_importer));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::distributer::ChannelDistributer;
    use crate::mode::OperationMode;
    use crate::spec::ChannelSpec;
    use crate::store::memory::MemoryMeshStore;
    use url::Url;

    fn spec(importer: &str, uri: &str) -> ChannelSpec {
        ChannelSpec::new(importer, Url::parse(uri).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_stale_host_update_does_not_mutate_specs() {
        let store = MemoryMeshStore::new();
        let distributer = ChannelDistributer::start(
            std::sync::Arc::new(store.session()),
            "host-1",
            OperationMode::Running,
            MeshConfig::default(),
        )
        .await
        .unwrap();
        let core = distributer.core();

        let first: BTreeSet<ChannelSpec> = [spec("a", "kafka://t1")].into();
        apply_host_specs(core, "host-1", &first, 5);
        assert_eq!(core.specs.reference().len(), 1);

        // an equal or older data version must be rejected outright
        let stale: BTreeSet<ChannelSpec> = [spec("a", "kafka://t2")].into();
        apply_host_specs(core, "host-1", &stale, 5);
        apply_host_specs(core, "host-1", &stale, 3);
        assert!(core.specs.reference().contains_key(&spec("a", "kafka://t1")));
        assert!(!core.specs.reference().contains_key(&spec("a", "kafka://t2")));

        // a strictly newer version applies
        apply_host_specs(core, "host-1", &stale, 6);
        assert!(core.specs.reference().contains_key(&spec("a", "kafka://t2")));

        distributer.shutdown().await.unwrap();
    }
}
