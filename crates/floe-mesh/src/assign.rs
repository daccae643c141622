//! Leader-only fair assignment engine
//!
//! Compares the registered channel set against the currently assigned one
//! and distributes the difference as evenly as possible across the mesh,
//! never relocating a channel that is already assigned to a live host.
//! New channels are placed into the spare capacity of under-loaded hosts,
//! shuffled (seeded, deterministic per computation) to avoid systematic
//! bias. Each affected host's assignment node is written with a
//! version-conditioned update; losing any write race abandons the pass and
//! re-triggers the whole computation from the current master list.

use crate::distributer::DistributerCore;
use crate::mode::OperationMode;
use crate::spec::{decode_spec_list, encode_spec_list, ChannelSpec};
use crate::stamped::Stamped;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The desired per-host channel sets computed by one planning pass
#[derive(Debug)]
pub(crate) struct AssignmentPlan {
    pub by_host: BTreeMap<String, BTreeSet<ChannelSpec>>,
    /// Newly placed channels, for logging
    pub placements: Vec<(ChannelSpec, String)>,
    pub removed: BTreeSet<ChannelSpec>,
}

/// Pure planning step: the fair target is `ceil(|channels| / |hosts|)`,
/// and every host below it contributes that much spare room. Each new
/// channel goes to the least-loaded host that still has room, with ties
/// broken in seeded-shuffled host order so repeated runs do not pile onto
/// the lexicographically first host. Channels present in both the old and
/// new master list stay on their host.
///
/// Returns `None` when there is nothing to do or no live hosts to do it on.
pub(crate) fn plan_assignment(
    channels: &BTreeSet<ChannelSpec>,
    specs: &BTreeMap<ChannelSpec, String>,
    hosts: &BTreeSet<String>,
    seed: u64,
) -> Option<AssignmentPlan> {
    let assigned: BTreeSet<ChannelSpec> = specs.keys().cloned().collect();
    let added: BTreeSet<ChannelSpec> = channels.difference(&assigned).cloned().collect();
    let removed: BTreeSet<ChannelSpec> = assigned.difference(channels).cloned().collect();

    if added.is_empty() && removed.is_empty() {
        return None;
    }
    if hosts.is_empty() {
        // division by zero lurks here; with no live hosts there is nothing
        // to assign and the next membership change recomputes
        debug!("no live hosts; deferring channel assignment");
        return None;
    }

    let mut by_host: BTreeMap<String, BTreeSet<ChannelSpec>> = hosts
        .iter()
        .map(|h| (h.clone(), BTreeSet::new()))
        .collect();
    for (spec, host) in specs {
        if removed.contains(spec) {
            continue;
        }
        if let Some(set) = by_host.get_mut(host) {
            set.insert(spec.clone());
        }
    }

    let fair = channels.len().div_ceil(hosts.len());
    let mut room: BTreeMap<&String, i64> = hosts
        .iter()
        .map(|h| (h, fair as i64 - by_host[h].len() as i64))
        .collect();
    let mut order: Vec<&String> = hosts.iter().collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));

    let mut placements = Vec::with_capacity(added.len());
    for spec in added {
        let host = order
            .iter()
            .filter(|h| room[**h] > 0)
            .min_by_key(|h| by_host[**h].len())
            .or_else(|| order.iter().min_by_key(|h| by_host[**h].len()))
            .copied()
            .expect("hosts is non-empty");
        *room.get_mut(host).expect("room covers every host") -= 1;
        by_host
            .get_mut(host)
            .expect("by_host covers every host")
            .insert(spec.clone());
        placements.push((spec, host.clone()));
    }

    Some(AssignmentPlan {
        by_host,
        placements,
        removed,
    })
}

/// Run the assignment engine until a pass commits cleanly. Retries pull a
/// fresh master list first, so a pass that lost a write race self-heals
/// from current state instead of partially committing.
pub(crate) async fn run_assign(core: &Arc<DistributerCore>) {
    loop {
        if core.done() {
            return;
        }
        match assign_once(core).await {
            Committed::Fully => return,
            Committed::RetryNeeded => {
                refresh_master(core).await;
                tokio::time::sleep(std::time::Duration::from_millis(
                    core.config.assign_retry_delay_ms,
                ))
                .await;
            }
        }
    }
}

enum Committed {
    Fully,
    RetryNeeded,
}

async fn assign_once(core: &Arc<DistributerCore>) -> Committed {
    if *core.mode.reference() == OperationMode::Initializing {
        return Committed::Fully;
    }

    let channels = core.channels.reference();
    let specs = core.specs.reference();
    let hosts = core.hosts.reference();
    let host_names: BTreeSet<String> = hosts.keys().cloned().collect();

    let seed = core.nonce ^ core.assign_seq.fetch_add(1, Ordering::SeqCst);
    let Some(plan) = plan_assignment(&channels, &specs, &host_names, seed) else {
        return Committed::Fully;
    };

    if !plan.removed.is_empty() {
        info!(
            host = %core.host_id,
            "LEADER removing channels {:?}",
            plan.removed
        );
    }
    for (spec, host) in &plan.placements {
        info!(host = %core.host_id, "LEADER assigning {spec} to host {host}");
    }

    // write each changed host its assigned channel list, all conditioned on
    // the host's last seen data version
    let mut writes = Vec::new();
    for (host, needed) in &plan.by_host {
        let previous: BTreeSet<ChannelSpec> = specs
            .iter()
            .filter(|(_, h)| *h == host)
            .map(|(k, _)| k.clone())
            .collect();
        if needed != &previous {
            // a watermark that has not seen a read yet conditions on the
            // freshly created node's version rather than writing blind
            let version = hosts
                .get(host)
                .map(|watermark| watermark.load(Ordering::SeqCst).max(0))
                .unwrap_or(0);
            writes.push((host.clone(), encode_spec_list(needed), version));
        }
    }

    let pending = writes.iter().map(|(host, data, version)| {
        let path = core.paths.host_path(host);
        let store = Arc::clone(&core.store);
        async move { store.set_data(&path, data, *version).await }
    });
    let results = futures::future::join_all(pending).await;

    for ((host, _, _), result) in writes.iter().zip(results) {
        if let Err(e) = result {
            if core.done() {
                return Committed::Fully;
            }
            warn!(
                host = %core.host_id,
                node = %host,
                "LEADER retrying channel assignment; write failed: {e}"
            );
            return Committed::RetryNeeded;
        }
    }
    Committed::Fully
}

/// Best-effort pull of the master list into the local mirror before a retry
async fn refresh_master(core: &Arc<DistributerCore>) {
    match core.store.get_data(&core.paths.master_dn, false).await {
        Ok(reply) => match decode_spec_list(&core.paths.master_dn, &reply.data) {
            Ok(specs) => {
                apply_newer(&core.channels, specs, reply.stat.version);
            }
            Err(e) => {
                tracing::error!(host = %core.host_id, "failed to parse the master channel list: {e}");
            }
        },
        Err(e) if e.is_gone() => {}
        Err(e) => {
            warn!(host = %core.host_id, "unable to refresh the master channel list: {e}");
        }
    }
}

fn apply_newer<T>(cell: &Stamped<T>, next: T, version: i64) {
    let (_, stamp) = cell.get();
    if stamp < version {
        let _ = cell.compare_and_set(stamp, next, version);
    }
}
