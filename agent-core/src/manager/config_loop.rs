// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! The dynamic configuration control loop (spec.md §4.4, "Config
//! application" / §4.7): consumes the configuration provider's stream and,
//! for every probe whose enablement changed, attaches or detaches its
//! kernel resources to match. A failure applying one probe's new state is
//! logged and does not stop the other probes in the same snapshot from
//! being applied (spec.md §7, "errors in one probe's transition must not
//! abort others").

use std::sync::atomic::Ordering;
use std::sync::Arc;

use agent_api::{ConfigSnapshot, ProbeId};
use log::{info, warn};
use tokio_stream::StreamExt;

use super::ProbeManager;

/// Drives `manager`'s configuration provider's watch stream until it ends
/// (normally only on shutdown, when the task is aborted rather than
/// observing a stream close). The snapshot `load()` was given already
/// attached every probe it enabled; this loop only reacts to changes.
pub(super) async fn run(manager: Arc<ProbeManager>) {
    let mut stream = manager.config_provider.watch();
    while let Some(snapshot) = stream.next().await {
        apply(&manager, &snapshot).await;
    }
    log::debug!("configuration provider stream ended");
}

/// Applies one snapshot: for every probe currently in the registry,
/// compares old-enabled against new-enabled and, on a change, performs the
/// matching attach or detach (spec.md §4.4, "Config application").
/// Unchanged probes are left untouched.
async fn apply(manager: &ProbeManager, snapshot: &ConfigSnapshot) {
    let ids: Vec<ProbeId> = manager.registry.lock().await.keys().cloned().collect();

    for id in ids {
        let new_enabled = snapshot.is_enabled(&id);
        let old_enabled = {
            let registry = manager.registry.lock().await;
            match registry.get(&id) {
                Some(state) => state.enabled.load(Ordering::Relaxed),
                None => continue,
            }
        };
        if old_enabled == new_enabled {
            continue;
        }

        if new_enabled {
            enable_probe(manager, &id).await;
        } else {
            disable_probe(manager, &id).await;
        }
    }
}

/// ¬old-enabled ∧ new-enabled: performs the same attach sequence as Load
/// step 4 for this probe only, then spawns its decode task.
async fn enable_probe(manager: &ProbeManager, id: &ProbeId) {
    let definition = {
        let registry = manager.registry.lock().await;
        match registry.get(id) {
            Some(state) => state.definition.clone(),
            None => return,
        }
    };

    match manager.attach_probe_fresh(definition).await {
        Ok(mut state) => {
            state.enabled.store(true, Ordering::Relaxed);
            manager.spawn_decode_task(&mut state);
            manager.registry.lock().await.insert(id.clone(), state);
            info!("probe {id} enabled");
        }
        Err(err) => {
            warn!("probe {id} failed to attach while enabling: {err}");
        }
    }
}

/// old-enabled ∧ ¬new-enabled: closes the probe and releases its kernel
/// collection, leaving it registered but unattached so a later
/// configuration update can re-enable it.
async fn disable_probe(manager: &ProbeManager, id: &ProbeId) {
    let mut registry = manager.registry.lock().await;
    let Some(state) = registry.get_mut(id) else {
        return;
    };
    manager.detach_probe(state).await;
    state.enabled.store(false, Ordering::Relaxed);
    info!("probe {id} disabled");
}
