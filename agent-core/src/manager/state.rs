// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! The Probe Manager's state machine and per-probe runtime state
//! (spec.md §4.4).

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::catalogue::ProbeDefinition;
use crate::manager::ebpf::{CollectionHandle, Closer, RingBufferReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerPhase {
    Uninitialised,
    Loaded,
    Running,
    Stopped,
}

impl ManagerPhase {
    pub fn can_transition_to(self, next: ManagerPhase) -> bool {
        matches!(
            (self, next),
            (ManagerPhase::Uninitialised, ManagerPhase::Loaded)
                | (ManagerPhase::Loaded, ManagerPhase::Running)
                | (ManagerPhase::Loaded, ManagerPhase::Stopped)
                | (ManagerPhase::Running, ManagerPhase::Stopped)
        )
    }
}

/// Per-probe runtime state tracked by the registry.
pub struct ProbeState {
    pub definition: Arc<ProbeDefinition>,
    pub collection: Option<CollectionHandle>,
    pub closers: Vec<Box<dyn Closer>>,
    /// Created during load, consumed by `run()` when it spawns the probe's
    /// decode task (spec.md §4.4, Load step 4 / Run).
    pub reader: Option<Box<dyn RingBufferReader>>,
    pub task: Option<JoinHandle<()>>,
    /// Whether the decode task currently forwards this probe's spans to the
    /// pipeline handler (spec.md §4.4, "Config application"). Shared with
    /// the spawned decode task so the configuration control loop can flip
    /// it without restarting the task or re-attaching the probe.
    pub enabled: Arc<AtomicBool>,
}

impl ProbeState {
    pub fn new(definition: Arc<ProbeDefinition>) -> Self {
        Self {
            definition,
            collection: None,
            closers: Vec::new(),
            reader: None,
            task: None,
            enabled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Installs a fresh closer list, returning any closers that were
    /// already present. A non-empty return means a prior load was never
    /// cleanly stopped (spec.md §5, "accidental double-load") — the
    /// caller must drain the returned closers to avoid leaking kernel
    /// resources. This is only safe to call while the registry mutex is
    /// held, which is what gives the swap its atomicity.
    pub fn swap_closers(&mut self, new_closers: Vec<Box<dyn Closer>>) -> Vec<Box<dyn Closer>> {
        std::mem::replace(&mut self.closers, new_closers)
    }

    /// Drains and closes every closer in the list, and drops the decode
    /// task and its ring-buffer reader (spec.md §4.4, "Close a probe").
    /// Idempotent: an empty list is a no-op. Does not unload the kernel
    /// collection — the caller owns the backend handle needed for that and
    /// clears `collection` itself once it has done so.
    pub async fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.reader = None;
        let mut closers = std::mem::take(&mut self.closers);
        for closer in closers.iter_mut() {
            closer.close().await;
        }
    }
}
