// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Probe Manager (spec.md §4.4): owns the `Uninitialised` → `Loaded` →
//! `Running` → `Stopped` state machine, the probe registry, and the kernel
//! resources every probe holds while attached.

mod config_loop;
pub mod ebpf;
pub mod filter;
pub mod load;
pub mod state;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use agent_api::{ConfigSnapshot, ProbeId};
use log::{info, warn};
use nix::libc::RLIM_INFINITY;
use nix::sys::resource::{setrlimit, Resource};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::catalogue::load_catalogue;
use crate::config_provider::ConfigurationProvider;
use crate::errors::{AgentError, LifecycleError};
use crate::offsets::OffsetIndex;
use crate::pipeline::{self, PipelineHandler};
use crate::process::ProcessInfo;
use crate::scratch::ScratchAllocator;

pub use ebpf::EbpfBackend;
pub use state::{ManagerPhase, ProbeState};

/// Drops the kernel memory-lock limit, mirroring the one-time startup step
/// every `aya`-based loader needs before the first `EbpfLoader::load`
/// (grounded in `bpfd`'s `main()`, which does this unconditionally before
/// touching any kernel object).
fn raise_memlock_limit() -> Result<(), AgentError> {
    setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY)
        .map_err(|err| AgentError::Other(format!("failed to raise RLIMIT_MEMLOCK: {err}")))
}

/// Owns the full attach lifecycle for one target process: the registry of
/// loaded probes, the configuration control loop, and every collaborator
/// the state machine drives them through. Callers that intend to `run()`
/// it must hold it behind an `Arc` so the spawned configuration-loop task
/// can outlive the call that started it.
pub struct ProbeManager {
    process: ProcessInfo,
    backend: Arc<dyn EbpfBackend>,
    scratch: Arc<dyn ScratchAllocator>,
    handler: Arc<dyn PipelineHandler>,
    config_provider: Arc<dyn ConfigurationProvider>,
    offset_index: AsyncMutex<OffsetIndex>,
    phase: AsyncMutex<ManagerPhase>,
    registry: AsyncMutex<HashMap<ProbeId, ProbeState>>,
    config_task: AsyncMutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ProbeManager {
    pub fn new(
        process: ProcessInfo,
        backend: Arc<dyn EbpfBackend>,
        scratch: Arc<dyn ScratchAllocator>,
        handler: Arc<dyn PipelineHandler>,
        config_provider: Arc<dyn ConfigurationProvider>,
        offset_index: OffsetIndex,
    ) -> Self {
        Self {
            process,
            backend,
            scratch,
            handler,
            config_provider,
            offset_index: AsyncMutex::new(offset_index),
            phase: AsyncMutex::new(ManagerPhase::Uninitialised),
            registry: AsyncMutex::new(HashMap::new()),
            config_task: AsyncMutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    async fn transition(&self, next: ManagerPhase) -> Result<(), LifecycleError> {
        let mut phase = self.phase.lock().await;
        if !phase.can_transition_to(next) {
            return Err(match next {
                ManagerPhase::Loaded => LifecycleError::AlreadyLoaded,
                ManagerPhase::Stopped if *phase == ManagerPhase::Stopped => {
                    LifecycleError::AlreadyStopped
                }
                _ => LifecycleError::NotLoaded,
            });
        }
        *phase = next;
        Ok(())
    }

    /// Loads the catalogue, filters it against the target's function
    /// records, then resolves constants and attaches every probe the
    /// initial snapshot enables (spec.md §4.4, "Load" step 4). A probe the
    /// initial snapshot disables is registered with no collection, closers,
    /// or reader — it has no kernel resources until a later configuration
    /// update enables it (spec.md §3, "disabled" probes "have no closers
    /// and no handle").
    pub async fn load(&self, initial_snapshot: &ConfigSnapshot) -> Result<(), AgentError> {
        self.transition(ManagerPhase::Loaded).await?;

        raise_memlock_limit()?;

        let catalogue = load_catalogue()?;
        let surviving = filter::filter_probes(catalogue, self.process.function_records());

        let data = std::fs::read(self.process.resolved_exe_path()).map_err(|source| {
            crate::errors::TargetError::Io {
                path: self.process.resolved_exe_path().display().to_string(),
                source,
            }
        })?;
        let object_file = object::File::parse(&*data).ok();

        let mut registry = self.registry.lock().await;
        for probe in surviving {
            let probe = Arc::new(probe);
            if !initial_snapshot.is_enabled(&probe.id) {
                registry.insert(probe.id.clone(), ProbeState::new(probe));
                continue;
            }

            match self
                .attach_probe_with_object(probe.clone(), object_file.as_ref())
                .await
            {
                Ok(state) => {
                    state.enabled.store(true, Ordering::Relaxed);
                    registry.insert(probe.id.clone(), state);
                }
                Err(err) => {
                    warn!("probe {} failed to load: {err}", probe.id);
                }
            }
        }

        Ok(())
    }

    /// Resolves constants and attaches one probe, using an already-open
    /// executable handle (spec.md §4.4, Load step 4). Shared by `load()`,
    /// which parses the executable once for every surviving probe, and
    /// `attach_probe_fresh`, which re-opens it for a single probe being
    /// enabled after the fact.
    async fn attach_probe_with_object(
        &self,
        probe: Arc<crate::catalogue::ProbeDefinition>,
        object_file: Option<&object::File<'_>>,
    ) -> Result<ProbeState, AgentError> {
        let resolved_consts = load::resolve_consts(
            &probe,
            &self.process,
            &self.offset_index,
            self.scratch.as_ref(),
            object_file,
        )
        .await?;

        Ok(load::attach_probe(probe, &self.process, self.backend.as_ref(), &resolved_consts).await?)
    }

    /// Re-opens the target executable and attaches a single probe (spec.md
    /// §4.4, "Config application": "perform the same sequence as steps (4)
    /// of Load for this probe only"). Used when the configuration control
    /// loop turns on a probe that was registered but never attached.
    pub(super) async fn attach_probe_fresh(
        &self,
        probe: Arc<crate::catalogue::ProbeDefinition>,
    ) -> Result<ProbeState, AgentError> {
        let data = std::fs::read(self.process.resolved_exe_path()).map_err(|source| {
            crate::errors::TargetError::Io {
                path: self.process.resolved_exe_path().display().to_string(),
                source,
            }
        })?;
        let object_file = object::File::parse(&*data).ok();
        self.attach_probe_with_object(probe, object_file.as_ref()).await
    }

    /// Closes one probe's kernel resources and unloads its collection
    /// (spec.md §4.4, "Config application", old-enabled ∧ ¬new-enabled).
    pub(super) async fn detach_probe(&self, state: &mut ProbeState) {
        state.close().await;
        if let Some(collection) = state.collection.take() {
            self.backend.unload(collection).await;
        }
    }

    /// Spawns one decode task per loaded, enabled probe plus the
    /// configuration control loop, then waits for cancellation (spec.md
    /// §4.4, "Run"). Takes `Arc<Self>` by value so the spawned config-loop
    /// task can hold its own reference; callers that still need the
    /// manager afterwards should clone their `Arc` before calling this.
    pub async fn run(self: Arc<Self>) -> Result<(), AgentError> {
        self.transition(ManagerPhase::Running).await?;

        self.spawn_enabled_decode_tasks().await;

        let config_task = tokio::spawn(config_loop::run(self.clone()));
        *self.config_task.lock().await = Some(config_task);

        self.cancel.cancelled().await;
        info!("cancellation requested, stopping");
        self.stop().await
    }

    /// Spawns a decode task for every attached probe that has not already
    /// got one. A probe's `enabled` flag still gates whether its decoded
    /// spans reach the handler (spec.md §4.4, "Config application"); the
    /// task itself runs for the full lifetime of the probe so a later
    /// disable/re-enable doesn't need to restart it.
    async fn spawn_enabled_decode_tasks(&self) {
        let mut registry = self.registry.lock().await;
        for state in registry.values_mut() {
            self.spawn_decode_task(state);
        }
    }

    /// Spawns `state`'s decode task if it has an attached reader and does
    /// not already have one running. Used both by `run()`'s initial sweep
    /// and by the configuration control loop when it attaches a probe that
    /// was not part of the initial load (spec.md §4.4, "Config
    /// application": "then spawn its task").
    pub(super) fn spawn_decode_task(&self, state: &mut ProbeState) {
        if state.task.is_some() {
            return;
        }
        let Some(reader) = state.reader.take() else {
            return;
        };
        let decoder = state.definition.decoder;
        let scope = state.definition.scope.clone();
        let handler = self.handler.clone();
        let enabled = state.enabled.clone();
        state.task = Some(tokio::spawn(pipeline::decoder::run(
            reader, decoder, scope, handler, enabled,
        )));
    }

    /// Requests cancellation of the run loop from outside (e.g. a signal
    /// handler); `run()` observes this and proceeds to `stop()`.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// A copy of the current offset index, including anything resolved
    /// during `load()` beyond what it started with. Callers persist this
    /// after `stop()` so the next attach on the same binary version skips
    /// rediscovery (spec.md §4.2, "Index representation and
    /// serialisation").
    pub async fn offset_index_snapshot(&self) -> OffsetIndex {
        self.offset_index.lock().await.clone()
    }

    #[cfg(any(test, feature = "test-util"))]
    pub async fn loaded_probe_ids(&self) -> Vec<ProbeId> {
        self.registry.lock().await.keys().cloned().collect()
    }

    #[cfg(any(test, feature = "test-util"))]
    pub async fn is_probe_enabled(&self, id: &ProbeId) -> Option<bool> {
        self.registry
            .lock()
            .await
            .get(id)
            .map(|state| state.enabled.load(Ordering::Relaxed))
    }

    /// Closes every probe, unloads its kernel collection, and shuts down
    /// the configuration provider (spec.md §4.4, "Stop").
    pub async fn stop(&self) -> Result<(), AgentError> {
        self.transition(ManagerPhase::Stopped).await?;

        if let Some(task) = self.config_task.lock().await.take() {
            task.abort();
        }
        self.config_provider.shutdown().await;

        let mut registry = self.registry.lock().await;
        for (id, mut state) in registry.drain() {
            state.close().await;
            if let Some(collection) = state.collection.take() {
                self.backend.unload(collection).await;
            }
            info!("closed probe {id}");
        }

        Ok(())
    }
}
