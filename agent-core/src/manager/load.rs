// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! The heavy lifting of Probe Manager "Load" (spec.md §4.4, step 4):
//! resolving a probe's constants, instantiating its kernel collection,
//! attaching its uprobes under their individual failure modes, and opening
//! its ring-buffer reader.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::Mutex as AsyncMutex;

use crate::catalogue::{ConstValue, FailureMode, ProbeConst, ProbeDefinition};
use crate::errors::{AttachError, ResolveError};
use crate::offsets::{resolve::offset_for, OffsetIndex};
use crate::process::ProcessInfo;
use crate::scratch::ScratchAllocator;

use super::ebpf::{EbpfBackend, ResolvedConst};
use super::state::ProbeState;

/// Resolves every `ProbeConst` for one probe into the key/value pairs ready
/// to inject, honouring version constraints (a constraint miss silently
/// drops the constant; an unknown module version is fatal) and the
/// allocation collaborator.
pub async fn resolve_consts(
    probe: &ProbeDefinition,
    process: &ProcessInfo,
    offset_index: &AsyncMutex<OffsetIndex>,
    scratch: &dyn ScratchAllocator,
    object_file: Option<&object::File<'_>>,
) -> Result<Vec<ResolvedConst>, ResolveError> {
    let mut resolved = Vec::with_capacity(probe.consts.len());

    for constant in &probe.consts {
        match constant {
            ProbeConst::StructField {
                id,
                constraint,
                inject_key,
            } => {
                let version = process.module_versions().get(&id.module);
                match constraint.evaluate(version) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(()) => {
                        return Err(ResolveError::UnknownModuleVersion {
                            module: id.module.clone(),
                        })
                    }
                }
                let version = version.ok_or_else(|| ResolveError::UnknownModuleVersion {
                    module: id.module.clone(),
                })?;

                let mut index = offset_index.lock().await;
                let entry = offset_for(&mut index, id, version, object_file)?;
                if !entry.valid {
                    continue;
                }
                resolved.push(ResolvedConst {
                    inject_key: (*inject_key).to_string(),
                    value: ConstValue::U64(entry.bytes),
                });
            }
            ProbeConst::Allocation {
                inject_key,
                size_hint_bytes: _,
            } => {
                let region = process.scratch_alloc(scratch).await?;
                resolved.push(ResolvedConst {
                    inject_key: (*inject_key).to_string(),
                    value: ConstValue::U64(region.start_address),
                });
            }
            ProbeConst::Opaque { inject_key, value } => {
                resolved.push(ResolvedConst {
                    inject_key: (*inject_key).to_string(),
                    value: value.clone(),
                });
            }
        }
    }

    Ok(resolved)
}

/// Attaches one probe: evaluates its uprobes' version constraints, attaches
/// entry/return programs per the function records the Binary Inspector
/// found, and opens the ring-buffer reader. Honours each uprobe's
/// individual failure mode; `FailureMode::Error` aborts the whole probe
/// (the caller is responsible for draining the partial closer list this
/// function already attached).
pub async fn attach_probe(
    probe: Arc<ProbeDefinition>,
    process: &ProcessInfo,
    backend: &dyn EbpfBackend,
    resolved_consts: &[ResolvedConst],
) -> Result<ProbeState, AttachError> {
    let mut state = ProbeState::new(probe.clone());

    let collection = backend
        .load((probe.program_spec)().object_name, resolved_consts)
        .await?;
    state.collection = Some(collection);

    for uprobe in &probe.uprobes {
        let version = process.module_versions().get(&probe.id.package);
        let constraint_result = uprobe
            .version_constraints
            .iter()
            .map(|c| c.evaluate(version))
            .collect::<Result<Vec<bool>, ()>>();

        let should_attach = match constraint_result {
            Ok(flags) => flags.into_iter().all(|v| v),
            Err(()) => {
                handle_failure(
                    &mut state,
                    backend,
                    uprobe.failure_mode,
                    &probe,
                    &format!("{}: module version unknown", uprobe.symbol),
                )
                .await?;
                continue;
            }
        };
        if !should_attach {
            debug!("{} excluded by version constraint", uprobe.symbol);
            continue;
        }

        let Some(function) = process.function_record(uprobe.symbol) else {
            handle_failure(
                &mut state,
                backend,
                uprobe.failure_mode,
                &probe,
                &format!("{}: symbol not found in target", uprobe.symbol),
            )
            .await?;
            continue;
        };

        match backend
            .attach_uprobe(
                state.collection.as_ref().expect("collection set above"),
                uprobe.entry_program,
                uprobe.symbol,
                function.entry_offset,
                process.resolved_exe_path(),
                process.pid().get(),
            )
            .await
        {
            Ok(closer) => state.closers.push(closer),
            Err(err) => {
                handle_failure(
                    &mut state,
                    backend,
                    uprobe.failure_mode,
                    &probe,
                    &format!("{}: entry attach failed: {err}", uprobe.symbol),
                )
                .await?;
                continue;
            }
        }

        if let Some(return_program) = uprobe.return_program {
            for &return_offset in &function.return_offsets {
                match backend
                    .attach_uprobe(
                        state.collection.as_ref().expect("collection set above"),
                        return_program,
                        uprobe.symbol,
                        return_offset,
                        process.resolved_exe_path(),
                        process.pid().get(),
                    )
                    .await
                {
                    Ok(closer) => state.closers.push(closer),
                    Err(err) => {
                        handle_failure(
                            &mut state,
                            backend,
                            uprobe.failure_mode,
                            &probe,
                            &format!("{}: return attach failed: {err}", uprobe.symbol),
                        )
                        .await?;
                    }
                }
            }
        }
    }

    let reader = backend
        .ring_buffer_reader(
            state.collection.as_ref().expect("collection set above"),
            probe.scope.name,
        )
        .await?;
    state.reader = Some(reader);

    Ok(state)
}

/// Applies a uprobe's failure mode to one attach failure. `Error` rolls
/// back everything attached so far for this probe and returns the abort;
/// `Warn`/`Ignore` just log at the matching severity and let the caller
/// continue with the next uprobe.
async fn handle_failure(
    state: &mut ProbeState,
    backend: &dyn EbpfBackend,
    mode: FailureMode,
    probe: &ProbeDefinition,
    message: &str,
) -> Result<(), AttachError> {
    match mode {
        FailureMode::Ignore => {
            debug!("{message}");
            Ok(())
        }
        FailureMode::Warn => {
            warn!("{message}");
            Ok(())
        }
        FailureMode::Error => {
            warn!("{message}; aborting probe {}", probe.id);
            state.close().await;
            if let Some(collection) = state.collection.take() {
                backend.unload(collection).await;
            }
            Err(AttachError::Fatal(probe.id.clone()))
        }
    }
}
