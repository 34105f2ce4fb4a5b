// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Graceful shutdown: waits for SIGINT/SIGTERM and asks the Probe Manager
//! to unwind (spec.md §4.4, "Shutdown"), so every attached probe is closed
//! and its buffered records drained instead of the process being killed
//! out from under the kernel programs.

use std::sync::Arc;

use agent_core::ProbeManager;
use log::debug;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};

/// Waits for SIGINT or SIGTERM, then calls [`ProbeManager::request_stop`].
/// Intended to be spawned alongside `manager.run()` and left to finish on
/// its own.
pub async fn wait_for_shutdown(manager: Arc<ProbeManager>) -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    select! {
        _ = sigint.recv() => debug!("received SIGINT"),
        _ = sigterm.recv() => debug!("received SIGTERM"),
    }

    manager.request_stop();
    Ok(())
}
