// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! `agent-cli`: the process that owns a target's attach lifecycle end to
//! end. Everything `agent-core` leaves as a collaborator contract — the
//! `aya` backend, scratch allocation, OTLP export, and target discovery —
//! is wired together here (spec.md §6).

mod args;
mod exporter;
mod signal;
mod stubs;
mod target;

use std::sync::Arc;
use std::time::Duration;

use agent_api::config::EnvConfig;
use agent_api::ConfigSnapshot;
use agent_core::catalogue::{interesting_symbols, load_catalogue};
use agent_core::config_provider::{ConfigurationProvider, FileWatchConfigProvider, StaticConfigProvider};
use agent_core::inspect::inspect;
use agent_core::manager::ebpf::AyaBackend;
use agent_core::offsets::OffsetIndex;
use agent_core::process::{ProcessId, ProcessInfo};
use agent_core::ProbeManager;
use clap::Parser;
use log::info;
use opentelemetry_semantic_conventions::resource::SERVICE_NAME;
use opentelemetry_sdk::Resource;

const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = args::Cli::parse();
    let env = EnvConfig::from_environment()?;

    let pid = resolve_target_pid(&cli, &env)?;
    info!("attaching to pid {}", pid.get());

    let catalogue = load_catalogue()?;
    let interesting = interesting_symbols(&catalogue);
    let inspected = inspect(&pid.exe_path(), &interesting)?;

    let process = ProcessInfo::new(
        pid,
        pid.exe_path(),
        inspected.toolchain_version,
        inspected.module_versions,
        inspected.function_records,
    );

    let offset_index = OffsetIndex::load_from_file(&cli.offset_index).unwrap_or_else(|err| {
        log::warn!(
            "failed to load offset index from {}: {err}, starting empty",
            cli.offset_index.display()
        );
        OffsetIndex::new()
    });

    let backend = Arc::new(AyaBackend::new(cli.probe_object_dir.clone(), env.show_verifier_log));
    let scratch = Arc::new(stubs::PtraceScratchAllocator::new());

    let endpoint = cli
        .otlp_endpoint
        .clone()
        .unwrap_or_else(|| DEFAULT_OTLP_ENDPOINT.to_string());
    let resource = build_resource(&env);
    let tracer_provider = exporter::build_tracer_provider(&endpoint, resource)?;
    let handler = Arc::new(exporter::OtlpExporter::new(tracer_provider));

    let config_provider: Arc<dyn ConfigurationProvider> = match &cli.config_file {
        Some(path) => Arc::new(FileWatchConfigProvider::new(
            path.clone(),
            CONFIG_POLL_INTERVAL,
        )),
        None => Arc::new(StaticConfigProvider::new(static_snapshot(&env))),
    };

    let initial_snapshot = config_provider.initial().await?;

    let manager = Arc::new(ProbeManager::new(
        process,
        backend,
        scratch,
        handler.clone(),
        config_provider,
        offset_index,
    ));

    manager.load(&initial_snapshot).await?;

    let snapshot_manager = manager.clone();
    let shutdown_task = tokio::spawn(signal::wait_for_shutdown(manager.clone()));

    manager.run().await?;
    if let Err(err) = shutdown_task.await? {
        log::warn!("signal handler failed: {err}");
    }

    if let Err(err) = handler.shutdown() {
        log::warn!("failed to shut down OTLP exporter cleanly: {err}");
    }

    let final_index = snapshot_manager.offset_index_snapshot().await;
    if let Err(err) = final_index.save_to_file(&cli.offset_index) {
        log::warn!(
            "failed to persist offset index to {}: {err}",
            cli.offset_index.display()
        );
    }

    Ok(())
}

fn resolve_target_pid(cli: &args::Cli, env: &EnvConfig) -> anyhow::Result<ProcessId> {
    if let Some(pid) = cli.pid {
        return Ok(ProcessId::validate(pid)?);
    }
    Ok(target::find_target_pid(&env.target_exe)?)
}

fn static_snapshot(env: &EnvConfig) -> ConfigSnapshot {
    ConfigSnapshot::new(false, env.sampler)
}

fn build_resource(env: &EnvConfig) -> Resource {
    let mut attributes = vec![opentelemetry::KeyValue::new(
        SERVICE_NAME,
        env.service_name
            .clone()
            .unwrap_or_else(|| "unknown_service".to_string()),
    )];
    for (key, value) in &env.resource_attributes {
        attributes.push(opentelemetry::KeyValue::new(key.clone(), value.clone()));
    }
    Resource::new(attributes)
}
