// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Core of the zero-code eBPF auto-instrumentation agent: binary analysis,
//! offset resolution, probe lifecycle management, and the dynamic
//! configuration control loop. The host process (`agent-cli`) supplies the
//! `aya`, ptrace, and OTLP-exporter collaborators this crate only defines
//! traits for.

pub mod catalogue;
pub mod config_provider;
pub mod errors;
pub mod inspect;
pub mod manager;
pub mod offsets;
pub mod pipeline;
pub mod process;
pub mod scratch;
pub mod span;

pub use config_provider::ConfigurationProvider;
pub use errors::AgentError;
pub use manager::{EbpfBackend, ProbeManager};
pub use process::{ProcessId, ProcessInfo};
