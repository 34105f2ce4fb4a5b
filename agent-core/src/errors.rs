// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! The taxonomy of errors the core surfaces, per spec.md §7.

use thiserror::Error;

use crate::catalogue::ProbeId;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Env(#[from] agent_api::config::ConfigError),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("process {0} does not exist")]
    NoSuchProcess(u32),
    #[error("process {0} is not running")]
    NotRunning(u32),
    #[error("{path}: {source}")]
    NotAnExecutable {
        path: String,
        #[source]
        source: object::read::Error,
    },
    #[error("no interesting functions were found in the target binary")]
    NoMatchingFunctions,
    #[error("target binary has no embedded build metadata")]
    MissingBuildInfo,
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("module version for {module} is unknown")]
    UnknownModuleVersion { module: String },
    #[error("no offset indexed or discoverable for {module}.{package}.{struct_name}.{field} at version {version}")]
    Miss {
        module: String,
        package: String,
        struct_name: String,
        field: String,
        version: String,
    },
    #[error("DWARF debug data not present in target binary")]
    NoDebugInfo,
    #[error(transparent)]
    Dwarf(#[from] gimli::Error),
    #[error("scratch allocation failed while resolving a probe constant: {0}")]
    Allocation(#[from] AttachError),
}

#[derive(Error, Debug)]
pub enum AttachError {
    #[error(transparent)]
    Program(#[from] aya::programs::ProgramError),
    #[error(transparent)]
    Load(#[from] aya::EbpfError),
    #[error("symbol {0} not found in target")]
    SymbolNotFound(String),
    #[error("kernel verifier rejected program: {0}")]
    Verifier(String),
    #[error("dependency {dependency} declared by uprobe on {symbol} is not part of the same probe")]
    UnknownDependency { symbol: String, dependency: String },
    #[error("probe {0} failed to attach and its failure mode is error")]
    Fatal(ProbeId),
    #[error("duplicate probe identifier {0} registered in the catalogue")]
    DuplicateProbeId(ProbeId),
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("ring buffer reader closed")]
    ReaderClosed,
    #[error("failed to read from ring buffer: {0}")]
    ReadFailed(String),
    #[error("{count} samples were lost")]
    LostSamples { count: u64 },
    #[error("failed to decode span event: {0}")]
    DecodeFailed(String),
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("run() was called before load()")]
    NotLoaded,
    #[error("stop() has already been called")]
    AlreadyStopped,
    #[error("load() was already called")]
    AlreadyLoaded,
}

/// Union of every error the core can surface to a caller, following the
/// same composition style as `bpfman::errors::BpfmanError`: one variant per
/// taxonomy member, `#[from]` wherever a single error cleanly maps to a
/// single cause.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Attach(#[from] AttachError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("{0}")]
    Other(String),
}

/// Sentinel distinguishing a normal `stop()` from a cancellation-triggered
/// shutdown, per spec.md §5 ("Cancellation & timeouts").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    Cancelled,
}
