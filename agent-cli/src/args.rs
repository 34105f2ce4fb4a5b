// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Command-line surface for `agent-cli` (spec.md §6). Most runtime settings
//! come from the `OTEL_*` environment variables per spec.md and are parsed
//! by [`agent_api::config::EnvConfig`]; the flags here cover what the
//! environment variable contract does not: where to find the process to
//! attach to, and how to reach the local collector.

use std::path::PathBuf;

use agent_api::util::directories::{DEFAULT_OFFSET_INDEX_PATH, DEFAULT_PROBE_OBJECT_DIR};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Process id to attach to. Mutually exclusive with letting
    /// OTEL_GO_AUTO_TARGET_EXE pick a running process by binary path; if
    /// both are absent the agent exits with a configuration error.
    #[arg(long)]
    pub pid: Option<u32>,

    /// Optional TOML configuration snapshot, polled for live updates
    /// (spec.md §4.7). Unset means a single static snapshot built from the
    /// environment, enabled by default.
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Persisted struct-field offset index document (spec.md §4.2).
    #[arg(long, default_value = DEFAULT_OFFSET_INDEX_PATH)]
    pub offset_index: PathBuf,

    /// Directory of compiled probe kernel objects, one `<object_name>.o`
    /// file per catalogue entry.
    #[arg(long, default_value = DEFAULT_PROBE_OBJECT_DIR)]
    pub probe_object_dir: PathBuf,

    /// OTLP/gRPC collector endpoint. Defaults to the standard local
    /// collector address when neither this nor OTEL_EXPORTER_OTLP_ENDPOINT
    /// is set.
    #[arg(long)]
    pub otlp_endpoint: Option<String>,
}
