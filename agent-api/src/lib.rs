// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Shared types for the auto-instrumentation agent.
//!
//! This crate holds the identifiers and configuration shapes that cross the
//! boundary between the agent core and anything that drives it: probe and
//! library identifiers, the configuration snapshot the control loop reacts
//! to, and parsing of the `OTEL_*` environment variables the agent reads on
//! startup.

pub mod config;
pub mod util;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("{0} is not a valid span kind")]
    InvalidSpanKind(String),
    #[error("{0} is not a valid library identifier (expected \"package\" or \"package/kind\")")]
    InvalidLibraryId(String),
}

/// OpenTelemetry span kind, restricted to the kinds the catalogue's probes
/// produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Client,
    Server,
    Producer,
    Consumer,
    Internal,
}

impl fmt::Display for SpanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpanKind::Client => "client",
            SpanKind::Server => "server",
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
            SpanKind::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SpanKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "client" => SpanKind::Client,
            "server" => SpanKind::Server,
            "producer" => SpanKind::Producer,
            "consumer" => SpanKind::Consumer,
            "internal" => SpanKind::Internal,
            other => return Err(ParseError::InvalidSpanKind(other.to_string())),
        })
    }
}

/// Stable identity of a probe: the instrumented package plus the kind of
/// span it produces. Two probes on the same package with different kinds
/// (e.g. an HTTP client and an HTTP server) are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProbeId {
    pub package: String,
    pub kind: SpanKind,
}

impl ProbeId {
    pub fn new(package: impl Into<String>, kind: SpanKind) -> Self {
        Self {
            package: package.into(),
            kind,
        }
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.kind)
    }
}

/// Configuration key for a library. `kind: None` means "all span kinds of
/// this package"; an entry with an explicit kind takes precedence over one
/// without when both are present in the same snapshot (see
/// [`ProbeId::matches`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LibraryId {
    pub package: String,
    pub kind: Option<SpanKind>,
}

impl LibraryId {
    pub fn new(package: impl Into<String>, kind: Option<SpanKind>) -> Self {
        Self {
            package: package.into(),
            kind,
        }
    }

    pub fn all_kinds(package: impl Into<String>) -> Self {
        Self::new(package, None)
    }
}

impl ProbeId {
    /// The two library identifiers that could apply to this probe, most
    /// specific first: `(package, this kind)` then `(package, unspecified)`.
    pub fn candidate_library_ids(&self) -> [LibraryId; 2] {
        [
            LibraryId::new(self.package.clone(), Some(self.kind)),
            LibraryId::all_kinds(self.package.clone()),
        ]
    }
}

impl std::str::FromStr for LibraryId {
    type Err = ParseError;

    /// Package paths are themselves slash-separated (`net/http`,
    /// `google.golang.org/grpc`), so a trailing `/<kind>` is only treated as
    /// a span-kind suffix when it actually parses as one; otherwise the
    /// whole string is the package with an unspecified kind.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::InvalidLibraryId(s.to_string()));
        }
        if let Some((package, kind)) = s.rsplit_once('/') {
            if let Ok(kind) = kind.parse::<SpanKind>() {
                if !package.is_empty() {
                    return Ok(LibraryId::new(package, Some(kind)));
                }
            }
        }
        Ok(LibraryId::all_kinds(s))
    }
}

/// Per-library enable/disable override. `traces_enabled: None` defers to
/// the snapshot's default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LibraryConfig {
    pub traces_enabled: Option<bool>,
}

/// A single configuration snapshot, as produced by a
/// [`ConfigurationProvider`](../agent_core/trait.ConfigurationProvider.html)
/// (defined in `agent-core`, which depends on this crate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub library_configs: std::collections::HashMap<LibraryId, LibraryConfig>,
    pub default_traces_disabled: bool,
    pub sampling: config::Sampler,
}

impl ConfigSnapshot {
    /// Builds an empty snapshot with every library enabled unless
    /// `default_traces_disabled` is set.
    pub fn new(default_traces_disabled: bool, sampling: config::Sampler) -> Self {
        Self {
            library_configs: std::collections::HashMap::new(),
            default_traces_disabled,
            sampling,
        }
    }

    /// Resolves whether `probe` is enabled under this snapshot, following
    /// the precedence rule in spec.md §4.4: an exact-kind entry wins over an
    /// unspecified-kind entry, which wins over the snapshot default.
    pub fn is_enabled(&self, probe: &ProbeId) -> bool {
        for candidate in probe.candidate_library_ids() {
            if let Some(cfg) = self.library_configs.get(&candidate) {
                if let Some(enabled) = cfg.traces_enabled {
                    return enabled;
                }
            }
        }
        !self.default_traces_disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_id_candidate_order_is_specific_first() {
        let probe = ProbeId::new("net/http", SpanKind::Server);
        let candidates = probe.candidate_library_ids();
        assert_eq!(candidates[0].kind, Some(SpanKind::Server));
        assert_eq!(candidates[1].kind, None);
    }

    #[test]
    fn config_precedence_exact_kind_wins() {
        let mut snap = ConfigSnapshot::new(false, config::Sampler::AlwaysOn);
        snap.library_configs.insert(
            LibraryId::new("net/http", Some(SpanKind::Server)),
            LibraryConfig {
                traces_enabled: Some(false),
            },
        );
        snap.library_configs.insert(
            LibraryId::all_kinds("net/http"),
            LibraryConfig {
                traces_enabled: Some(true),
            },
        );
        assert!(!snap.is_enabled(&ProbeId::new("net/http", SpanKind::Server)));
    }

    #[test]
    fn config_precedence_unspecified_only() {
        let mut snap = ConfigSnapshot::new(false, config::Sampler::AlwaysOn);
        snap.library_configs.insert(
            LibraryId::all_kinds("net/http"),
            LibraryConfig {
                traces_enabled: Some(false),
            },
        );
        assert!(!snap.is_enabled(&ProbeId::new("net/http", SpanKind::Server)));
    }

    #[test]
    fn config_precedence_empty_defaults_enabled() {
        let snap = ConfigSnapshot::new(false, config::Sampler::AlwaysOn);
        assert!(snap.is_enabled(&ProbeId::new("net/http", SpanKind::Server)));
    }

    #[test]
    fn library_id_parses_with_and_without_kind() {
        let all: LibraryId = "net/http".parse().unwrap();
        assert_eq!(all.kind, None);
        assert_eq!(all.package, "net/http");
    }
}
