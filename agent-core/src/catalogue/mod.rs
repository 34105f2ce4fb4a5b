// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Probe Catalogue (spec.md §4.3): declares what to instrument. New probes
//! are added by writing a constructor and an `inventory::submit!` call —
//! additive registration, mirroring how kernel programs are statically
//! registered elsewhere in the ecosystem.

pub mod definitions;

use crate::errors::AttachError;
use crate::inspect::Version;
use crate::offsets::StructFieldId;
use crate::span::SpanEvent;

pub use agent_api::{LibraryId, ProbeId, SpanKind};

/// Opaque handle to the compiled kernel program object a probe attaches
/// from. Loading the actual bytecode is a collaborator's job; the
/// catalogue only names which object and which programs within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelProgramSpec {
    pub object_name: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    None,
    AtLeast(String),
    LessThan(String),
}

impl VersionConstraint {
    /// Evaluates the constraint against a resolved module version.
    /// `Ok(false)` means the constraint was evaluated and excludes the
    /// version (a silent drop, not an error, per spec.md §4.2 "Version-
    /// constrained constants"); `Err` means the version was unknown and
    /// the constraint cannot be evaluated.
    pub fn evaluate(&self, version: Option<&Version>) -> Result<bool, ()> {
        match (self, version) {
            (VersionConstraint::None, _) => Ok(true),
            (_, None) => Err(()),
            (VersionConstraint::AtLeast(bound), Some(v)) => {
                Ok(compare_dotted(v.as_str(), bound).is_ge())
            }
            (VersionConstraint::LessThan(bound), Some(v)) => {
                Ok(compare_dotted(v.as_str(), bound).is_lt())
            }
        }
    }
}

/// Compares two `v`-optional, dot-separated version strings numerically
/// component by component (so `"1.9.0" < "1.10.0"`), falling back to a
/// lexicographic comparison of any non-numeric component. A pre-release or
/// build-metadata suffix (`-`/`+`) on a component is dropped before
/// comparing.
fn compare_dotted(a: &str, b: &str) -> std::cmp::Ordering {
    let strip = |s: &str| -> Vec<String> {
        s.trim_start_matches('v')
            .split('.')
            .map(|part| {
                part.split(['-', '+'])
                    .next()
                    .unwrap_or(part)
                    .to_string()
            })
            .collect()
    };
    let (pa, pb) = (strip(a), strip(b));
    for i in 0..pa.len().max(pb.len()) {
        let ca = pa.get(i).map(String::as_str).unwrap_or("0");
        let cb = pb.get(i).map(String::as_str).unwrap_or("0");
        let ordering = match (ca.parse::<u64>(), cb.parse::<u64>()) {
            (Ok(na), Ok(nb)) => na.cmp(&nb),
            _ => ca.cmp(cb),
        };
        if ordering != std::cmp::Ordering::Equal {
            return ordering;
        }
    }
    std::cmp::Ordering::Equal
}

#[derive(Debug, Clone)]
pub enum ConstValue {
    U64(u64),
    Bytes(Vec<u8>),
}

/// One entry of a probe's `consts[]` list (spec.md §4.3).
#[derive(Debug, Clone)]
pub enum ProbeConst {
    StructField {
        id: StructFieldId,
        constraint: VersionConstraint,
        inject_key: &'static str,
    },
    Allocation {
        inject_key: &'static str,
        size_hint_bytes: u64,
    },
    Opaque {
        inject_key: &'static str,
        value: ConstValue,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    Ignore,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct UprobeDescriptor {
    pub symbol: &'static str,
    pub entry_program: &'static str,
    pub return_program: Option<&'static str>,
    pub dependencies: Vec<&'static str>,
    pub version_constraints: Vec<VersionConstraint>,
    pub failure_mode: FailureMode,
}

impl UprobeDescriptor {
    /// A uprobe is a dependency of others but declares none itself: it is
    /// only attached as a side effect of one of its dependents surviving
    /// filtering (spec.md §4.4, "Filtering").
    pub fn is_dependent(&self, all: &[UprobeDescriptor]) -> bool {
        all.iter().any(|u| u.dependencies.contains(&self.symbol))
    }
}

#[derive(Debug, Clone)]
pub struct ProbeScope {
    pub name: &'static str,
    pub agent_version: &'static str,
    pub schema_url: &'static str,
    pub kind: SpanKind,
}

pub type EventDecoder = fn(&[u8]) -> Result<SpanEvent, crate::errors::RuntimeError>;

pub type TraceDecoder = fn(&[u8]) -> Result<crate::pipeline::ScopeSpans, crate::errors::RuntimeError>;

/// The two handler shapes a probe's kernel records can decode into
/// (spec.md §4.5): most probes only ever know about a single span and rely
/// on the probe's static [`ProbeScope`] to tag it; a few (the Tracer API
/// probe, which mirrors whatever instrumentation scope the target's own SDK
/// calls declared) produce the full scope/spans batch themselves.
#[derive(Clone, Copy)]
pub enum ProbeDecoder {
    SpanProducer(EventDecoder),
    TraceProducer(TraceDecoder),
}

#[derive(Clone)]
pub struct ProbeDefinition {
    pub id: ProbeId,
    pub program_spec: fn() -> KernelProgramSpec,
    pub consts: Vec<ProbeConst>,
    pub uprobes: Vec<UprobeDescriptor>,
    pub decoder: ProbeDecoder,
    pub scope: ProbeScope,
}

impl ProbeDefinition {
    /// Validates that every uprobe's declared dependencies name another
    /// uprobe in the *same* probe (spec.md §4.3, "Dependency list
    /// semantics"): a violation is fatal at registration time.
    pub fn validate_dependency_graph(&self) -> Result<(), AttachError> {
        let known: Vec<&str> = self.uprobes.iter().map(|u| u.symbol).collect();
        for uprobe in &self.uprobes {
            for dependency in &uprobe.dependencies {
                if !known.contains(dependency) {
                    return Err(AttachError::UnknownDependency {
                        symbol: uprobe.symbol.to_string(),
                        dependency: dependency.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// The registration point new catalogue entries hook into via
/// `inventory::submit!`.
pub struct ProbeRegistration(pub fn() -> ProbeDefinition);

inventory::collect!(ProbeRegistration);

/// Every uprobe symbol named anywhere in `probes`, the set the Binary
/// Inspector scans the target for before the Probe Manager can filter
/// anything (spec.md §4.1, "given the symbol names the catalogue cares
/// about").
pub fn interesting_symbols(probes: &[ProbeDefinition]) -> std::collections::HashSet<String> {
    probes
        .iter()
        .flat_map(|probe| probe.uprobes.iter().map(|u| u.symbol.to_string()))
        .collect()
}

/// Builds the full catalogue from every registered probe, rejecting
/// duplicate identifiers and invalid dependency graphs (both fatal per
/// spec.md §4.3/§4.4).
pub fn load_catalogue() -> Result<Vec<ProbeDefinition>, AttachError> {
    let mut probes = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for registration in inventory::iter::<ProbeRegistration> {
        let probe = (registration.0)();
        if !seen.insert(probe.id.clone()) {
            return Err(AttachError::DuplicateProbeId(probe.id));
        }
        probe.validate_dependency_graph()?;
        probes.push(probe);
    }

    Ok(probes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_probe(dependencies: Vec<&'static str>) -> ProbeDefinition {
        ProbeDefinition {
            id: ProbeId::new("net/http", SpanKind::Server),
            program_spec: || KernelProgramSpec {
                object_name: "http_server",
            },
            consts: Vec::new(),
            uprobes: vec![
                UprobeDescriptor {
                    symbol: "net/http.(*conn).serve".into(),
                    entry_program: "http_server_entry",
                    return_program: Some("http_server_return"),
                    dependencies: dependencies.clone(),
                    version_constraints: vec![VersionConstraint::None],
                    failure_mode: FailureMode::Warn,
                },
                UprobeDescriptor {
                    symbol: "net/http.readRequest".into(),
                    entry_program: "http_server_helper",
                    return_program: None,
                    dependencies: Vec::new(),
                    version_constraints: vec![VersionConstraint::None],
                    failure_mode: FailureMode::Ignore,
                },
            ],
            decoder: ProbeDecoder::SpanProducer(|_bytes| {
                Err(crate::errors::RuntimeError::DecodeFailed(
                    "unimplemented in test fixture".to_string(),
                ))
            }),
            scope: ProbeScope {
                name: "net/http",
                agent_version: "0.1.0",
                schema_url: "https://opentelemetry.io/schemas/1.24.0",
                kind: SpanKind::Server,
            },
        }
    }

    #[test]
    fn dependency_graph_accepts_intra_probe_reference() {
        let probe = sample_probe(vec!["net/http.readRequest"]);
        assert!(probe.validate_dependency_graph().is_ok());
    }

    #[test]
    fn dependency_graph_rejects_unknown_symbol() {
        let probe = sample_probe(vec!["net/http.missingHelper"]);
        let err = probe.validate_dependency_graph().unwrap_err();
        assert!(matches!(err, AttachError::UnknownDependency { .. }));
    }

    #[test]
    fn at_least_constraint_evaluates_present_version() {
        let constraint = VersionConstraint::AtLeast("1.5.0".to_string());
        assert_eq!(
            constraint.evaluate(Some(&Version::parse("1.6.0"))),
            Ok(true)
        );
        assert_eq!(
            constraint.evaluate(Some(&Version::parse("1.0.0"))),
            Ok(false)
        );
    }

    #[test]
    fn at_least_constraint_compares_numerically_not_lexically() {
        let constraint = VersionConstraint::AtLeast("1.10.0".to_string());
        assert_eq!(
            constraint.evaluate(Some(&Version::parse("1.9.0"))),
            Ok(false)
        );
        assert_eq!(
            constraint.evaluate(Some(&Version::parse("1.10.1"))),
            Ok(true)
        );
    }

    #[test]
    fn constraint_on_unknown_version_is_err() {
        let constraint = VersionConstraint::AtLeast("1.5.0".to_string());
        assert!(constraint.evaluate(None).is_err());
    }

    #[test]
    fn interesting_symbols_collects_every_uprobe_across_probes() {
        let probes = vec![sample_probe(vec!["net/http.readRequest"])];
        let symbols = interesting_symbols(&probes);
        assert_eq!(symbols.len(), 2);
        assert!(symbols.contains("net/http.(*conn).serve"));
        assert!(symbols.contains("net/http.readRequest"));
    }
}
