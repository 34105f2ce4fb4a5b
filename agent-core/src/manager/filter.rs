// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Probe filtering against the Binary Inspector's Function Record set
//! (spec.md §4.4, "Filtering").

use std::collections::HashSet;

use crate::catalogue::ProbeDefinition;
use crate::inspect::FunctionRecord;

/// Drops any probe for which *none* of its non-dependent uprobes' symbols
/// are present in `function_records`. A probe survives if at least one
/// non-dependent symbol is present, even when some of its other symbols
/// are missing — those are handled per their individual failure mode at
/// attach time.
pub fn filter_probes(
    probes: Vec<ProbeDefinition>,
    function_records: &[FunctionRecord],
) -> Vec<ProbeDefinition> {
    let present: HashSet<&str> = function_records.iter().map(|f| f.name.as_str()).collect();

    probes
        .into_iter()
        .filter(|probe| {
            probe
                .uprobes
                .iter()
                .filter(|u| !u.is_dependent(&probe.uprobes))
                .any(|u| present.contains(u.symbol))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{
        FailureMode, KernelProgramSpec, ProbeId, ProbeScope, SpanKind, UprobeDescriptor,
        VersionConstraint,
    };
    use crate::errors::RuntimeError;
    use crate::span::SpanEvent;

    fn probe(package: &'static str, symbols: Vec<(&'static str, Vec<&'static str>)>) -> ProbeDefinition {
        ProbeDefinition {
            id: ProbeId::new(package, SpanKind::Server),
            program_spec: || KernelProgramSpec { object_name: "x" },
            consts: Vec::new(),
            uprobes: symbols
                .into_iter()
                .map(|(symbol, dependencies)| UprobeDescriptor {
                    symbol,
                    entry_program: "entry",
                    return_program: None,
                    dependencies,
                    version_constraints: vec![VersionConstraint::None],
                    failure_mode: FailureMode::Warn,
                })
                .collect(),
            decoder: crate::catalogue::ProbeDecoder::SpanProducer(|_: &[u8]| -> Result<SpanEvent, RuntimeError> {
                Err(RuntimeError::DecodeFailed("test".into()))
            }),
            scope: ProbeScope {
                name: package,
                agent_version: "0.1.0",
                schema_url: "https://opentelemetry.io/schemas/1.24.0",
                kind: SpanKind::Server,
            },
        }
    }

    fn record(name: &str) -> FunctionRecord {
        FunctionRecord {
            name: name.to_string(),
            entry_offset: 0,
            return_offsets: Vec::new(),
        }
    }

    #[test]
    fn keeps_probe_with_present_non_dependent_symbol() {
        let probes = vec![probe("net/http", vec![("a", vec![]), ("b", vec!["a"])])];
        let records = vec![record("a")];
        assert_eq!(filter_probes(probes, &records).len(), 1);
    }

    #[test]
    fn drops_probe_missing_all_non_dependent_symbols() {
        let probes = vec![probe("net/http", vec![("a", vec![]), ("b", vec!["a"])])];
        let records = vec![record("c")];
        assert_eq!(filter_probes(probes, &records).len(), 0);
    }

    #[test]
    fn keeps_probe_when_only_dependent_symbol_present_but_host_survives() {
        // "b" depends on "a"; if "a" (non-dependent) is present the probe
        // survives even though "b" itself is absent.
        let probes = vec![probe("net/http", vec![("a", vec![]), ("b", vec!["a"])])];
        let records = vec![record("a")];
        let kept = filter_probes(probes, &records);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].uprobes.len(), 2);
    }
}
