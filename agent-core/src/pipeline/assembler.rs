// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! The Trace Assembler's output shape: a scope-tagged batch of spans
//! (spec.md §4.5). Conversion into wire OTLP types is an `agent-cli`
//! concern, keeping this crate free of a full protobuf dependency.

use agent_api::SpanKind;

use crate::span::SpanEvent;

#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentationScope {
    pub name: String,
    pub agent_version: String,
    pub schema_url: String,
    pub kind: SpanKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScopeSpans {
    pub scope: InstrumentationScope,
    pub spans: Vec<SpanEvent>,
}
