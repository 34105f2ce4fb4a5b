// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! The decoded span shape produced by the Event Decoder (spec.md §4.5) and
//! consumed by the Trace Assembler / Pipeline Handler.

use agent_api::SpanKind;

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Double(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub key: String,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn str(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: AttributeValue::Str(value.into()),
        }
    }

    pub fn int(key: impl Into<String>, value: i64) -> Self {
        Self {
            key: key.into(),
            value: AttributeValue::Int(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusCode {
    #[default]
    Unset,
    Ok,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpanLink {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpanTimedEvent {
    pub name: String,
    pub time_unix_nano: u64,
    pub attributes: Vec<Attribute>,
}

/// A decoded kernel span record, monotonic-clock timestamps as emitted by
/// the probe; the decoder is responsible for any conversion the exporter
/// contract requires (spec.md §3, "Span Event").
#[derive(Debug, Clone, PartialEq)]
pub struct SpanEvent {
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub parent_span_id: Option<[u8; 8]>,
    pub trace_flags: u8,
    pub name: String,
    pub kind: SpanKind,
    pub attributes: Vec<Attribute>,
    pub links: Vec<SpanLink>,
    pub events: Vec<SpanTimedEvent>,
    pub status: Status,
}
