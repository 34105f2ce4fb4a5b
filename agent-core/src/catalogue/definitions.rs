// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Concrete catalogue membership (spec.md §1, §4.3): HTTP, gRPC, SQL, and
//! Kafka client/server probes, plus the in-target Tracer API probe used
//! when the target calls the OpenTelemetry SDK directly.

use crate::errors::RuntimeError;
use crate::pipeline::{InstrumentationScope, ScopeSpans};
use crate::span::{Attribute, AttributeValue, SpanEvent, Status, StatusCode};

use super::{
    ConstValue, FailureMode, KernelProgramSpec, ProbeConst, ProbeDecoder, ProbeDefinition,
    ProbeId, ProbeRegistration, ProbeScope, SpanKind, UprobeDescriptor, VersionConstraint,
};

const AGENT_VERSION: &str = env!("AGENT_BUILD_INFO");
const SCHEMA_URL: &str = "https://opentelemetry.io/schemas/1.24.0";

/// Shared wire layout every kernel-side probe record uses: a fixed header
/// (ids, timestamps, flags, status) followed by a TLV attribute list.
/// Per-probe decoders differ only in the `name`/`kind` they stamp on the
/// result and in which probe-specific attributes they add beyond the
/// common set.
fn decode_common_record(
    bytes: &[u8],
    name: &str,
    kind: SpanKind,
) -> Result<SpanEvent, RuntimeError> {
    const HEADER_LEN: usize = 52;
    if bytes.len() < HEADER_LEN {
        return Err(RuntimeError::DecodeFailed(format!(
            "record too short: {} bytes, need at least {HEADER_LEN}",
            bytes.len()
        )));
    }

    let trace_id: [u8; 16] = bytes[0..16].try_into().unwrap();
    let span_id: [u8; 8] = bytes[16..24].try_into().unwrap();
    let parent_raw: [u8; 8] = bytes[24..32].try_into().unwrap();
    let parent_span_id = if parent_raw == [0u8; 8] {
        None
    } else {
        Some(parent_raw)
    };
    let start_time_unix_nano = u64::from_le_bytes(bytes[32..40].try_into().unwrap());
    let end_time_unix_nano = u64::from_le_bytes(bytes[40..48].try_into().unwrap());
    let trace_flags = bytes[48];
    let status_code = match bytes[49] {
        0 => StatusCode::Unset,
        1 => StatusCode::Ok,
        _ => StatusCode::Error,
    };
    let attr_count = u16::from_le_bytes(bytes[50..52].try_into().unwrap());

    let attributes = decode_attributes(&bytes[HEADER_LEN..], attr_count)?;

    Ok(SpanEvent {
        start_time_unix_nano,
        end_time_unix_nano,
        trace_id,
        span_id,
        parent_span_id,
        trace_flags,
        name: name.to_string(),
        kind,
        attributes,
        links: Vec::new(),
        events: Vec::new(),
        status: Status {
            code: status_code,
            message: String::new(),
        },
    })
}

fn decode_attributes(mut bytes: &[u8], count: u16) -> Result<Vec<Attribute>, RuntimeError> {
    let mut attributes = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let (key, rest) = decode_tlv_string(bytes)?;
        bytes = rest;

        let Some((&tag, rest)) = bytes.split_first() else {
            return Err(RuntimeError::DecodeFailed("truncated attribute tag".into()));
        };
        bytes = rest;

        let (value, rest) = match tag {
            0 => {
                let (s, rest) = decode_tlv_string(bytes)?;
                (AttributeValue::Str(s), rest)
            }
            1 => {
                let (n, rest) = take_i64(bytes)?;
                (AttributeValue::Int(n), rest)
            }
            2 => {
                let Some((&b, rest)) = bytes.split_first() else {
                    return Err(RuntimeError::DecodeFailed("truncated bool attribute".into()));
                };
                (AttributeValue::Bool(b != 0), rest)
            }
            3 => {
                let (n, rest) = take_i64(bytes)?;
                (AttributeValue::Double(f64::from_bits(n as u64)), rest)
            }
            other => {
                return Err(RuntimeError::DecodeFailed(format!(
                    "unknown attribute tag {other}"
                )))
            }
        };
        bytes = rest;
        attributes.push(Attribute { key, value });
    }

    Ok(attributes)
}

fn decode_tlv_string(bytes: &[u8]) -> Result<(String, &[u8]), RuntimeError> {
    if bytes.len() < 2 {
        return Err(RuntimeError::DecodeFailed("truncated string length".into()));
    }
    let len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
    let rest = &bytes[2..];
    if rest.len() < len {
        return Err(RuntimeError::DecodeFailed("truncated string body".into()));
    }
    let s = String::from_utf8(rest[..len].to_vec())
        .map_err(|e| RuntimeError::DecodeFailed(e.to_string()))?;
    Ok((s, &rest[len..]))
}

fn take_i64(bytes: &[u8]) -> Result<(i64, &[u8]), RuntimeError> {
    if bytes.len() < 8 {
        return Err(RuntimeError::DecodeFailed("truncated 8-byte value".into()));
    }
    let n = i64::from_le_bytes(bytes[..8].try_into().unwrap());
    Ok((n, &bytes[8..]))
}

fn http_method_const(inject_key: &'static str) -> ProbeConst {
    ProbeConst::StructField {
        id: crate::offsets::StructFieldId::new("net/http", "net/http", "Request", "Method"),
        constraint: VersionConstraint::None,
        inject_key,
    }
}

// --- HTTP server ------------------------------------------------------

fn http_server_decode(bytes: &[u8]) -> Result<SpanEvent, RuntimeError> {
    decode_common_record(bytes, "net/http.(*conn).serve", SpanKind::Server)
}

fn http_server() -> ProbeDefinition {
    ProbeDefinition {
        id: ProbeId::new("net/http", SpanKind::Server),
        program_spec: || KernelProgramSpec {
            object_name: "http_server",
        },
        consts: vec![http_method_const("method_offset")],
        uprobes: vec![UprobeDescriptor {
            symbol: "net/http.(*conn).serve",
            entry_program: "http_server_entry",
            return_program: Some("http_server_return"),
            dependencies: Vec::new(),
            version_constraints: vec![VersionConstraint::None],
            failure_mode: FailureMode::Warn,
        }],
        decoder: ProbeDecoder::SpanProducer(http_server_decode),
        scope: ProbeScope {
            name: "net/http",
            agent_version: AGENT_VERSION,
            schema_url: SCHEMA_URL,
            kind: SpanKind::Server,
        },
    }
}

// --- HTTP client ------------------------------------------------------

fn http_client_decode(bytes: &[u8]) -> Result<SpanEvent, RuntimeError> {
    decode_common_record(bytes, "net/http.(*Client).do", SpanKind::Client)
}

fn http_client() -> ProbeDefinition {
    ProbeDefinition {
        id: ProbeId::new("net/http", SpanKind::Client),
        program_spec: || KernelProgramSpec {
            object_name: "http_client",
        },
        consts: vec![http_method_const("method_offset")],
        uprobes: vec![UprobeDescriptor {
            symbol: "net/http.(*Client).do",
            entry_program: "http_client_entry",
            return_program: Some("http_client_return"),
            dependencies: Vec::new(),
            version_constraints: vec![VersionConstraint::None],
            failure_mode: FailureMode::Warn,
        }],
        decoder: ProbeDecoder::SpanProducer(http_client_decode),
        scope: ProbeScope {
            name: "net/http",
            agent_version: AGENT_VERSION,
            schema_url: SCHEMA_URL,
            kind: SpanKind::Client,
        },
    }
}

// --- gRPC server --------------------------------------------------------

fn grpc_server_decode(bytes: &[u8]) -> Result<SpanEvent, RuntimeError> {
    decode_common_record(
        bytes,
        "google.golang.org/grpc.(*Server).processUnaryRPC",
        SpanKind::Server,
    )
}

fn grpc_server() -> ProbeDefinition {
    ProbeDefinition {
        id: ProbeId::new("google.golang.org/grpc", SpanKind::Server),
        program_spec: || KernelProgramSpec {
            object_name: "grpc_server",
        },
        consts: vec![ProbeConst::Opaque {
            inject_key: "max_method_name_len",
            value: ConstValue::U64(256),
        }],
        uprobes: vec![UprobeDescriptor {
            symbol: "google.golang.org/grpc.(*Server).processUnaryRPC",
            entry_program: "grpc_server_entry",
            return_program: Some("grpc_server_return"),
            dependencies: Vec::new(),
            version_constraints: vec![VersionConstraint::None],
            failure_mode: FailureMode::Warn,
        }],
        decoder: ProbeDecoder::SpanProducer(grpc_server_decode),
        scope: ProbeScope {
            name: "google.golang.org/grpc",
            agent_version: AGENT_VERSION,
            schema_url: SCHEMA_URL,
            kind: SpanKind::Server,
        },
    }
}

// --- gRPC client --------------------------------------------------------

fn grpc_client_decode(bytes: &[u8]) -> Result<SpanEvent, RuntimeError> {
    decode_common_record(
        bytes,
        "google.golang.org/grpc.(*ClientConn).Invoke",
        SpanKind::Client,
    )
}

fn grpc_client() -> ProbeDefinition {
    ProbeDefinition {
        id: ProbeId::new("google.golang.org/grpc", SpanKind::Client),
        program_spec: || KernelProgramSpec {
            object_name: "grpc_client",
        },
        consts: vec![ProbeConst::Opaque {
            inject_key: "max_method_name_len",
            value: ConstValue::U64(256),
        }],
        uprobes: vec![UprobeDescriptor {
            symbol: "google.golang.org/grpc.(*ClientConn).Invoke",
            entry_program: "grpc_client_entry",
            return_program: Some("grpc_client_return"),
            dependencies: Vec::new(),
            version_constraints: vec![VersionConstraint::None],
            failure_mode: FailureMode::Warn,
        }],
        decoder: ProbeDecoder::SpanProducer(grpc_client_decode),
        scope: ProbeScope {
            name: "google.golang.org/grpc",
            agent_version: AGENT_VERSION,
            schema_url: SCHEMA_URL,
            kind: SpanKind::Client,
        },
    }
}

// --- SQL driver -----------------------------------------------------

fn sql_client_decode(bytes: &[u8]) -> Result<SpanEvent, RuntimeError> {
    decode_common_record(bytes, "database/sql.(*DB).QueryContext", SpanKind::Client)
}

fn sql_client() -> ProbeDefinition {
    ProbeDefinition {
        id: ProbeId::new("database/sql", SpanKind::Client),
        program_spec: || KernelProgramSpec {
            object_name: "sql_client",
        },
        consts: vec![ProbeConst::Allocation {
            inject_key: "query_scratch",
            size_hint_bytes: 4096,
        }],
        uprobes: vec![
            UprobeDescriptor {
                symbol: "database/sql.(*DB).queryDC",
                entry_program: "sql_client_entry",
                return_program: Some("sql_client_return"),
                dependencies: Vec::new(),
                version_constraints: vec![VersionConstraint::None],
                failure_mode: FailureMode::Warn,
            },
            UprobeDescriptor {
                symbol: "database/sql.(*DB).execDC",
                entry_program: "sql_client_exec_entry",
                return_program: Some("sql_client_exec_return"),
                dependencies: Vec::new(),
                version_constraints: vec![VersionConstraint::None],
                failure_mode: FailureMode::Ignore,
            },
        ],
        decoder: ProbeDecoder::SpanProducer(sql_client_decode),
        scope: ProbeScope {
            name: "database/sql",
            agent_version: AGENT_VERSION,
            schema_url: SCHEMA_URL,
            kind: SpanKind::Client,
        },
    }
}

// --- Kafka producer -------------------------------------------------

fn kafka_producer_decode(bytes: &[u8]) -> Result<SpanEvent, RuntimeError> {
    decode_common_record(
        bytes,
        "github.com/segmentio/kafka-go.(*Writer).WriteMessages",
        SpanKind::Producer,
    )
}

fn kafka_producer() -> ProbeDefinition {
    ProbeDefinition {
        id: ProbeId::new("github.com/segmentio/kafka-go", SpanKind::Producer),
        program_spec: || KernelProgramSpec {
            object_name: "kafka_producer",
        },
        consts: Vec::new(),
        uprobes: vec![UprobeDescriptor {
            symbol: "github.com/segmentio/kafka-go.(*Writer).WriteMessages",
            entry_program: "kafka_producer_entry",
            return_program: Some("kafka_producer_return"),
            dependencies: Vec::new(),
            version_constraints: vec![VersionConstraint::None],
            failure_mode: FailureMode::Warn,
        }],
        decoder: ProbeDecoder::SpanProducer(kafka_producer_decode),
        scope: ProbeScope {
            name: "github.com/segmentio/kafka-go",
            agent_version: AGENT_VERSION,
            schema_url: SCHEMA_URL,
            kind: SpanKind::Producer,
        },
    }
}

// --- Kafka consumer -------------------------------------------------

fn kafka_consumer_decode(bytes: &[u8]) -> Result<SpanEvent, RuntimeError> {
    decode_common_record(
        bytes,
        "github.com/segmentio/kafka-go.(*Reader).FetchMessage",
        SpanKind::Consumer,
    )
}

fn kafka_consumer() -> ProbeDefinition {
    ProbeDefinition {
        id: ProbeId::new("github.com/segmentio/kafka-go", SpanKind::Consumer),
        program_spec: || KernelProgramSpec {
            object_name: "kafka_consumer",
        },
        consts: Vec::new(),
        uprobes: vec![UprobeDescriptor {
            symbol: "github.com/segmentio/kafka-go.(*Reader).FetchMessage",
            entry_program: "kafka_consumer_entry",
            return_program: Some("kafka_consumer_return"),
            dependencies: Vec::new(),
            version_constraints: vec![VersionConstraint::None],
            failure_mode: FailureMode::Warn,
        }],
        decoder: ProbeDecoder::SpanProducer(kafka_consumer_decode),
        scope: ProbeScope {
            name: "github.com/segmentio/kafka-go",
            agent_version: AGENT_VERSION,
            schema_url: SCHEMA_URL,
            kind: SpanKind::Consumer,
        },
    }
}

// --- Tracer API (in-target SDK calls) --------------------------------

/// The Tracer API probe's record carries its own instrumentation scope
/// name ahead of the common span record, since it mirrors whatever tracer
/// the target application itself asked its SDK for rather than a scope the
/// catalogue can fix in advance.
fn tracer_api_decode(bytes: &[u8]) -> Result<ScopeSpans, RuntimeError> {
    let (scope_name, rest) = decode_tlv_string(bytes)?;
    let span = decode_common_record(
        rest,
        "go.opentelemetry.io/auto/sdk.(*Span).End",
        SpanKind::Internal,
    )?;
    Ok(ScopeSpans {
        scope: InstrumentationScope {
            name: scope_name,
            agent_version: AGENT_VERSION.to_string(),
            schema_url: SCHEMA_URL.to_string(),
            kind: SpanKind::Internal,
        },
        spans: vec![span],
    })
}

fn tracer_api() -> ProbeDefinition {
    ProbeDefinition {
        id: ProbeId::new("go.opentelemetry.io/auto/sdk", SpanKind::Internal),
        program_spec: || KernelProgramSpec {
            object_name: "tracer_api",
        },
        consts: Vec::new(),
        uprobes: vec![UprobeDescriptor {
            symbol: "go.opentelemetry.io/auto/sdk.(*Span).End",
            entry_program: "tracer_api_entry",
            return_program: None,
            dependencies: Vec::new(),
            version_constraints: vec![VersionConstraint::None],
            failure_mode: FailureMode::Error,
        }],
        decoder: ProbeDecoder::TraceProducer(tracer_api_decode),
        scope: ProbeScope {
            name: "go.opentelemetry.io/auto/sdk",
            agent_version: AGENT_VERSION,
            schema_url: SCHEMA_URL,
            kind: SpanKind::Internal,
        },
    }
}

inventory::submit! { ProbeRegistration(http_server) }
inventory::submit! { ProbeRegistration(http_client) }
inventory::submit! { ProbeRegistration(grpc_server) }
inventory::submit! { ProbeRegistration(grpc_client) }
inventory::submit! { ProbeRegistration(sql_client) }
inventory::submit! { ProbeRegistration(kafka_producer) }
inventory::submit! { ProbeRegistration(kafka_consumer) }
inventory::submit! { ProbeRegistration(tracer_api) }

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_header(trace_flags: u8, status: u8) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0xAB; 16]); // trace_id
        bytes.extend_from_slice(&[0xCD; 8]); // span_id
        bytes.extend_from_slice(&[0u8; 8]); // parent_span_id (none)
        bytes.extend_from_slice(&1_000_000u64.to_le_bytes());
        bytes.extend_from_slice(&2_000_000u64.to_le_bytes());
        bytes.push(trace_flags);
        bytes.push(status);
        bytes.extend_from_slice(&0u16.to_le_bytes()); // attr_count = 0
        bytes
    }

    #[test]
    fn decodes_common_record_with_no_attributes() {
        let bytes = encode_header(1, 1);
        let span = http_server_decode(&bytes).unwrap();
        assert_eq!(span.kind, SpanKind::Server);
        assert_eq!(span.parent_span_id, None);
        assert_eq!(span.status.code, StatusCode::Ok);
    }

    #[test]
    fn decodes_string_attribute() {
        let mut bytes = encode_header(1, 0);
        let attr_count_pos = bytes.len() - 2;
        bytes[attr_count_pos..].copy_from_slice(&1u16.to_le_bytes());
        let key = b"http.method";
        bytes.extend_from_slice(&(key.len() as u16).to_le_bytes());
        bytes.extend_from_slice(key);
        bytes.push(0); // tag = string
        bytes.extend_from_slice(&3u16.to_le_bytes());
        bytes.extend_from_slice(b"GET");

        let span = http_client_decode(&bytes).unwrap();
        assert_eq!(span.attributes.len(), 1);
        assert_eq!(span.attributes[0].key, "http.method");
        assert_eq!(
            span.attributes[0].value,
            AttributeValue::Str("GET".to_string())
        );
    }

    #[test]
    fn tracer_api_decode_produces_its_own_scope() {
        let mut bytes = Vec::new();
        let scope_name = b"github.com/acme/checkout";
        bytes.extend_from_slice(&(scope_name.len() as u16).to_le_bytes());
        bytes.extend_from_slice(scope_name);
        bytes.extend_from_slice(&encode_header(1, 1));

        let scope_spans = tracer_api_decode(&bytes).unwrap();
        assert_eq!(scope_spans.scope.name, "github.com/acme/checkout");
        assert_eq!(scope_spans.spans.len(), 1);
    }

    #[test]
    fn rejects_truncated_record() {
        let bytes = vec![0u8; 10];
        assert!(http_server_decode(&bytes).is_err());
    }

    #[test]
    fn catalogue_has_no_duplicate_ids_and_valid_dependency_graphs() {
        let probes = super::super::load_catalogue().unwrap();
        assert!(probes.len() >= 8);
    }
}
