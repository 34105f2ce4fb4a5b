// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! OTLP export: the [`PipelineHandler`] implementation that turns an
//! assembled [`ScopeSpans`] batch into spans on a real collector
//! connection (spec.md §4.5, "forwards to the configured OTLP exporter").
//!
//! Conversion goes through the public, version-stable `Tracer`/`SpanBuilder`
//! API rather than the SDK's internal export types: a `SpanBuilder` lets a
//! span be built with trace/span ids and timestamps taken verbatim from the
//! kernel-decoded [`SpanEvent`], which is exactly what replaying
//! already-completed spans needs.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use agent_core::pipeline::{InstrumentationScope, PipelineHandler, ScopeSpans};
use agent_core::span::{Attribute, AttributeValue, SpanEvent, Status as CoreStatus, StatusCode as CoreStatusCode};
use opentelemetry::trace::{
    Span, SpanBuilder, SpanContext, SpanId, SpanKind as OtelSpanKind, Status as OtelStatus,
    TraceContextExt, TraceFlags, TraceId, TraceState, Tracer, TracerProvider as _,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::{Config as TraceConfig, Tracer as SdkTracer, TracerProvider};
use opentelemetry_sdk::Resource;
use tokio::sync::Mutex;

/// Builds the batch-exporting [`TracerProvider`] this CLI hands spans to.
/// `endpoint` is the OTLP/gRPC collector address (spec.md §6,
/// `OTEL_EXPORTER_OTLP_ENDPOINT`); `resource` carries `service.name` and the
/// other resource attributes `EnvConfig` parsed from the environment.
pub fn build_tracer_provider(
    endpoint: &str,
    resource: Resource,
) -> Result<TracerProvider, opentelemetry::trace::TraceError> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(TraceConfig::default().with_resource(resource))
        .build())
}

/// Forwards assembled span batches to a real OTLP collector. One [`Tracer`]
/// is built per distinct [`InstrumentationScope`] and cached, mirroring how
/// a hand-instrumented service would hold one tracer per library.
pub struct OtlpExporter {
    provider: TracerProvider,
    tracers: Mutex<HashMap<String, SdkTracer>>,
}

impl OtlpExporter {
    pub fn new(provider: TracerProvider) -> Self {
        Self {
            provider,
            tracers: Mutex::new(HashMap::new()),
        }
    }

    /// Flushes and shuts down the batch exporter. Best-effort: a failure
    /// here just means some already-buffered spans were dropped, which is
    /// the same tradeoff every OTLP SDK accepts on process exit.
    pub fn shutdown(&self) -> Result<(), opentelemetry::trace::TraceError> {
        self.provider.shutdown()
    }

    async fn tracer_for(&self, scope: &InstrumentationScope) -> SdkTracer {
        let mut tracers = self.tracers.lock().await;
        if let Some(tracer) = tracers.get(&scope.name) {
            return tracer.clone();
        }
        let tracer = self.provider.versioned_tracer(
            scope.name.clone(),
            Some(scope.agent_version.clone()),
            Some(scope.schema_url.clone()),
            None,
        );
        tracers.insert(scope.name.clone(), tracer.clone());
        tracer
    }
}

#[async_trait::async_trait]
impl PipelineHandler for OtlpExporter {
    async fn handle(&self, scope_spans: ScopeSpans) {
        let tracer = self.tracer_for(&scope_spans.scope).await;
        for span in &scope_spans.spans {
            emit_span(&tracer, span);
        }
    }
}

fn emit_span(tracer: &SdkTracer, span: &SpanEvent) {
    let start_time = unix_nano_to_system_time(span.start_time_unix_nano);
    let end_time = unix_nano_to_system_time(span.end_time_unix_nano);

    let builder: SpanBuilder = tracer
        .span_builder(span.name.clone())
        .with_trace_id(TraceId::from_bytes(span.trace_id))
        .with_span_id(SpanId::from_bytes(span.span_id))
        .with_start_time(start_time)
        .with_end_time(end_time)
        .with_kind(map_span_kind(span.kind))
        .with_attributes(span.attributes.iter().map(to_key_value).collect::<Vec<_>>())
        .with_status(map_status(&span.status));

    let parent_cx = match span.parent_span_id {
        Some(parent_span_id) => {
            let span_context = SpanContext::new(
                TraceId::from_bytes(span.trace_id),
                SpanId::from_bytes(parent_span_id),
                TraceFlags::new(span.trace_flags),
                true,
                TraceState::default(),
            );
            Context::new().with_remote_span_context(span_context)
        }
        None => Context::new(),
    };

    let mut otel_span = builder.start_with_context(tracer, &parent_cx);
    otel_span.end_with_timestamp(end_time);
}

fn map_span_kind(kind: agent_api::SpanKind) -> OtelSpanKind {
    match kind {
        agent_api::SpanKind::Client => OtelSpanKind::Client,
        agent_api::SpanKind::Server => OtelSpanKind::Server,
        agent_api::SpanKind::Producer => OtelSpanKind::Producer,
        agent_api::SpanKind::Consumer => OtelSpanKind::Consumer,
        agent_api::SpanKind::Internal => OtelSpanKind::Internal,
    }
}

fn map_status(status: &CoreStatus) -> OtelStatus {
    match status.code {
        CoreStatusCode::Unset => OtelStatus::Unset,
        CoreStatusCode::Ok => OtelStatus::Ok,
        CoreStatusCode::Error => OtelStatus::error(status.message.clone()),
    }
}

fn to_key_value(attribute: &Attribute) -> KeyValue {
    match &attribute.value {
        AttributeValue::Str(v) => KeyValue::new(attribute.key.clone(), v.clone()),
        AttributeValue::Int(v) => KeyValue::new(attribute.key.clone(), *v),
        AttributeValue::Bool(v) => KeyValue::new(attribute.key.clone(), *v),
        AttributeValue::Double(v) => KeyValue::new(attribute.key.clone(), *v),
    }
}

fn unix_nano_to_system_time(unix_nano: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(unix_nano)
}
