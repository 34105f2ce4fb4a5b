// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Pipeline Handler: the sink every assembled [`ScopeSpans`] batch is
//! forwarded to. A real implementation bridges to the OTLP exporter; the
//! core only defines the seam.

use super::ScopeSpans;

#[async_trait::async_trait]
pub trait PipelineHandler: Send + Sync {
    async fn handle(&self, scope_spans: ScopeSpans);
}
