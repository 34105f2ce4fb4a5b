// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Event Decoder (spec.md §4.5): the per-probe task that drains a ring
//! buffer, decodes each record, assembles it into a scope-tagged batch, and
//! forwards it to the [`PipelineHandler`]. Both handler shapes
//! ([`ProbeDecoder::SpanProducer`] and [`ProbeDecoder::TraceProducer`]) feed
//! the same handler call so the manager can treat every probe uniformly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::catalogue::{ProbeDecoder, ProbeScope};
use crate::errors::RuntimeError;
use crate::manager::ebpf::{RingBufferReader, RingBufferRecord};

use super::{InstrumentationScope, PipelineHandler, ScopeSpans};

/// Drains `reader` until it reports [`RingBufferRecord::Closed`] or errors,
/// decoding each record and forwarding the assembled batch to `handler`.
/// A single malformed record is logged and skipped rather than aborting the
/// whole probe (spec.md §4.5, "Decode failures"). `enabled` is read fresh on
/// every record rather than captured once, so a configuration update that
/// flips it is honoured on the very next record without restarting this
/// task (spec.md §4.4, "Config application").
pub async fn run(
    mut reader: Box<dyn RingBufferReader>,
    decoder: ProbeDecoder,
    scope: ProbeScope,
    handler: Arc<dyn PipelineHandler>,
    enabled: Arc<AtomicBool>,
) {
    loop {
        let record = match reader.read().await {
            Ok(record) => record,
            Err(err) => {
                warn!("ring buffer read failed for probe {}: {err}", scope.name);
                return;
            }
        };

        let bytes = match record {
            RingBufferRecord::Closed => {
                debug!("ring buffer closed for probe {}", scope.name);
                return;
            }
            RingBufferRecord::LostSamples { count } => {
                warn!("probe {} lost {count} samples", scope.name);
                continue;
            }
            RingBufferRecord::Data(bytes) => bytes,
        };

        if !enabled.load(Ordering::Relaxed) {
            continue;
        }

        match decode(&decoder, &scope, &bytes) {
            Ok(scope_spans) => handler.handle(scope_spans).await,
            Err(err) => warn!("probe {} failed to decode a record: {err}", scope.name),
        }
    }
}

fn decode(
    decoder: &ProbeDecoder,
    scope: &ProbeScope,
    bytes: &[u8],
) -> Result<ScopeSpans, RuntimeError> {
    match decoder {
        ProbeDecoder::SpanProducer(decode_fn) => {
            let span = decode_fn(bytes)?;
            Ok(ScopeSpans {
                scope: InstrumentationScope {
                    name: scope.name.to_string(),
                    agent_version: scope.agent_version.to_string(),
                    schema_url: scope.schema_url.to_string(),
                    kind: scope.kind,
                },
                spans: vec![span],
            })
        }
        ProbeDecoder::TraceProducer(decode_fn) => decode_fn(bytes),
    }
}
