// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Event Decoder, Trace Assembler, and Pipeline Handler (spec.md §4.5):
//! turns ring-buffer records into scope-tagged spans and forwards them to
//! a handler.

pub mod assembler;
pub mod decoder;
pub mod handler;

pub use assembler::{InstrumentationScope, ScopeSpans};
pub use handler::PipelineHandler;
