// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Collaborator stubs this CLI wires in for the seams `agent-core` leaves
//! out of scope. A production deployment replaces [`PtraceScratchAllocator`]
//! with real ptrace attach + `mmap`/`madvise`/`mlock` in the target; nothing
//! in the control-loop or pipeline code needs to change to swap it in.

use agent_core::errors::AttachError;
use agent_core::process::ProcessInfo;
use agent_core::scratch::{ScratchAllocator, ScratchRegion};

/// Placeholder [`ScratchAllocator`]: always reports failure. Remote memory
/// allocation in the target process (ptrace attach, `mmap`/`madvise`/
/// `mlock`, detach) is explicitly out of scope for the core and is not yet
/// implemented here either; probes whose consts need scratch space fail
/// attachment with this error until a real implementation is wired in.
pub struct PtraceScratchAllocator;

impl PtraceScratchAllocator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PtraceScratchAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ScratchAllocator for PtraceScratchAllocator {
    async fn alloc(&self, process: &ProcessInfo) -> Result<ScratchRegion, AttachError> {
        Err(AttachError::Verifier(format!(
            "remote scratch allocation is not implemented (pid {})",
            process.pid().get()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn alloc_always_fails_with_the_requesting_pid() {
        let process = ProcessInfo::for_test(4242);
        let err = PtraceScratchAllocator::new()
            .alloc(&process)
            .await
            .expect_err("scratch allocation is not implemented");
        assert!(matches!(err, AttachError::Verifier(_)));
        assert!(err.to_string().contains("4242"));
    }
}
