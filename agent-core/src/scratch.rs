// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Remote scratch allocation (spec.md §4.6): a collaborator contract plus
//! the at-most-once memoisation the core owns.
//!
//! Everything below the [`ScratchAllocator`] trait — ptrace attach,
//! `mmap`/`madvise`/`mlock` in the target, detach — is out of scope here;
//! only the "call it at most once and cache the result" behaviour lives in
//! this crate.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::Mutex;

use crate::errors::AttachError;
use crate::process::ProcessInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchRegion {
    pub start_address: u64,
    pub end_address: u64,
}

/// The collaborator contract. Implementations live outside the core; tests
/// use a fake.
#[async_trait::async_trait]
pub trait ScratchAllocator: Send + Sync {
    async fn alloc(&self, process: &ProcessInfo) -> Result<ScratchRegion, AttachError>;
}

/// Memoises a single [`ScratchAllocator::alloc`] call for the lifetime of a
/// `ProcessInfo`, per the design note in spec.md §9: a sequentially
/// consistent `done` flag covers the fast path (an acquire load), and the
/// slow path takes the mutex and re-checks `done` before calling the
/// allocator, so concurrent callers that lose the race just wait on the
/// mutex instead of allocating twice.
#[derive(Default)]
pub(crate) struct MemoisedAlloc {
    done: AtomicBool,
    slot: Mutex<Option<Result<ScratchRegion, String>>>,
}

impl MemoisedAlloc {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn get_or_alloc(
        self: &Arc<Self>,
        process: &ProcessInfo,
        allocator: &(dyn ScratchAllocator),
    ) -> Result<ScratchRegion, AttachError> {
        if self.done.load(Ordering::Acquire) {
            // Fast path: a previous caller already populated the slot.
            let slot = self.slot.lock().await;
            return Self::result_from_slot(slot.as_ref());
        }

        let mut slot = self.slot.lock().await;
        if self.done.load(Ordering::Acquire) {
            return Self::result_from_slot(slot.as_ref());
        }

        let result = allocator.alloc(process).await;
        match &result {
            Ok(region) => {
                *slot = Some(Ok(*region));
                self.done.store(true, Ordering::Release);
            }
            Err(_) => {
                // A failed allocation is not cached: the invariant in
                // spec.md §4.6 only requires a single *success* to be
                // cached, so the next caller may retry.
            }
        }
        result
    }

    fn result_from_slot(
        slot: Option<&Result<ScratchRegion, String>>,
    ) -> Result<ScratchRegion, AttachError> {
        match slot {
            Some(Ok(region)) => Ok(*region),
            _ => Err(AttachError::Verifier(
                "scratch allocation slot observed done but empty".to_string(),
            )),
        }
    }
}
