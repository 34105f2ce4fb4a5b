// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Process identity and the aggregated metadata the rest of the core needs
//! about an attach target (spec.md §2, "Process Info").

use std::path::PathBuf;
use std::sync::Arc;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::errors::{AttachError, TargetError};
use crate::inspect::{FunctionRecord, ModuleVersionMap, Version};
use crate::scratch::{MemoisedAlloc, ScratchAllocator, ScratchRegion};

/// A validated, non-negative process identifier (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(u32);

impl ProcessId {
    /// Validates the pid by checking `/proc/<pid>` exists and that the
    /// process is alive (sending it the null signal).
    pub fn validate(raw: u32) -> Result<Self, TargetError> {
        let proc_dir = PathBuf::from("/proc").join(raw.to_string());
        if !proc_dir.exists() {
            return Err(TargetError::NoSuchProcess(raw));
        }
        let pid = Pid::from_raw(raw as i32);
        signal::kill(pid, None).map_err(|_| TargetError::NotRunning(raw))?;
        Ok(Self(raw))
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn exe_path(&self) -> PathBuf {
        self.proc_path("exe")
    }

    pub fn task_dir(&self) -> PathBuf {
        self.proc_path("task")
    }

    fn proc_path(&self, leaf: &str) -> PathBuf {
        PathBuf::from("/proc").join(self.0.to_string()).join(leaf)
    }
}

/// Everything the Probe Manager and Offset Resolution need about the
/// target: its identity, resolved executable path, detected toolchain and
/// module versions, the interesting-function set the Binary Inspector
/// found, and the memoised scratch allocation (spec.md §4.6).
///
/// Created once per attach, discarded on stop.
#[derive(Clone)]
pub struct ProcessInfo {
    pid: ProcessId,
    resolved_exe_path: PathBuf,
    toolchain_version: Version,
    module_versions: ModuleVersionMap,
    function_records: Arc<Vec<FunctionRecord>>,
    scratch: Arc<MemoisedAlloc>,
}

impl ProcessInfo {
    pub fn new(
        pid: ProcessId,
        resolved_exe_path: PathBuf,
        toolchain_version: Version,
        module_versions: ModuleVersionMap,
        function_records: Vec<FunctionRecord>,
    ) -> Self {
        Self {
            pid,
            resolved_exe_path,
            toolchain_version,
            module_versions,
            function_records: Arc::new(function_records),
            scratch: Arc::new(MemoisedAlloc::new()),
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn resolved_exe_path(&self) -> &PathBuf {
        &self.resolved_exe_path
    }

    pub fn toolchain_version(&self) -> &Version {
        &self.toolchain_version
    }

    pub fn module_versions(&self) -> &ModuleVersionMap {
        &self.module_versions
    }

    pub fn function_records(&self) -> &[FunctionRecord] {
        &self.function_records
    }

    pub fn function_record(&self, name: &str) -> Option<&FunctionRecord> {
        self.function_records.iter().find(|f| f.name == name)
    }

    pub async fn scratch_alloc(
        &self,
        allocator: &dyn ScratchAllocator,
    ) -> Result<ScratchRegion, AttachError> {
        self.scratch.get_or_alloc(self, allocator).await
    }
}

#[cfg(any(test, feature = "test-util"))]
impl ProcessInfo {
    /// Builds a `ProcessInfo` for tests that do not need real binary
    /// analysis output, only a valid `pid` field and an empty function/
    /// module set.
    pub fn for_test(pid: u32) -> Self {
        Self::new(
            ProcessId(pid),
            PathBuf::from("/proc").join(pid.to_string()).join("exe"),
            Version::parse("0.0.0"),
            ModuleVersionMap::default(),
            Vec::new(),
        )
    }
}
