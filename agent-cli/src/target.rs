// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! Target-selection by collaborator (spec.md §6): resolving
//! `OTEL_GO_AUTO_TARGET_EXE` to a running process id. The core itself only
//! ever takes an already-validated [`ProcessId`]; finding one from a binary
//! path is this CLI's job.

use std::fs;
use std::path::Path;

use agent_core::process::ProcessId;
use log::warn;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TargetSelectionError {
    #[error("no running process has {0} open as its executable")]
    NotFound(String),
    #[error(transparent)]
    Process(#[from] agent_core::errors::TargetError),
}

/// Scans `/proc/<pid>/exe` for every numeric entry under `/proc`, returning
/// the first pid whose resolved executable matches `target_exe`. Several
/// matches are logged and the lowest pid is kept — good enough for the
/// single-target-per-host deployments this agent is built for.
pub fn find_target_pid(target_exe: &Path) -> Result<ProcessId, TargetSelectionError> {
    let wanted = fs::canonicalize(target_exe).unwrap_or_else(|_| target_exe.to_path_buf());

    let mut matches: Vec<u32> = Vec::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return Err(TargetSelectionError::NotFound(
            target_exe.display().to_string(),
        ));
    };

    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let exe_link = entry.path().join("exe");
        let Ok(resolved) = fs::read_link(&exe_link) else {
            continue;
        };
        if resolved == wanted {
            matches.push(pid);
        }
    }

    matches.sort_unstable();
    let Some(&pid) = matches.first() else {
        return Err(TargetSelectionError::NotFound(
            target_exe.display().to_string(),
        ));
    };
    if matches.len() > 1 {
        warn!(
            "{} processes have {} open, attaching to the lowest pid {pid}",
            matches.len(),
            target_exe.display()
        );
    }

    Ok(ProcessId::validate(pid)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_the_running_process_that_owns_its_own_executable() {
        let exe = std::env::current_exe().expect("resolve own executable path");
        let pid = find_target_pid(&exe).expect("the test binary itself is running");
        assert_eq!(pid.get(), std::process::id());
    }

    #[test]
    fn reports_not_found_for_a_path_nothing_has_open() {
        let bogus = Path::new("/nonexistent/definitely-not-a-real-binary");
        let err = find_target_pid(bogus).expect_err("no process has this path open");
        assert!(matches!(err, TargetSelectionError::NotFound(_)));
    }
}
