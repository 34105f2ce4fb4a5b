// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

pub mod directories {
    //! Well-known on-disk locations the agent uses while a target is
    //! attached. Mirrors the `bpfman` runtime-directory convention: a
    //! per-process subdirectory under a single mount point, created on
    //! `load` and removed on `stop` (spec.md §6, "Persisted state").

    /// RuntimeDirectory: /run/otel-ebpf-agent/
    pub const RTDIR_MODE: u32 = 0o0750;
    pub const RTDIR: &str = "/run/otel-ebpf-agent";

    /// Mount point under which kernel-object pinning directories are
    /// created, one per attached target process: `<RTDIR_FS>/<pid>`.
    pub const RTDIR_FS: &str = "/run/otel-ebpf-agent/fs";

    /// Default location of the persisted offset index document (spec.md
    /// §4.2/§6).
    pub const DEFAULT_OFFSET_INDEX_PATH: &str = "/var/lib/otel-ebpf-agent/offsets.json";

    /// Default directory of compiled probe kernel objects, one `<object_name>.o`
    /// file per catalogue entry, shipped alongside the agent binary.
    pub const DEFAULT_PROBE_OBJECT_DIR: &str = "/usr/lib/otel-ebpf-agent/probes";

    pub fn pin_path_for_pid(pid: u32) -> std::path::PathBuf {
        std::path::PathBuf::from(RTDIR_FS).join(pid.to_string())
    }
}
