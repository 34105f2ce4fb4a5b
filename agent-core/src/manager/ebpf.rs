// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! The kernel-interaction seam: everything the Probe Manager needs from
//! `aya` lives behind [`EbpfBackend`] so load/run/stop logic can be
//! exercised with a fake in tests, the way [`crate::scratch::ScratchAllocator`]
//! keeps ptrace/mmap out of the core's direct dependency surface.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use aya::maps::{MapData, RingBuf};
use aya::programs::uprobe::UProbeLink;
use aya::programs::UProbe;
use aya::{Ebpf, EbpfLoader};
use log::debug;
use tokio::io::unix::AsyncFd;
use tokio::sync::Mutex as AsyncMutex;

use crate::catalogue::ConstValue;
use crate::errors::{AttachError, RuntimeError};

/// Name of the ring-buffer map every compiled probe object exposes its
/// kernel-side span records through.
const EVENTS_MAP_NAME: &str = "EVENTS";

/// A resolved constant ready to be patched into a kernel program's global
/// data before it is loaded (spec.md §4.4, "inject the resolved constants
/// into the specification").
#[derive(Debug, Clone)]
pub struct ResolvedConst {
    pub inject_key: String,
    pub value: ConstValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectionHandle(pub u64);

/// One attached resource that must be released when a probe is closed:
/// a uprobe link, a ring-buffer reader, or the kernel collection object
/// itself (spec.md §4.4, "Close a probe").
#[async_trait::async_trait]
pub trait Closer: Send {
    async fn close(&mut self);
}

pub enum RingBufferRecord {
    Data(Vec<u8>),
    LostSamples { count: u64 },
    Closed,
}

#[async_trait::async_trait]
pub trait RingBufferReader: Send {
    async fn read(&mut self) -> Result<RingBufferRecord, RuntimeError>;
}

/// The collaborator contract for loading kernel programs, attaching
/// uprobes, and reading their ring buffers. A production implementation
/// wraps `aya::Ebpf`/`aya::programs::UProbe`; tests use a fake.
#[async_trait::async_trait]
pub trait EbpfBackend: Send + Sync {
    async fn load(
        &self,
        object_name: &str,
        consts: &[ResolvedConst],
    ) -> Result<CollectionHandle, AttachError>;

    async fn attach_uprobe(
        &self,
        collection: &CollectionHandle,
        program_name: &str,
        symbol: &str,
        offset: u64,
        target: &Path,
        pid: u32,
    ) -> Result<Box<dyn Closer>, AttachError>;

    async fn ring_buffer_reader(
        &self,
        collection: &CollectionHandle,
        scope_name: &str,
    ) -> Result<Box<dyn RingBufferReader>, AttachError>;

    async fn unload(&self, collection: CollectionHandle);
}

/// Closes one attached uprobe by dropping its link; `aya`'s `UProbeLink`
/// detaches the program from the kernel on `Drop`.
struct AyaUprobeCloser {
    link: Option<UProbeLink>,
}

#[async_trait::async_trait]
impl Closer for AyaUprobeCloser {
    async fn close(&mut self) {
        self.link.take();
    }
}

/// Polls a ring-buffer map for new records via `AsyncFd`: `RingBuf`
/// exposes a raw fd that becomes readable whenever the kernel side has
/// produced new entries, the standard way to consume an `aya` ring buffer
/// from an async runtime.
struct AyaRingBufferReader {
    async_fd: AsyncFd<RingBuf<MapData>>,
}

#[async_trait::async_trait]
impl RingBufferReader for AyaRingBufferReader {
    async fn read(&mut self) -> Result<RingBufferRecord, RuntimeError> {
        loop {
            let mut guard = self
                .async_fd
                .readable_mut()
                .await
                .map_err(|err| RuntimeError::ReadFailed(err.to_string()))?;

            if let Some(item) = guard.get_inner_mut().next() {
                return Ok(RingBufferRecord::Data(item.to_vec()));
            }
            guard.clear_ready();
        }
    }
}

/// Real backend: loads a catalogue probe's compiled object bytes from
/// `object_dir/<object_name>.o` via `aya::EbpfLoader`, injects the
/// resolved constants as global data, and attaches `aya::programs::UProbe`s
/// by symbol offset. The compiled objects themselves are an out-of-band
/// build artifact shipped alongside the agent (spec.md §1) — this backend
/// only knows how to hand their bytes to `aya`.
pub struct AyaBackend {
    object_dir: PathBuf,
    verifier_log: bool,
    collections: AsyncMutex<HashMap<u64, Ebpf>>,
    next_handle: AtomicU64,
}

impl AyaBackend {
    pub fn new(object_dir: PathBuf, verifier_log: bool) -> Self {
        Self {
            object_dir,
            verifier_log,
            collections: AsyncMutex::new(HashMap::new()),
            next_handle: AtomicU64::new(0),
        }
    }
}

#[async_trait::async_trait]
impl EbpfBackend for AyaBackend {
    async fn load(
        &self,
        object_name: &str,
        consts: &[ResolvedConst],
    ) -> Result<CollectionHandle, AttachError> {
        let path = self.object_dir.join(format!("{object_name}.o"));
        let bytes = std::fs::read(&path).map_err(|err| {
            AttachError::Verifier(format!(
                "failed to read compiled probe object {}: {err}",
                path.display()
            ))
        })?;

        let mut loader = EbpfLoader::new();
        for resolved in consts {
            match &resolved.value {
                ConstValue::U64(value) => {
                    loader.set_global(resolved.inject_key.as_str(), value, true);
                }
                ConstValue::Bytes(value) => {
                    loader.set_global(resolved.inject_key.as_str(), value.as_slice(), true);
                }
            }
        }
        if self.verifier_log {
            debug!("loading {object_name} with verifier log requested");
        }

        let ebpf = loader.load(&bytes)?;
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.collections.lock().await.insert(handle, ebpf);
        Ok(CollectionHandle(handle))
    }

    async fn attach_uprobe(
        &self,
        collection: &CollectionHandle,
        program_name: &str,
        symbol: &str,
        offset: u64,
        target: &Path,
        pid: u32,
    ) -> Result<Box<dyn Closer>, AttachError> {
        let mut collections = self.collections.lock().await;
        let ebpf = collections.get_mut(&collection.0).ok_or_else(|| {
            AttachError::Verifier(format!("unknown collection for program {program_name}"))
        })?;

        let program = ebpf.program_mut(program_name).ok_or_else(|| {
            AttachError::Verifier(format!("program {program_name} not found in compiled object"))
        })?;
        let uprobe: &mut UProbe = program.try_into()?;
        uprobe.load()?;
        let link_id = uprobe.attach(Some(symbol), offset, target, Some(pid as i32))?;
        let link = uprobe.take_link(link_id)?;

        Ok(Box::new(AyaUprobeCloser { link: Some(link) }))
    }

    async fn ring_buffer_reader(
        &self,
        collection: &CollectionHandle,
        _scope_name: &str,
    ) -> Result<Box<dyn RingBufferReader>, AttachError> {
        let mut collections = self.collections.lock().await;
        let ebpf = collections
            .get_mut(&collection.0)
            .ok_or_else(|| AttachError::Verifier("unknown collection for ring buffer".to_string()))?;

        let map = ebpf.take_map(EVENTS_MAP_NAME).ok_or_else(|| {
            AttachError::Verifier(format!("no {EVENTS_MAP_NAME} map in compiled object"))
        })?;
        let ring_buf = RingBuf::try_from(map).map_err(|err| {
            AttachError::Verifier(format!("{EVENTS_MAP_NAME} is not a ring buffer: {err}"))
        })?;
        let async_fd = AsyncFd::new(ring_buf).map_err(|err| {
            AttachError::Verifier(format!("failed to register ring buffer fd: {err}"))
        })?;

        Ok(Box::new(AyaRingBufferReader { async_fd }))
    }

    async fn unload(&self, collection: CollectionHandle) {
        self.collections.lock().await.remove(&collection.0);
    }
}
