// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of otel-ebpf-agent

//! End-to-end `ProbeManager` lifecycle tests against the real, inventory-
//! registered catalogue: load/filter, attach, decode, dynamic
//! enable/disable, and a bounded shutdown. Every collaborator `agent-core`
//! leaves to `agent-cli` (the kernel backend, scratch allocation, the
//! pipeline handler, the configuration provider) is a fake here, the same
//! way the per-module unit tests fake them, but driven through the full
//! `ProbeManager` rather than one collaborator at a time.

use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_api::config::Sampler;
use agent_api::{ConfigSnapshot, LibraryConfig, LibraryId, ProbeId, SpanKind};
use agent_core::config_provider::ConfigurationProvider;
use agent_core::errors::{AttachError, ConfigError, RuntimeError};
use agent_core::inspect::{FunctionRecord, ModuleVersionMap, Version};
use agent_core::manager::ebpf::{
    Closer, CollectionHandle, EbpfBackend, RingBufferReader, RingBufferRecord,
};
use agent_core::offsets::{OffsetEntry, OffsetIndex, StructFieldId};
use agent_core::pipeline::{PipelineHandler, ScopeSpans};
use agent_core::process::{ProcessId, ProcessInfo};
use agent_core::scratch::{ScratchAllocator, ScratchRegion};
use agent_core::ProbeManager;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

// --- fakes -------------------------------------------------------------

struct NoopCloser;

#[async_trait::async_trait]
impl Closer for NoopCloser {
    async fn close(&mut self) {}
}

struct FakeReader {
    records: Vec<RingBufferRecord>,
}

#[async_trait::async_trait]
impl RingBufferReader for FakeReader {
    async fn read(&mut self) -> Result<RingBufferRecord, RuntimeError> {
        if self.records.is_empty() {
            return Ok(RingBufferRecord::Closed);
        }
        Ok(self.records.remove(0))
    }
}

/// Fakes the kernel seam, keyed by `object_name` rather than scope name:
/// `http_server` and `http_client` share the scope `"net/http"`, so a
/// scope-keyed lookup would not be able to tell their ring buffers apart.
struct FakeBackend {
    next_handle: AtomicU64,
    handle_objects: Mutex<HashMap<u64, String>>,
    scripted_records: Mutex<HashMap<String, Vec<RingBufferRecord>>>,
}

impl FakeBackend {
    fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(0),
            handle_objects: Mutex::new(HashMap::new()),
            scripted_records: Mutex::new(HashMap::new()),
        }
    }

    fn script(&self, object_name: &str, records: Vec<RingBufferRecord>) {
        self.scripted_records
            .lock()
            .unwrap()
            .insert(object_name.to_string(), records);
    }
}

#[async_trait::async_trait]
impl EbpfBackend for FakeBackend {
    async fn load(
        &self,
        object_name: &str,
        _consts: &[agent_core::manager::ebpf::ResolvedConst],
    ) -> Result<CollectionHandle, AttachError> {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handle_objects
            .lock()
            .unwrap()
            .insert(id, object_name.to_string());
        Ok(CollectionHandle(id))
    }

    async fn attach_uprobe(
        &self,
        _collection: &CollectionHandle,
        _program_name: &str,
        _symbol: &str,
        _offset: u64,
        _target: &Path,
        _pid: u32,
    ) -> Result<Box<dyn Closer>, AttachError> {
        Ok(Box::new(NoopCloser))
    }

    async fn ring_buffer_reader(
        &self,
        collection: &CollectionHandle,
        _scope_name: &str,
    ) -> Result<Box<dyn RingBufferReader>, AttachError> {
        let object_name = self
            .handle_objects
            .lock()
            .unwrap()
            .get(&collection.0)
            .cloned()
            .unwrap_or_default();
        let records = self
            .scripted_records
            .lock()
            .unwrap()
            .remove(&object_name)
            .unwrap_or_default();
        Ok(Box::new(FakeReader { records }))
    }

    async fn unload(&self, collection: CollectionHandle) {
        self.handle_objects.lock().unwrap().remove(&collection.0);
    }
}

/// None of the probes this suite exercises carry a `ProbeConst::Allocation`,
/// so this fake is never expected to be called; it still returns a valid
/// region rather than panicking, in case that assumption ever changes.
struct UnusedScratchAllocator;

#[async_trait::async_trait]
impl ScratchAllocator for UnusedScratchAllocator {
    async fn alloc(&self, _process: &ProcessInfo) -> Result<ScratchRegion, AttachError> {
        Ok(ScratchRegion {
            start_address: 0x1000,
            end_address: 0x2000,
        })
    }
}

struct CollectingHandler {
    batches: Mutex<Vec<ScopeSpans>>,
}

impl CollectingHandler {
    fn new() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
        }
    }

    fn snapshot(&self) -> Vec<ScopeSpans> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl PipelineHandler for CollectingHandler {
    async fn handle(&self, scope_spans: ScopeSpans) {
        self.batches.lock().unwrap().push(scope_spans);
    }
}

/// A configuration provider a test can push new snapshots into after
/// `run()` has already started, plus an observable shutdown flag.
struct FakeConfigProvider {
    initial: ConfigSnapshot,
    pending_rx: Mutex<Option<tokio::sync::mpsc::Receiver<ConfigSnapshot>>>,
    shutdown_called: Arc<AtomicBool>,
}

impl FakeConfigProvider {
    fn new(
        initial: ConfigSnapshot,
    ) -> (
        Arc<Self>,
        tokio::sync::mpsc::Sender<ConfigSnapshot>,
        Arc<AtomicBool>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let shutdown_called = Arc::new(AtomicBool::new(false));
        let provider = Arc::new(Self {
            initial,
            pending_rx: Mutex::new(Some(rx)),
            shutdown_called: shutdown_called.clone(),
        });
        (provider, tx, shutdown_called)
    }
}

#[async_trait::async_trait]
impl ConfigurationProvider for FakeConfigProvider {
    async fn initial(&self) -> Result<ConfigSnapshot, ConfigError> {
        Ok(self.initial.clone())
    }

    fn watch(&self) -> Pin<Box<dyn Stream<Item = ConfigSnapshot> + Send>> {
        let rx = self
            .pending_rx
            .lock()
            .unwrap()
            .take()
            .expect("watch() called more than once");
        Box::pin(ReceiverStream::new(rx))
    }

    async fn shutdown(&self) {
        self.shutdown_called.store(true, Ordering::SeqCst);
    }
}

// --- fixtures ------------------------------------------------------------

/// A real attach target: the test binary's own pid and executable, so
/// `ProbeManager::load`'s `std::fs::read(resolved_exe_path)` has something
/// to read. Only `net/http.(*conn).serve`, `net/http.(*Client).do`, and the
/// Kafka producer's symbol are present, so filtering is expected to drop
/// gRPC, SQL, the Kafka consumer, and the Tracer API probe.
fn build_process() -> ProcessInfo {
    let pid = ProcessId::validate(std::process::id()).expect("own pid is alive");
    let exe = std::env::current_exe().expect("resolve own executable path");

    let mut module_versions = ModuleVersionMap::default();
    module_versions.insert("net/http", Version::parse("1.21.0"));

    let function_records = vec![
        FunctionRecord {
            name: "net/http.(*conn).serve".to_string(),
            entry_offset: 0x100,
            return_offsets: Vec::new(),
        },
        FunctionRecord {
            name: "net/http.(*Client).do".to_string(),
            entry_offset: 0x200,
            return_offsets: Vec::new(),
        },
        FunctionRecord {
            name: "github.com/segmentio/kafka-go.(*Writer).WriteMessages".to_string(),
            entry_offset: 0x300,
            return_offsets: Vec::new(),
        },
    ];

    ProcessInfo::new(
        pid,
        exe,
        Version::parse("go1.21.0"),
        module_versions,
        function_records,
    )
}

/// Pre-populates the `net/http.Request.Method` offset so resolving
/// `http_server`/`http_client`'s struct-field const never needs DWARF.
fn build_offset_index() -> OffsetIndex {
    let mut index = OffsetIndex::new();
    index.insert(
        StructFieldId::new("net/http", "net/http", "Request", "Method"),
        Version::parse("1.21.0"),
        OffsetEntry::valid(16),
    );
    index
}

/// Builds a raw kernel-side record matching the catalogue's common wire
/// format: a 52-byte header (trace id, span id, parent span id, start/end
/// timestamps, trace flags, status, attribute count) with zero attributes.
fn encode_record(trace_id: [u8; 16], span_id: [u8; 8], parent_span_id: Option<[u8; 8]>) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&trace_id);
    bytes.extend_from_slice(&span_id);
    bytes.extend_from_slice(&parent_span_id.unwrap_or([0u8; 8]));
    bytes.extend_from_slice(&1_000_000u64.to_le_bytes());
    bytes.extend_from_slice(&2_000_000u64.to_le_bytes());
    bytes.push(1); // trace_flags
    bytes.push(1); // status = Ok
    bytes.extend_from_slice(&0u16.to_le_bytes()); // attr_count
    bytes
}

async fn wait_for_enabled(manager: &ProbeManager, id: &ProbeId, expected: Option<bool>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if manager.is_probe_enabled(id).await == expected {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {id} enabled to become {expected:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_batch_count(handler: &CollectingHandler, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if handler.snapshot().len() >= count {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {count} forwarded span batches");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// --- tests ---------------------------------------------------------------

#[tokio::test]
async fn load_keeps_only_probes_with_present_symbols() {
    let backend = Arc::new(FakeBackend::new());
    let handler = Arc::new(CollectingHandler::new());
    let (config_provider, _tx, _shutdown) =
        FakeConfigProvider::new(ConfigSnapshot::new(false, Sampler::AlwaysOn));

    let initial = config_provider.initial().await.unwrap();
    let manager = Arc::new(ProbeManager::new(
        build_process(),
        backend,
        Arc::new(UnusedScratchAllocator),
        handler,
        config_provider,
        build_offset_index(),
    ));

    manager.load(&initial).await.expect("load should succeed");

    let loaded = manager.loaded_probe_ids().await;
    assert_eq!(loaded.len(), 3, "unexpected probe set: {loaded:?}");
    assert!(loaded.contains(&ProbeId::new("net/http", SpanKind::Server)));
    assert!(loaded.contains(&ProbeId::new("net/http", SpanKind::Client)));
    assert!(loaded.contains(&ProbeId::new(
        "github.com/segmentio/kafka-go",
        SpanKind::Producer
    )));
    assert!(!loaded.contains(&ProbeId::new("google.golang.org/grpc", SpanKind::Server)));
    assert!(!loaded.contains(&ProbeId::new("database/sql", SpanKind::Client)));
}

#[tokio::test]
async fn run_correlates_client_and_server_spans_then_stops_cleanly() {
    let trace_id = [0xAAu8; 16];
    let client_span_id = [1u8; 8];
    let server_span_id = [2u8; 8];

    let backend = Arc::new(FakeBackend::new());
    backend.script(
        "http_client",
        vec![RingBufferRecord::Data(encode_record(
            trace_id,
            client_span_id,
            None,
        ))],
    );
    backend.script(
        "http_server",
        vec![RingBufferRecord::Data(encode_record(
            trace_id,
            server_span_id,
            Some(client_span_id),
        ))],
    );
    backend.script("kafka_producer", Vec::new());

    let handler = Arc::new(CollectingHandler::new());
    let (config_provider, _tx, shutdown_called) =
        FakeConfigProvider::new(ConfigSnapshot::new(false, Sampler::AlwaysOn));

    let initial = config_provider.initial().await.unwrap();
    let manager = Arc::new(ProbeManager::new(
        build_process(),
        backend,
        Arc::new(UnusedScratchAllocator),
        handler.clone(),
        config_provider,
        build_offset_index(),
    ));
    manager.load(&initial).await.expect("load should succeed");

    let run_manager = manager.clone();
    let run_task = tokio::spawn(async move { run_manager.run().await });

    wait_for_batch_count(&handler, 2).await;

    manager.request_stop();
    let result = tokio::time::timeout(Duration::from_secs(2), run_task)
        .await
        .expect("run() did not return promptly after request_stop")
        .expect("run task panicked");
    assert!(result.is_ok());

    assert!(shutdown_called.load(Ordering::SeqCst));
    assert!(manager.loaded_probe_ids().await.is_empty());

    let batches = handler.snapshot();
    let client = batches
        .iter()
        .find(|b| b.spans[0].kind == SpanKind::Client)
        .expect("client span forwarded");
    let server = batches
        .iter()
        .find(|b| b.spans[0].kind == SpanKind::Server)
        .expect("server span forwarded");

    assert_eq!(client.spans[0].span_id, client_span_id);
    assert_eq!(client.spans[0].trace_id, trace_id);
    assert_eq!(client.spans[0].parent_span_id, None);

    assert_eq!(server.spans[0].span_id, server_span_id);
    assert_eq!(server.spans[0].trace_id, trace_id);
    assert_eq!(server.spans[0].parent_span_id, Some(client_span_id));
}

#[tokio::test]
async fn config_updates_enable_and_disable_probes_idempotently() {
    let backend = Arc::new(FakeBackend::new());
    let handler = Arc::new(CollectingHandler::new());
    let (config_provider, config_tx, _shutdown) =
        FakeConfigProvider::new(ConfigSnapshot::new(false, Sampler::AlwaysOn));

    let initial = config_provider.initial().await.unwrap();
    let manager = Arc::new(ProbeManager::new(
        build_process(),
        backend,
        Arc::new(UnusedScratchAllocator),
        handler,
        config_provider,
        build_offset_index(),
    ));
    manager.load(&initial).await.expect("load should succeed");

    let http_server = ProbeId::new("net/http", SpanKind::Server);
    let http_client = ProbeId::new("net/http", SpanKind::Client);
    let kafka_producer = ProbeId::new("github.com/segmentio/kafka-go", SpanKind::Producer);

    assert_eq!(manager.is_probe_enabled(&http_server).await, Some(true));
    assert_eq!(manager.is_probe_enabled(&kafka_producer).await, Some(true));

    let run_manager = manager.clone();
    let run_task = tokio::spawn(async move { run_manager.run().await });

    let mut disable_net_http = ConfigSnapshot::new(false, Sampler::AlwaysOn);
    disable_net_http.library_configs.insert(
        LibraryId::all_kinds("net/http"),
        LibraryConfig {
            traces_enabled: Some(false),
        },
    );

    config_tx
        .send(disable_net_http.clone())
        .await
        .expect("send disable snapshot");
    wait_for_enabled(&manager, &http_server, Some(false)).await;
    wait_for_enabled(&manager, &http_client, Some(false)).await;
    assert_eq!(manager.is_probe_enabled(&kafka_producer).await, Some(true));

    // Re-applying the identical snapshot is idempotent: already-disabled
    // probes are just swapped to the same value again.
    config_tx
        .send(disable_net_http)
        .await
        .expect("send repeated disable snapshot");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.is_probe_enabled(&http_server).await, Some(false));
    assert_eq!(manager.is_probe_enabled(&http_client).await, Some(false));

    config_tx
        .send(ConfigSnapshot::new(false, Sampler::AlwaysOn))
        .await
        .expect("send re-enable snapshot");
    wait_for_enabled(&manager, &http_server, Some(true)).await;
    wait_for_enabled(&manager, &http_client, Some(true)).await;

    manager.request_stop();
    let result = tokio::time::timeout(Duration::from_secs(2), run_task)
        .await
        .expect("run() did not return promptly after request_stop")
        .expect("run task panicked");
    assert!(result.is_ok());
}
