//! Test doubles shared by the unit tests of this crate.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use vaultsync_model::{NetworkPath, TransferRecord, TransferStatus};
use vaultsync_store::{MemoryStore, RecordStore};

use crate::config::DispatcherConfig;
use crate::dispatcher::Dispatcher;
use crate::fanout::{ProgressEvent, ProgressFanout, RecordsByError, TransferDelegate, TransferPhase};
use crate::main_context::MainContext;
use crate::remote::{BoxFuture, MetadataOperation, RemoteFileService, TaskHandle, TransportFailure};
use crate::success::SuccessTracker;

pub const SERVER_URL: &str = "https://cloud.example/remote.php/dav/files/alice";

/// Upload record whose transfer id and file name are both `id`.
pub fn upload(id: &str, size: i64) -> TransferRecord {
    TransferRecord::new("oc-".to_string() + id, "alice", SERVER_URL, id, TransferStatus::WaitUpload)
        .with_transfer_id(id)
        .with_size(size)
}

pub fn download(id: &str, size: i64) -> TransferRecord {
    TransferRecord::new("oc-".to_string() + id, "alice", SERVER_URL, id, TransferStatus::WaitDownload)
        .with_transfer_id(id)
        .with_size(size)
}

struct FakeState {
    live: HashSet<u64>,
    path: NetworkPath,
    start_failures: VecDeque<TransportFailure>,
    perform_results: VecDeque<Result<(), TransportFailure>>,
    started: Vec<String>,
    cancelled: Vec<u64>,
    performed: Vec<MetadataOperation>,
    resumable: bool,
    hang_starts: bool,
}

/// Scriptable in-process remote service.
pub struct FakeRemote {
    next_task: AtomicU64,
    state: Mutex<FakeState>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self {
            next_task: AtomicU64::new(1),
            state: Mutex::new(FakeState {
                live: HashSet::new(),
                path: NetworkPath::Unmetered,
                start_failures: VecDeque::new(),
                perform_results: VecDeque::new(),
                started: Vec::new(),
                cancelled: Vec::new(),
                performed: Vec::new(),
                resumable: true,
                hang_starts: false,
            }),
        }
    }
}

impl FakeRemote {
    pub fn set_path(&self, path: NetworkPath) {
        self.state.lock().unwrap().path = path;
    }

    pub fn set_resumable(&self, resumable: bool) {
        self.state.lock().unwrap().resumable = resumable;
    }

    pub fn fail_next_start(&self, failure: TransportFailure) {
        self.state.lock().unwrap().start_failures.push_back(failure);
    }

    /// Every later start waits forever for the transport.
    pub fn hang_starts(&self) {
        self.state.lock().unwrap().hang_starts = true;
    }

    pub fn queue_perform(&self, result: Result<(), TransportFailure>) {
        self.state.lock().unwrap().perform_results.push_back(result);
    }

    /// Simulates the OS tearing down every task while suspended.
    pub fn kill_all_tasks(&self) {
        self.state.lock().unwrap().live.clear();
    }

    /// Marks a task as finished on the transport side.
    pub fn finish(&self, task: u64) {
        self.state.lock().unwrap().live.remove(&task);
    }

    pub fn mark_live(&self, task: u64) {
        self.state.lock().unwrap().live.insert(task);
    }

    pub fn started(&self) -> Vec<String> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn cancelled(&self) -> Vec<u64> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn performed(&self) -> Vec<MetadataOperation> {
        self.state.lock().unwrap().performed.clone()
    }

    fn start(&self, record: &TransferRecord) -> BoxFuture<'_, Result<TaskHandle, TransportFailure>> {
        if self.state.lock().unwrap().hang_starts {
            return Box::pin(std::future::pending());
        }
        let result = self.open(record);
        Box::pin(async move { result })
    }

    fn open(&self, record: &TransferRecord) -> Result<TaskHandle, TransportFailure> {
        let mut state = self.state.lock().unwrap();
        if let Some(failure) = state.start_failures.pop_front() {
            return Err(failure);
        }
        let task_identifier = self.next_task.fetch_add(1, Ordering::SeqCst);
        state.live.insert(task_identifier);
        state.started.push(record.oc_id_transfer.clone());
        Ok(TaskHandle {
            task_identifier,
            session: record.session,
        })
    }
}

impl RemoteFileService for FakeRemote {
    fn start_upload(
        &self,
        record: &TransferRecord,
    ) -> BoxFuture<'_, Result<TaskHandle, TransportFailure>> {
        self.start(record)
    }

    fn start_download(
        &self,
        record: &TransferRecord,
    ) -> BoxFuture<'_, Result<TaskHandle, TransportFailure>> {
        self.start(record)
    }

    fn perform(
        &self,
        operation: MetadataOperation,
        _record: &TransferRecord,
    ) -> BoxFuture<'_, Result<(), TransportFailure>> {
        let mut state = self.state.lock().unwrap();
        state.performed.push(operation);
        let result = state.perform_results.pop_front().unwrap_or(Ok(()));
        Box::pin(async move { result })
    }

    fn cancel(&self, handle: TaskHandle) {
        let mut state = self.state.lock().unwrap();
        state.live.remove(&handle.task_identifier);
        state.cancelled.push(handle.task_identifier);
    }

    fn list_live_tasks(&self) -> BoxFuture<'_, Vec<u64>> {
        let mut live: Vec<u64> = self.state.lock().unwrap().live.iter().copied().collect();
        live.sort_unstable();
        Box::pin(async move { live })
    }

    fn network_path(&self) -> NetworkPath {
        self.state.lock().unwrap().path
    }

    fn supports_resume(&self, _record: &TransferRecord) -> bool {
        self.state.lock().unwrap().resumable
    }
}

/// Delegate that records every callback it receives.
#[derive(Default)]
pub struct RecordingDelegate {
    progress: Mutex<Vec<ProgressEvent>>,
    changes: Mutex<Vec<(TransferPhase, String, Option<String>)>>,
    batches: Mutex<Vec<(TransferPhase, usize)>>,
    flushes: Mutex<Vec<&'static str>>,
}

impl RecordingDelegate {
    pub fn progress(&self) -> Vec<ProgressEvent> {
        self.progress.lock().unwrap().clone()
    }

    pub fn changes(&self) -> Vec<(TransferPhase, String, Option<String>)> {
        self.changes.lock().unwrap().clone()
    }

    pub fn batches(&self) -> Vec<(TransferPhase, usize)> {
        self.batches.lock().unwrap().clone()
    }

    pub fn flushes(&self) -> Vec<&'static str> {
        self.flushes.lock().unwrap().clone()
    }
}

impl TransferDelegate for RecordingDelegate {
    fn transfer_progress(&self, event: &ProgressEvent) {
        self.progress.lock().unwrap().push(event.clone());
    }

    fn transfer_change(&self, phase: TransferPhase, record: &TransferRecord, error: Option<&str>) {
        self.changes.lock().unwrap().push((
            phase,
            record.oc_id_transfer.clone(),
            error.map(str::to_string),
        ));
    }

    fn transfer_changes(&self, phase: TransferPhase, records: &RecordsByError) {
        let count = records.values().map(Vec::len).sum();
        self.batches.lock().unwrap().push((phase, count));
    }

    fn flush_begin(&self) {
        self.flushes.lock().unwrap().push("begin");
    }

    fn flush_end(&self) {
        self.flushes.lock().unwrap().push("end");
    }
}

/// Dispatcher wired to an in-memory store, a fake remote and one
/// recording delegate.
pub struct Harness {
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<MemoryStore>,
    pub remote: Arc<FakeRemote>,
    pub delegate: Arc<RecordingDelegate>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(DispatcherConfig::default())
    }

    pub fn with_config(config: DispatcherConfig) -> Self {
        let (main, _queue) = MainContext::spawn();
        let fanout = Arc::new(ProgressFanout::new(main));
        let delegate = Arc::new(RecordingDelegate::default());
        let observer: Arc<dyn TransferDelegate> = delegate.clone();
        fanout.add_delegate(&observer);

        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(FakeRemote::default());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            remote.clone(),
            fanout,
            Arc::new(SuccessTracker::new()),
            config,
        ));
        Self {
            dispatcher,
            store,
            remote,
            delegate,
        }
    }

    /// Stored record; panics if it is missing.
    pub fn record(&self, id: &str) -> TransferRecord {
        self.store.get(id).unwrap().unwrap()
    }
}
