//! Test doubles for the background bridge.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vaultsync_model::{NetworkPath, TransferRecord};
use vaultsync_store::MemoryStore;
use vaultsync_transfer::{
    BoxFuture, Dispatcher, DispatcherConfig, MainContext, MainQueue, MetadataOperation, ProgressFanout,
    Reconciler, RemoteFileService, SuccessTracker, TaskHandle, TransportFailure,
};

use crate::bridge::BackgroundBridge;
use crate::config::BackgroundConfig;
use crate::scheduler::{
    AccountSource, AutoUploadScanner, OsTaskScheduler, ScheduleError, TaskKind, TaskRequest,
};

#[derive(Default)]
pub struct FakeScheduler {
    registered: Mutex<Vec<(String, TaskKind)>>,
    submitted: Mutex<Vec<TaskRequest>>,
    failure: Mutex<Option<ScheduleError>>,
    attempts: AtomicUsize,
}

impl FakeScheduler {
    pub fn fail_with(&self, error: ScheduleError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn registered(&self) -> Vec<(String, TaskKind)> {
        self.registered.lock().unwrap().clone()
    }

    pub fn submitted(&self) -> Vec<TaskRequest> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl OsTaskScheduler for FakeScheduler {
    fn register(&self, identifier: &str, kind: TaskKind) -> Result<(), ScheduleError> {
        self.registered
            .lock()
            .unwrap()
            .push((identifier.to_string(), kind));
        Ok(())
    }

    fn submit(&self, request: TaskRequest) -> Result<(), ScheduleError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        self.submitted.lock().unwrap().push(request);
        Ok(())
    }
}

pub struct StaticAccount(pub Option<String>);

impl AccountSource for StaticAccount {
    fn active_account(&self) -> Option<String> {
        self.0.clone()
    }
}

type ScanHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct StaticScanner {
    found: Mutex<Vec<TransferRecord>>,
    scans: AtomicUsize,
    hang: AtomicBool,
    hook: Mutex<Option<ScanHook>>,
}

impl StaticScanner {
    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    /// Makes every later scan wait forever.
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    pub fn on_scan(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }
}

impl AutoUploadScanner for StaticScanner {
    fn scan(&self, _account: &str) -> BoxFuture<'_, Vec<TransferRecord>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook();
        }
        if self.hang.load(Ordering::SeqCst) {
            return Box::pin(std::future::pending::<Vec<TransferRecord>>());
        }
        let found = std::mem::take(&mut *self.found.lock().unwrap());
        Box::pin(async move { found })
    }
}

/// Remote that accepts every start and has no live tasks of its own.
#[derive(Default)]
pub struct IdleRemote {
    next_task: AtomicUsize,
}

impl RemoteFileService for IdleRemote {
    fn start_upload(
        &self,
        record: &TransferRecord,
    ) -> BoxFuture<'_, Result<TaskHandle, TransportFailure>> {
        let handle = TaskHandle {
            task_identifier: self.next_task.fetch_add(1, Ordering::SeqCst) as u64 + 1,
            session: record.session,
        };
        Box::pin(async move { Ok(handle) })
    }

    fn start_download(
        &self,
        record: &TransferRecord,
    ) -> BoxFuture<'_, Result<TaskHandle, TransportFailure>> {
        self.start_upload(record)
    }

    fn perform(
        &self,
        _operation: MetadataOperation,
        _record: &TransferRecord,
    ) -> BoxFuture<'_, Result<(), TransportFailure>> {
        Box::pin(async { Ok(()) })
    }

    fn cancel(&self, _handle: TaskHandle) {}

    fn list_live_tasks(&self) -> BoxFuture<'_, Vec<u64>> {
        Box::pin(async { Vec::new() })
    }

    fn network_path(&self) -> NetworkPath {
        NetworkPath::Unmetered
    }

    fn supports_resume(&self, _record: &TransferRecord) -> bool {
        true
    }
}

/// Bridge wired to in-memory collaborators.
pub struct Rig {
    pub bridge: BackgroundBridge,
    pub scheduler: Arc<FakeScheduler>,
    pub scanner: Arc<StaticScanner>,
    pub store: Arc<MemoryStore>,
    _main_queue: MainQueue,
}

impl Rig {
    pub fn new(account: Option<&str>, found: Vec<TransferRecord>) -> Self {
        let (main, main_queue) = MainContext::channel();
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            Arc::new(IdleRemote::default()),
            Arc::new(ProgressFanout::new(main)),
            Arc::new(SuccessTracker::new()),
            DispatcherConfig::default(),
        ));
        let scheduler = Arc::new(FakeScheduler::default());
        let scanner = Arc::new(StaticScanner::default());
        *scanner.found.lock().unwrap() = found;
        let bridge = BackgroundBridge::new(
            scheduler.clone(),
            Reconciler::new(dispatcher),
            Arc::new(StaticAccount(account.map(str::to_string))),
            scanner.clone(),
            BackgroundConfig::default(),
        );
        Self {
            bridge,
            scheduler,
            scanner,
            store,
            _main_queue: main_queue,
        }
    }
}
