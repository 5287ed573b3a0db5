//! Composition root.
//!
//! [`AppContext`] constructs and owns every transfer service once and
//! exposes the app lifecycle entry points. Nothing in the pipeline is a
//! global; UI code receives the context (or the pieces it needs) explicitly.

use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vaultsync_background::{
    AccountSource, AutoUploadScanner, BackgroundBridge, CompletionGuard, OsTaskScheduler,
    SessionCompletionHandlers,
};
use vaultsync_store::{MemoryStore, RecordStore};
use vaultsync_transfer::{
    Dispatcher, MainContext, PassReport, ProgressFanout, ReconcileReport, Reconciler,
    RemoteFileService, SuccessTracker, TransfersPanel,
};

use crate::config::AppConfig;

/// Platform services the host app provides.
pub struct Platform {
    pub remote: Arc<dyn RemoteFileService>,
    pub scheduler: Arc<dyn OsTaskScheduler>,
    pub scanner: Arc<dyn AutoUploadScanner>,
}

/// Active account shared between the UI and the background bridge.
#[derive(Debug, Default)]
pub struct SharedAccount {
    current: RwLock<Option<String>>,
}

impl SharedAccount {
    pub fn new(account: Option<String>) -> Self {
        Self {
            current: RwLock::new(account),
        }
    }

    /// Replaces the account. Returns `true` if it changed.
    pub fn set(&self, account: Option<String>) -> bool {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if *current == account {
            return false;
        }
        *current = account;
        true
    }
}

impl AccountSource for SharedAccount {
    fn active_account(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Result of a foreground lifecycle pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForegroundReport {
    pub reconcile: ReconcileReport,
    pub pass: PassReport,
}

pub struct AppContext {
    config: AppConfig,
    main: MainContext,
    main_task: JoinHandle<()>,
    records: Arc<MemoryStore>,
    fanout: Arc<ProgressFanout>,
    dispatcher: Arc<Dispatcher>,
    reconciler: Reconciler,
    bridge: Arc<BackgroundBridge>,
    sessions: SessionCompletionHandlers,
    account: Arc<SharedAccount>,
}

impl AppContext {
    /// Builds every service. Must run inside a tokio runtime.
    pub fn new(config: AppConfig, platform: Platform) -> anyhow::Result<Self> {
        let records = match &config.store_path {
            Some(path) => Arc::new(
                MemoryStore::open(path.clone())
                    .with_context(|| format!("opening record store {}", path.display()))?,
            ),
            None => Arc::new(MemoryStore::new()),
        };
        let (main, main_task) = MainContext::spawn();
        let fanout = Arc::new(ProgressFanout::new(main.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            records.clone(),
            platform.remote,
            fanout.clone(),
            Arc::new(SuccessTracker::new()),
            config.dispatcher.clone(),
        ));
        let reconciler = Reconciler::new(dispatcher.clone());
        let account = Arc::new(SharedAccount::new(config.active_account.clone()));
        let bridge = Arc::new(BackgroundBridge::new(
            platform.scheduler,
            reconciler.clone(),
            account.clone(),
            platform.scanner,
            config.background.clone(),
        ));
        let sessions = SessionCompletionHandlers::new(main.clone());

        info!(
            records = records.len(),
            persisted = config.store_path.is_some(),
            "transfer services ready"
        );
        Ok(Self {
            config,
            main,
            main_task,
            records,
            fanout,
            dispatcher,
            reconciler,
            bridge,
            sessions,
            account,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn main_context(&self) -> &MainContext {
        &self.main
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        self.dispatcher.store()
    }

    pub fn fanout(&self) -> &Arc<ProgressFanout> {
        &self.fanout
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn success_tracker(&self) -> &Arc<SuccessTracker> {
        self.dispatcher.success_tracker()
    }

    pub fn bridge(&self) -> &Arc<BackgroundBridge> {
        &self.bridge
    }

    pub fn active_account(&self) -> Option<String> {
        self.account.active_account()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Registers background tasks, then repairs and resumes the queue.
    pub async fn did_finish_launching(&self) -> anyhow::Result<ForegroundReport> {
        if let Err(e) = self.bridge.register() {
            warn!(error = %e, "background task registration failed");
        }
        self.resume("launch").await
    }

    pub async fn did_become_active(&self) -> anyhow::Result<ForegroundReport> {
        self.resume("become active").await
    }

    pub async fn will_enter_foreground(&self) -> anyhow::Result<ForegroundReport> {
        self.resume("enter foreground").await
    }

    /// Cancels active transfers on a spawned task when configured to.
    /// Never waits for transport teardown.
    pub fn will_resign_active(&self) -> Option<JoinHandle<usize>> {
        if !self.config.cancel_on_resign_active {
            return None;
        }
        debug!("resign active, cancelling active transfers");
        Some(self.dispatcher.spawn_cancel_all())
    }

    /// Arms the background wakes and writes the store snapshot.
    pub fn did_enter_background(&self) {
        self.bridge.did_enter_background();
        if let Err(e) = self.records.flush() {
            warn!(error = %e, "failed to flush record store");
        }
    }

    /// Keeps the OS completion handler of a relaunched background session.
    pub fn handle_events_for_background_url_session(
        &self,
        identifier: &str,
        completion: impl FnOnce() + Send + 'static,
    ) {
        self.sessions
            .store_handler(CompletionGuard::new(identifier, move |()| completion()));
    }

    /// Every delegate callback of `identifier` was delivered.
    pub fn url_session_events_drained(&self, identifier: &str) -> bool {
        self.sessions.events_drained(identifier)
    }

    pub fn set_active_account(&self, account: Option<String>) {
        if self.account.set(account.clone()) {
            info!(account = ?account, "active account changed");
        }
    }

    /// Opens the transfers panel feed.
    pub fn open_transfers_panel(&self) -> TransfersPanel {
        TransfersPanel::open(self.reconciler.clone())
    }

    /// Flushes the store and stops the main queue.
    pub async fn shutdown(self) {
        if let Err(e) = self.records.flush() {
            warn!(error = %e, "failed to flush record store");
        }
        self.main.barrier().await;
        self.main_task.abort();
        debug!("app context shut down");
    }

    async fn resume(&self, reason: &'static str) -> anyhow::Result<ForegroundReport> {
        let reconcile = self
            .reconciler
            .reconcile()
            .await
            .context("reconciling transfers")?;
        let pass = self
            .dispatcher
            .start_pending()
            .await
            .context("starting pending transfers")?;
        debug!(
            reason,
            repaired = reconcile.repaired(),
            started = pass.started,
            "queue resumed"
        );
        Ok(ForegroundReport { reconcile, pass })
    }
}
