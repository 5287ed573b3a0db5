//! Translates OS background wakes into dispatcher work.
//!
//! OS grants are one-shot, so every handler re-arms its own request before
//! doing anything else. A renewal is then pending even when the run
//! fails or the OS expires the task early.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};
use vaultsync_transfer::{Dispatcher, PassReport, Reconciler, TransferError};

use crate::config::BackgroundConfig;
use crate::guard::CompletionGuard;
use crate::scheduler::{
    AccountSource, AutoUploadScanner, OsTaskScheduler, ScheduleError, TaskKind, TaskRequest,
};

/// Lifecycle of one background task kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Unregistered,
    Registered,
    /// A wake is being handled.
    Running,
    /// The last wake finished with the given success flag. A renewal is
    /// already pending.
    Completed(bool),
}

impl BridgeState {
    pub fn is_registered(self) -> bool {
        !matches!(self, Self::Unregistered)
    }
}

pub struct BackgroundBridge {
    scheduler: Arc<dyn OsTaskScheduler>,
    dispatcher: Arc<Dispatcher>,
    reconciler: Reconciler,
    accounts: Arc<dyn AccountSource>,
    scanner: Arc<dyn AutoUploadScanner>,
    config: BackgroundConfig,
    states: Mutex<HashMap<TaskKind, BridgeState>>,
}

impl BackgroundBridge {
    pub fn new(
        scheduler: Arc<dyn OsTaskScheduler>,
        reconciler: Reconciler,
        accounts: Arc<dyn AccountSource>,
        scanner: Arc<dyn AutoUploadScanner>,
        config: BackgroundConfig,
    ) -> Self {
        let dispatcher = Arc::clone(reconciler.dispatcher());
        Self {
            scheduler,
            dispatcher,
            reconciler,
            accounts,
            scanner,
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BackgroundConfig {
        &self.config
    }

    pub fn state(&self, kind: TaskKind) -> BridgeState {
        self.states()
            .get(&kind)
            .copied()
            .unwrap_or(BridgeState::Unregistered)
    }

    /// Registers both task identifiers with the OS.
    pub fn register(&self) -> Result<(), ScheduleError> {
        for kind in [TaskKind::Refresh, TaskKind::Processing] {
            let identifier = self.identifier(kind);
            if self.state(kind).is_registered() {
                continue;
            }
            self.scheduler.register(identifier, kind)?;
            debug!(identifier, ?kind, "background task registered");
            self.set_state(kind, BridgeState::Registered);
        }
        Ok(())
    }

    /// Requests a short wake, no earlier than the configured delay.
    /// Failures are logged and not retried.
    pub fn schedule_refresh(&self) -> Result<(), ScheduleError> {
        self.submit(TaskRequest {
            identifier: self.config.refresh_identifier.clone(),
            kind: TaskKind::Refresh,
            earliest_begin: self.config.refresh_earliest(),
            requires_network: false,
            requires_external_power: false,
        })
    }

    /// Requests a long wake for queue maintenance. Needs neither network
    /// nor external power.
    pub fn schedule_processing(&self) -> Result<(), ScheduleError> {
        self.submit(TaskRequest {
            identifier: self.config.processing_identifier.clone(),
            kind: TaskKind::Processing,
            earliest_begin: self.config.processing_earliest(),
            requires_network: false,
            requires_external_power: false,
        })
    }

    /// The app moved to the background: arm both wakes.
    pub fn did_enter_background(&self) {
        let _ = self.schedule_refresh();
        let _ = self.schedule_processing();
    }

    /// Handles a refresh wake: scan for new uploads, then run a dispatcher
    /// pass. Completes `task` with the pass outcome and returns it.
    pub async fn handle_refresh(&self, task: CompletionGuard) -> bool {
        self.set_state(TaskKind::Refresh, BridgeState::Running);
        let _ = self.schedule_refresh();

        let success = match self.accounts.active_account() {
            None => {
                debug!("no active account, refresh wake has nothing to do");
                true
            }
            Some(account) => {
                let budget = self.config.refresh_budget();
                match within(budget, self.refresh_pass(&account)).await {
                    Ok(report) => {
                        info!(
                            account = %account,
                            started = report.started,
                            deferred = report.deferred,
                            "background refresh finished"
                        );
                        report.failed == 0
                    }
                    Err(e) => {
                        warn!(account = %account, error = %e, "background refresh failed");
                        false
                    }
                }
            }
        };

        self.finish(TaskKind::Refresh, task, success);
        success
    }

    /// Handles a processing wake: reconcile zombies and requeue errored
    /// records whose backoff elapsed.
    pub async fn handle_processing(&self, task: CompletionGuard) -> bool {
        self.set_state(TaskKind::Processing, BridgeState::Running);
        let _ = self.schedule_processing();

        let budget = self.config.processing_budget();
        let success = match within(budget, self.maintenance_pass()).await {
            Ok((repaired, requeued)) => {
                info!(repaired, requeued, "background maintenance finished");
                true
            }
            Err(e) => {
                warn!(error = %e, "background maintenance failed");
                false
            }
        };

        self.finish(TaskKind::Processing, task, success);
        success
    }

    async fn refresh_pass(&self, account: &str) -> Result<PassReport, TransferError> {
        let found = self.scanner.scan(account).await;
        if !found.is_empty() {
            debug!(account, count = found.len(), "auto-upload scan found new assets");
            self.dispatcher.enqueue_many(found).await?;
        }
        self.dispatcher.start_pending().await
    }

    async fn maintenance_pass(&self) -> Result<(usize, usize), TransferError> {
        let report = self.reconciler.reconcile().await?;
        let requeued = self.dispatcher.requeue_due().await?;
        Ok((report.repaired(), requeued))
    }

    fn finish(&self, kind: TaskKind, task: CompletionGuard, success: bool) {
        self.set_state(kind, BridgeState::Completed(success));
        task.complete(success);
    }

    fn submit(&self, request: TaskRequest) -> Result<(), ScheduleError> {
        let kind = request.kind;
        let identifier = request.identifier.clone();
        let result = if self.state(kind).is_registered() {
            self.scheduler.submit(request)
        } else {
            Err(ScheduleError::NotRegistered(identifier.clone()))
        };
        match &result {
            Ok(()) => debug!(%identifier, ?kind, "background wake requested"),
            Err(e) => warn!(%identifier, ?kind, error = %e, "failed to request background wake"),
        }
        result
    }

    fn identifier(&self, kind: TaskKind) -> &str {
        match kind {
            TaskKind::Refresh => &self.config.refresh_identifier,
            TaskKind::Processing => &self.config.processing_identifier,
        }
    }

    fn set_state(&self, kind: TaskKind, state: BridgeState) {
        self.states().insert(kind, state);
    }

    fn states(&self) -> MutexGuard<'_, HashMap<TaskKind, BridgeState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error("task budget of {0:?} exhausted")]
    BudgetExhausted(Duration),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

async fn within<T>(
    budget: Duration,
    work: impl Future<Output = Result<T, TransferError>>,
) -> Result<T, RunError> {
    match tokio::time::timeout(budget, work).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(RunError::BudgetExhausted(budget)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Rig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vaultsync_model::{TransferRecord, TransferStatus};
    use vaultsync_store::RecordStore;

    fn guard(calls: &Arc<Mutex<Vec<bool>>>) -> CompletionGuard {
        let sink = Arc::clone(calls);
        CompletionGuard::new("task", move |ok| sink.lock().unwrap().push(ok))
    }

    fn upload(id: &str) -> TransferRecord {
        TransferRecord::new("oc", "alice", "https://srv", id, TransferStatus::WaitUpload)
            .with_transfer_id(id)
            .with_size(10)
    }

    #[test]
    fn register_moves_both_kinds_to_registered() {
        let rig = Rig::new(None, Vec::new());
        assert_eq!(rig.bridge.state(TaskKind::Refresh), BridgeState::Unregistered);
        assert!(matches!(
            rig.bridge.schedule_refresh(),
            Err(ScheduleError::NotRegistered(_))
        ));

        rig.bridge.register().unwrap();
        rig.bridge.register().unwrap();
        assert_eq!(rig.scheduler.registered().len(), 2);
        assert_eq!(rig.bridge.state(TaskKind::Processing), BridgeState::Registered);
    }

    #[test]
    fn enter_background_requests_both_wakes() {
        let rig = Rig::new(None, Vec::new());
        rig.bridge.register().unwrap();
        rig.bridge.did_enter_background();

        let submitted = rig.scheduler.submitted();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[0].kind, TaskKind::Refresh);
        assert_eq!(submitted[0].earliest_begin, Duration::from_secs(60));
        assert_eq!(submitted[1].kind, TaskKind::Processing);
        assert_eq!(submitted[1].earliest_begin, Duration::from_secs(300));
        assert!(!submitted[1].requires_network);
        assert!(!submitted[1].requires_external_power);
    }

    #[test]
    fn submission_failure_is_not_retried() {
        let rig = Rig::new(None, Vec::new());
        rig.bridge.register().unwrap();
        rig.scheduler.fail_with(ScheduleError::TooManyPendingRequests);
        assert_eq!(
            rig.bridge.schedule_refresh(),
            Err(ScheduleError::TooManyPendingRequests)
        );
        assert_eq!(rig.scheduler.attempts(), 1);
    }

    #[tokio::test]
    async fn refresh_without_account_completes_immediately() {
        let rig = Rig::new(None, vec![upload("new.jpg")]);
        rig.bridge.register().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));

        assert!(rig.bridge.handle_refresh(guard(&calls)).await);
        assert_eq!(*calls.lock().unwrap(), vec![true]);
        assert_eq!(rig.scanner.scans(), 0);
        assert!(rig.store.get("new.jpg").unwrap().is_none());
        // Re-armed even though there was nothing to do.
        assert_eq!(rig.scheduler.submitted().len(), 1);
        assert_eq!(rig.bridge.state(TaskKind::Refresh), BridgeState::Completed(true));
    }

    #[tokio::test]
    async fn refresh_scans_enqueues_and_starts() {
        let rig = Rig::new(Some("alice"), vec![upload("new.jpg")]);
        rig.bridge.register().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));

        assert!(rig.bridge.handle_refresh(guard(&calls)).await);
        assert_eq!(*calls.lock().unwrap(), vec![true]);
        assert_eq!(rig.scanner.scans(), 1);
        assert_eq!(
            rig.store.get("new.jpg").unwrap().unwrap().status,
            TransferStatus::Uploading
        );
    }

    #[tokio::test]
    async fn refresh_rearms_before_running() {
        let rig = Rig::new(Some("alice"), Vec::new());
        rig.bridge.register().unwrap();
        let seen_at_scan = Arc::new(AtomicUsize::new(usize::MAX));
        let scheduler = Arc::clone(&rig.scheduler);
        let seen = Arc::clone(&seen_at_scan);
        rig.scanner.on_scan(move || {
            seen.store(scheduler.submitted().len(), Ordering::SeqCst);
        });

        let calls = Arc::new(Mutex::new(Vec::new()));
        rig.bridge.handle_refresh(guard(&calls)).await;
        assert_eq!(seen_at_scan.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_over_budget_reports_failure() {
        let rig = Rig::new(Some("alice"), Vec::new());
        rig.scanner.hang();
        rig.bridge.register().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));

        assert!(!rig.bridge.handle_refresh(guard(&calls)).await);
        assert_eq!(*calls.lock().unwrap(), vec![false]);
        assert_eq!(rig.bridge.state(TaskKind::Refresh), BridgeState::Completed(false));
    }

    #[tokio::test]
    async fn processing_reconciles_and_rearms() {
        let rig = Rig::new(None, Vec::new());
        rig.bridge.register().unwrap();
        let mut zombie = upload("zombie");
        zombie.status = TransferStatus::Uploading;
        zombie.session_task_identifier = 42;
        rig.store.insert(zombie).unwrap();

        let calls = Arc::new(Mutex::new(Vec::new()));
        assert!(rig.bridge.handle_processing(guard(&calls)).await);
        assert_eq!(*calls.lock().unwrap(), vec![true]);
        assert_eq!(
            rig.store.get("zombie").unwrap().unwrap().status,
            TransferStatus::UploadError
        );
        let submitted = rig.scheduler.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].kind, TaskKind::Processing);
    }
}
