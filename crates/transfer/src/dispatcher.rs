//! Transfer dispatcher.
//!
//! Owns the decision of which waiting records run now, opens their
//! transport tasks and keeps each record's status in lock-step with the
//! transport. All status mutations are serialized through one async lock
//! and applied with conditional store updates, so a racing reconciliation
//! pass or a second completion in the same tick never loses an update.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use vaultsync_model::{Direction, TransferEvent, TransferRecord, TransferStatus, TransitionError};
use vaultsync_store::{Condition, RecordQuery, RecordStore};

use crate::config::DispatcherConfig;
use crate::fanout::{ProgressEvent, ProgressFanout, RecordsByError, TransferPhase};
use crate::policy::dispatch_order;
use crate::progress::{PersistThrottle, ProgressSnapshot};
use crate::remote::{MetadataOperation, RemoteFileService, TaskHandle, TransportFailure};
use crate::success::SuccessTracker;
use crate::TransferError;

/// Result of [`Dispatcher::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new record was inserted.
    Queued,
    /// An idle or errored record was queued again.
    Requeued,
    /// The record was already waiting; nothing changed.
    AlreadyQueued,
}

/// Counters for one "start pending" pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Errored records whose backoff elapsed and went back to waiting.
    pub requeued: usize,
    pub started: usize,
    /// Records left waiting (no network path or no free slot).
    pub deferred: usize,
    pub failed: usize,
}

/// In-memory view of a transfer bound to a live task.
#[derive(Debug, Clone)]
struct LiveTransfer {
    oc_id_transfer: String,
    key: String,
    file_name: String,
    server_url: String,
    status: TransferStatus,
    size: i64,
    handle: TaskHandle,
}

impl LiveTransfer {
    fn new(record: &TransferRecord, handle: TaskHandle) -> Self {
        Self {
            oc_id_transfer: record.oc_id_transfer.clone(),
            key: record.progress_key(),
            file_name: record.file_name.clone(),
            server_url: record.server_url.clone(),
            status: record.status,
            size: record.size,
            handle,
        }
    }
}

struct LiveState {
    tasks: HashMap<u64, LiveTransfer>,
    snapshot: ProgressSnapshot,
    throttle: PersistThrottle,
}

/// Process-wide transfer scheduler.
pub struct Dispatcher {
    store: Arc<dyn RecordStore>,
    remote: Arc<dyn RemoteFileService>,
    fanout: Arc<ProgressFanout>,
    success: Arc<SuccessTracker>,
    config: DispatcherConfig,
    /// Serializes every status mutation.
    actor: AsyncMutex<()>,
    live: Mutex<LiveState>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn RecordStore>,
        remote: Arc<dyn RemoteFileService>,
        fanout: Arc<ProgressFanout>,
        success: Arc<SuccessTracker>,
        config: DispatcherConfig,
    ) -> Self {
        let throttle = PersistThrottle::new(config.persist_step());
        Self {
            store,
            remote,
            fanout,
            success,
            config,
            actor: AsyncMutex::new(()),
            live: Mutex::new(LiveState {
                tasks: HashMap::new(),
                snapshot: ProgressSnapshot::new(),
                throttle,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteFileService> {
        &self.remote
    }

    pub fn fanout(&self) -> &Arc<ProgressFanout> {
        &self.fanout
    }

    pub fn success_tracker(&self) -> &Arc<SuccessTracker> {
        &self.success
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Copy of the progress snapshot.
    pub fn progress_snapshot(&self) -> HashMap<String, f64> {
        self.live().snapshot.to_map()
    }

    pub fn progress_for(&self, key: &str) -> Option<f64> {
        self.live().snapshot.get(key)
    }

    /// Number of transport tasks this process is tracking.
    pub fn live_task_count(&self) -> usize {
        self.live().tasks.len()
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Queues `record` in its `wait*` status.
    ///
    /// Idempotent by `oc_id_transfer`: a record that is already waiting is
    /// left untouched.
    pub async fn enqueue(&self, record: TransferRecord) -> Result<EnqueueOutcome, TransferError> {
        let _actor = self.serialize().await;
        let (outcome, stored) = self.enqueue_locked(record)?;
        if let Some(record) = stored {
            self.fanout
                .broadcast_transfer_change(TransferPhase::Queued, record, None);
        }
        Ok(outcome)
    }

    /// Queues several records as one batch, bracketed by flush-begin and
    /// flush-end. Stops at the first error.
    pub async fn enqueue_many(
        &self,
        records: Vec<TransferRecord>,
    ) -> Result<Vec<EnqueueOutcome>, TransferError> {
        let _actor = self.serialize().await;
        self.fanout.flush_begin();
        let mut outcomes = Vec::with_capacity(records.len());
        let mut queued = Vec::new();
        let mut result = Ok(());
        for record in records {
            match self.enqueue_locked(record) {
                Ok((outcome, stored)) => {
                    outcomes.push(outcome);
                    queued.extend(stored);
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        let mut batch = RecordsByError::new();
        batch.insert(None, queued);
        self.fanout
            .broadcast_transfer_changes(TransferPhase::Queued, batch);
        self.fanout.flush_end();
        result.map(|()| outcomes)
    }

    fn enqueue_locked(
        &self,
        mut record: TransferRecord,
    ) -> Result<(EnqueueOutcome, Option<TransferRecord>), TransferError> {
        let target = record.status;
        if !target.is_waiting() {
            return Err(TransitionError {
                from: TransferStatus::Normal,
                event: TransferEvent::Queue(target),
            }
            .into());
        }

        match self.store.get(&record.oc_id_transfer)? {
            None => {
                record.clear_session();
                record.bytes_transferred = 0;
                record.session_date = Utc::now();
                self.store.insert(record.clone())?;
                debug!(oc_id_transfer = %record.oc_id_transfer, status = ?target, "record queued");
                Ok((EnqueueOutcome::Queued, Some(record)))
            }
            Some(existing) if existing.status.is_waiting() => {
                trace!(oc_id_transfer = %record.oc_id_transfer, "record already queued");
                Ok((EnqueueOutcome::AlreadyQueued, None))
            }
            Some(existing) => {
                let updated = self.store.update(
                    &record.oc_id_transfer,
                    Condition::status(existing.status),
                    &mut |r| {
                        r.transition(TransferEvent::Queue(target))?;
                        r.clear_session();
                        r.bytes_transferred = 0;
                        r.size = record.size;
                        r.session = record.session;
                        r.origin = record.origin;
                        r.destination.clone_from(&record.destination);
                        Ok(())
                    },
                )?;
                let updated =
                    updated.ok_or_else(|| TransferError::NotFound(record.oc_id_transfer.clone()))?;
                debug!(
                    oc_id_transfer = %updated.oc_id_transfer,
                    from = ?existing.status,
                    status = ?updated.status,
                    "record requeued"
                );
                Ok((EnqueueOutcome::Requeued, Some(updated)))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Starts one waiting record now.
    ///
    /// Fails with [`TransferError::TransportUnavailable`] when the record's
    /// session has no eligible network path; the record then stays waiting.
    pub async fn start(&self, oc_id_transfer: &str) -> Result<(), TransferError> {
        let _actor = self.serialize().await;
        self.start_locked(oc_id_transfer).await
    }

    /// Starts a waiting record regardless of the concurrency limit, clearing
    /// a deferred error first.
    pub async fn force_start(&self, oc_id_transfer: &str) -> Result<(), TransferError> {
        let _actor = self.serialize().await;
        let record = self.require(oc_id_transfer)?;
        if record.status.is_metadata_operation() && !record.session_error.is_empty() {
            self.store
                .update(oc_id_transfer, Condition::status(record.status), &mut |r| {
                    r.transition(TransferEvent::Defer)?;
                    r.clear_session();
                    Ok(())
                })?;
        }
        self.start_locked(oc_id_transfer).await
    }

    async fn start_locked(&self, oc_id_transfer: &str) -> Result<(), TransferError> {
        let record = self.require(oc_id_transfer)?;
        if !record.status.is_waiting() {
            return Err(TransitionError {
                from: record.status,
                event: TransferEvent::Begin,
            }
            .into());
        }

        let path = self.remote.network_path();
        if !record.session.allows(path) {
            debug!(
                oc_id_transfer,
                session = ?record.session,
                ?path,
                "no eligible network path"
            );
            return Err(TransferError::TransportUnavailable {
                session: record.session,
            });
        }

        if record.status.is_metadata_operation() {
            return self.perform_locked(record).await;
        }

        // Nothing is persisted until the transport hands back a task, so a
        // start dropped mid-await leaves the record waiting.
        let mut opening = record.clone();
        opening.transition(TransferEvent::Begin)?;
        opening.clear_session();
        opening.bytes_transferred = 0;

        let started = match opening.status.direction() {
            Some(Direction::Download) => self.remote.start_download(&opening).await,
            _ => self.remote.start_upload(&opening).await,
        };

        let handle = match started {
            Ok(handle) => handle,
            Err(TransportFailure::Unavailable) => {
                return Err(TransferError::TransportUnavailable {
                    session: record.session,
                });
            }
            Err(TransportFailure::Cancelled) => {
                let cancelled = self.clear_cancelled(&record)?;
                self.fanout
                    .broadcast_transfer_change(TransferPhase::Cancelled, cancelled, None);
                return Err(TransferError::Cancelled);
            }
            Err(failure) => {
                if let Some(failed) = self.record_start_failure(&record, &failure)? {
                    self.fanout.broadcast_transfer_change(
                        TransferPhase::Failed,
                        failed,
                        Some(failure.message()),
                    );
                }
                return Err(TransferError::from_failure(&failure, record.session));
            }
        };

        let bound = self
            .store
            .update(oc_id_transfer, Condition::status(record.status), &mut |r| {
                r.transition(TransferEvent::Begin)?;
                r.clear_session();
                r.bytes_transferred = 0;
                r.session_task_identifier = handle.task_identifier;
                Ok(())
            });
        let bound = match bound {
            Ok(Some(bound)) => bound,
            Ok(None) => {
                self.remote.cancel(handle);
                return Err(TransferError::NotFound(oc_id_transfer.to_string()));
            }
            Err(e) => {
                self.remote.cancel(handle);
                return Err(e.into());
            }
        };

        {
            let mut live = self.live();
            let key = bound.progress_key();
            live.snapshot.begin(key.clone());
            live.throttle.forget(oc_id_transfer);
            live.tasks
                .insert(handle.task_identifier, LiveTransfer::new(&bound, handle));
            self.fanout.reset_progress(key);
        }
        info!(
            oc_id_transfer,
            task = handle.task_identifier,
            status = ?bound.status,
            "transfer started"
        );
        self.fanout
            .broadcast_transfer_change(TransferPhase::Started, bound, None);
        Ok(())
    }

    async fn perform_locked(&self, record: TransferRecord) -> Result<(), TransferError> {
        let id = record.oc_id_transfer.clone();
        let operation = MetadataOperation::for_record(&record).ok_or(TransitionError {
            from: record.status,
            event: TransferEvent::Succeed,
        })?;
        debug!(oc_id_transfer = %id, ?operation, "performing metadata operation");

        match self.remote.perform(operation, &record).await {
            Ok(()) => {
                record.status.apply(TransferEvent::Succeed)?;
                let condition = Condition::status(record.status);
                let settled = if record.status == TransferStatus::WaitDelete {
                    self.store.delete(&id, condition)?.map(|mut r| {
                        r.status = TransferStatus::Normal;
                        r
                    })
                } else {
                    self.store.update(&id, condition, &mut |r| {
                        r.transition(TransferEvent::Succeed)?;
                        r.clear_session();
                        Ok(())
                    })?
                };
                self.success.mark(&id);
                if let Some(settled) = settled {
                    info!(oc_id_transfer = %id, "metadata operation completed");
                    self.fanout
                        .broadcast_transfer_change(TransferPhase::Succeeded, settled, None);
                }
                Ok(())
            }
            Err(TransportFailure::Unavailable) => Err(TransferError::TransportUnavailable {
                session: record.session,
            }),
            Err(TransportFailure::Cancelled) => {
                let cancelled = self.clear_cancelled(&record)?;
                self.fanout
                    .broadcast_transfer_change(TransferPhase::Cancelled, cancelled, None);
                Err(TransferError::Cancelled)
            }
            Err(failure) => {
                let retry_after = failure
                    .auto_retry()
                    .then(|| self.retry_deadline(Utc::now()));
                let deferred =
                    self.store
                        .update(&id, Condition::status(record.status), &mut |r| {
                            r.transition(TransferEvent::Defer)?;
                            r.session_error = failure.message();
                            r.error_code = failure.code();
                            r.retry_after = retry_after;
                            Ok(())
                        })?;
                if let Some(deferred) = deferred {
                    warn!(
                        oc_id_transfer = %id,
                        code = deferred.error_code,
                        error = %deferred.session_error,
                        "metadata operation deferred"
                    );
                    self.fanout.broadcast_transfer_change(
                        TransferPhase::Deferred,
                        deferred,
                        Some(failure.message()),
                    );
                }
                Err(TransferError::from_failure(&failure, record.session))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Scheduler pass
    // -----------------------------------------------------------------------

    /// Requeues errored records whose backoff elapsed, then starts eligible
    /// waiting records in [`dispatch_order`] up to the concurrency limit.
    pub async fn start_pending(&self) -> Result<PassReport, TransferError> {
        let _actor = self.serialize().await;
        let now = Utc::now();
        let mut report = PassReport {
            requeued: self.requeue_due_locked(now)?,
            ..PassReport::default()
        };

        let active = self
            .store
            .query(&RecordQuery::statuses(TransferStatus::ACTIVE))?
            .len();
        let mut slots = self.config.max_concurrent.saturating_sub(active);

        let mut waiting: Vec<TransferRecord> = self
            .store
            .query(&RecordQuery::statuses(TransferStatus::WAITING))?
            .into_iter()
            .filter(|r| r.dispatchable(now))
            .collect();
        waiting.sort_by(dispatch_order);

        for record in waiting {
            let moves_bytes = !record.status.is_metadata_operation();
            if moves_bytes && slots == 0 {
                report.deferred += 1;
                continue;
            }
            match self.start_locked(&record.oc_id_transfer).await {
                Ok(()) => {
                    report.started += 1;
                    if moves_bytes {
                        slots -= 1;
                    }
                }
                Err(TransferError::TransportUnavailable { .. }) => report.deferred += 1,
                Err(e) => {
                    debug!(oc_id_transfer = %record.oc_id_transfer, error = %e, "start failed");
                    report.failed += 1;
                }
            }
        }

        if report != PassReport::default() {
            info!(
                requeued = report.requeued,
                started = report.started,
                deferred = report.deferred,
                failed = report.failed,
                "dispatch pass finished"
            );
        }
        Ok(report)
    }

    /// Moves errored records whose backoff window elapsed back to waiting.
    pub async fn requeue_due(&self) -> Result<usize, TransferError> {
        let _actor = self.serialize().await;
        self.requeue_due_locked(Utc::now())
    }

    fn requeue_due_locked(&self, now: DateTime<Utc>) -> Result<usize, TransferError> {
        let errored = self
            .store
            .query(&RecordQuery::statuses(TransferStatus::ERRORED))?;
        let mut requeued = Vec::new();
        for record in errored.iter().filter(|r| r.auto_retry_due(now)) {
            if let Some(r) = self.requeue_errored(record)? {
                requeued.push(r);
            }
        }
        let count = requeued.len();
        if count > 0 {
            debug!(count, "auto-retry requeued errored records");
            let mut batch = RecordsByError::new();
            batch.insert(None, requeued);
            self.fanout
                .broadcast_transfer_changes(TransferPhase::Requeued, batch);
        }
        Ok(count)
    }

    fn requeue_errored(
        &self,
        record: &TransferRecord,
    ) -> Result<Option<TransferRecord>, TransferError> {
        let target = match record.status.direction() {
            Some(direction) => direction.waiting(),
            None => return Ok(None),
        };
        let updated = self.store.update(
            &record.oc_id_transfer,
            Condition::status(record.status),
            &mut |r| {
                r.transition(TransferEvent::Queue(target))?;
                r.clear_session();
                r.bytes_transferred = 0;
                Ok(())
            },
        )?;
        Ok(updated)
    }

    /// User retry: re-queues an errored record, or clears the deferred
    /// error of a waiting metadata operation.
    pub async fn retry(&self, oc_id_transfer: &str) -> Result<TransferRecord, TransferError> {
        let _actor = self.serialize().await;
        let record = self.require(oc_id_transfer)?;
        let updated = if record.status.is_error() {
            self.requeue_errored(&record)?
        } else if record.status.is_metadata_operation() {
            self.store
                .update(oc_id_transfer, Condition::status(record.status), &mut |r| {
                    r.transition(TransferEvent::Defer)?;
                    r.clear_session();
                    Ok(())
                })?
        } else {
            return Err(TransitionError {
                from: record.status,
                event: TransferEvent::Queue(record.status),
            }
            .into());
        };
        let updated = updated.ok_or_else(|| TransferError::NotFound(oc_id_transfer.to_string()))?;
        self.fanout
            .broadcast_transfer_change(TransferPhase::Requeued, updated.clone(), None);
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Cancel
    // -----------------------------------------------------------------------

    /// Cancels one record: its transport task (if any) is cancelled, the
    /// progress entry removed and the record cleared.
    pub async fn cancel(&self, oc_id_transfer: &str) -> Result<TransferRecord, TransferError> {
        let _actor = self.serialize().await;
        let cancelled = self.cancel_locked(oc_id_transfer)?;
        self.fanout
            .broadcast_transfer_change(TransferPhase::Cancelled, cancelled.clone(), None);
        Ok(cancelled)
    }

    /// Cancels every active transfer. Returns how many were cancelled.
    pub async fn cancel_all(&self) -> Result<usize, TransferError> {
        let _actor = self.serialize().await;
        let ids = self
            .store
            .query(&RecordQuery::statuses(TransferStatus::ACTIVE))?
            .into_iter()
            .map(|r| r.oc_id_transfer)
            .collect();
        Ok(self.cancel_batch_locked(ids))
    }

    /// Runs [`cancel_all`](Self::cancel_all) on a spawned task so the caller
    /// never waits for it.
    pub fn spawn_cancel_all(self: &Arc<Self>) -> JoinHandle<usize> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.cancel_all().await {
                Ok(count) => count,
                Err(e) => {
                    warn!(error = %e, "cancel all failed");
                    0
                }
            }
        })
    }

    /// Cancels the given records as one batch.
    pub async fn cancel_many(&self, ids: &[String]) -> usize {
        let _actor = self.serialize().await;
        self.cancel_batch_locked(ids.to_vec())
    }

    fn cancel_batch_locked(&self, ids: Vec<String>) -> usize {
        if ids.is_empty() {
            return 0;
        }
        self.fanout.flush_begin();
        let mut cancelled = Vec::with_capacity(ids.len());
        for id in ids {
            match self.cancel_locked(&id) {
                Ok(record) => cancelled.push(record),
                Err(e) => warn!(oc_id_transfer = %id, error = %e, "cancel failed"),
            }
        }
        let count = cancelled.len();
        let mut batch = RecordsByError::new();
        batch.insert(None, cancelled);
        self.fanout
            .broadcast_transfer_changes(TransferPhase::Cancelled, batch);
        self.fanout.flush_end();
        count
    }

    fn cancel_locked(&self, oc_id_transfer: &str) -> Result<TransferRecord, TransferError> {
        let record = self.require(oc_id_transfer)?;
        record.status.apply(TransferEvent::Cancel)?;
        self.release(&record, true);
        let cancelled = self.clear_cancelled(&record)?;
        info!(oc_id_transfer, from = ?record.status, "record cancelled");
        Ok(cancelled)
    }

    /// Clears a cancelled record. Upload-family records are deleted; the
    /// others return to `Normal`.
    fn clear_cancelled(&self, record: &TransferRecord) -> Result<TransferRecord, TransferError> {
        let mut cleared = record.clone();
        cleared.transition(TransferEvent::Cancel)?;
        cleared.clear_session();
        cleared.bytes_transferred = 0;

        let id = &record.oc_id_transfer;
        let condition = Condition::status(record.status);
        let applied = if record.status.direction() == Some(Direction::Upload) {
            self.store.delete(id, condition)?.is_some()
        } else {
            self.store
                .update(id, condition, &mut |r| {
                    r.transition(TransferEvent::Cancel)?;
                    r.clear_session();
                    r.bytes_transferred = 0;
                    Ok(())
                })?
                .is_some()
        };
        if !applied {
            return Err(TransferError::NotFound(id.clone()));
        }
        Ok(cleared)
    }

    // -----------------------------------------------------------------------
    // Transport callbacks
    // -----------------------------------------------------------------------

    /// Progress callback from the transport. Never blocks on observers.
    ///
    /// The byte count is persisted only when progress advanced by at least
    /// the configured step, or on completion.
    pub fn on_progress(&self, task_identifier: u64, bytes_sent: i64, total_bytes_expected: i64) {
        if !self.live().tasks.contains_key(&task_identifier) {
            let Some((adopted, fraction)) = self.adopt(task_identifier) else {
                trace!(task = task_identifier, "progress for unknown task");
                return;
            };
            let mut live = self.live();
            if !live.tasks.contains_key(&task_identifier) {
                live.snapshot.begin(adopted.key.clone());
                live.snapshot.update(&adopted.key, fraction);
                live.tasks.insert(task_identifier, adopted);
            }
        }

        let persist = {
            let mut live = self.live();
            let LiveState {
                tasks,
                snapshot,
                throttle,
            } = &mut *live;
            let Some(transfer) = tasks.get(&task_identifier) else {
                trace!(task = task_identifier, "progress for unknown task");
                return;
            };
            let expected = if total_bytes_expected > 0 {
                total_bytes_expected
            } else {
                transfer.size
            };
            let fraction = if expected > 0 {
                (bytes_sent as f64 / expected as f64).clamp(0.0, 1.0)
            } else {
                0.0
            };
            snapshot.update(&transfer.key, fraction);
            // Published under the lock so a concurrent completion's reset
            // cannot overtake it.
            self.fanout.broadcast_progress(ProgressEvent {
                progress: fraction,
                total_bytes: bytes_sent,
                total_bytes_expected: expected,
                file_name: transfer.file_name.clone(),
                server_url: transfer.server_url.clone(),
                oc_id_transfer: transfer.oc_id_transfer.clone(),
            });
            throttle
                .should_persist(&transfer.oc_id_transfer, fraction)
                .then(|| (transfer.oc_id_transfer.clone(), transfer.status))
        };

        if let Some((id, status)) = persist {
            let result = self.store.update(
                &id,
                Condition::status(status).and_task(task_identifier),
                &mut |r| {
                    r.transition(TransferEvent::Progress)?;
                    r.bytes_transferred = bytes_sent;
                    if total_bytes_expected > 0 {
                        r.size = total_bytes_expected;
                    }
                    Ok(())
                },
            );
            if let Err(e) = result {
                warn!(oc_id_transfer = %id, error = %e, "failed to persist progress");
            }
        }
    }

    /// Completion callback from the transport.
    ///
    /// Success clears the record and marks it in the success tracker;
    /// failure moves it to the matching error status. Errors are logged,
    /// never returned.
    pub async fn on_completion(&self, task_identifier: u64, result: Result<(), TransportFailure>) {
        let _actor = self.serialize().await;
        let transfer = match self.take_task(task_identifier) {
            Some(transfer) => transfer,
            None => match self.adopt(task_identifier) {
                Some((transfer, _)) => transfer,
                None => {
                    debug!(task = task_identifier, "completion for unknown task");
                    return;
                }
            },
        };
        if let Err(e) = self.complete_locked(&transfer, result) {
            warn!(
                oc_id_transfer = %transfer.oc_id_transfer,
                task = task_identifier,
                error = %e,
                "failed to settle completed transfer"
            );
        }
        // A progress callback may have adopted the task while this one was
        // being settled.
        self.take_task(task_identifier);
    }

    /// Finds the active record bound to a task this process never started,
    /// such as a background session task delivered after a relaunch.
    /// Returns its tracking entry and the persisted progress fraction.
    fn adopt(&self, task_identifier: u64) -> Option<(LiveTransfer, f64)> {
        if task_identifier == 0 {
            return None;
        }
        let query =
            RecordQuery::statuses(TransferStatus::ACTIVE).task_identifier(task_identifier);
        let record = match self.store.query(&query) {
            Ok(records) => records.into_iter().next()?,
            Err(e) => {
                warn!(task = task_identifier, error = %e, "task lookup failed");
                return None;
            }
        };
        debug!(
            oc_id_transfer = %record.oc_id_transfer,
            task = task_identifier,
            "adopted transport task from a previous launch"
        );
        let handle = TaskHandle {
            task_identifier,
            session: record.session,
        };
        Some((LiveTransfer::new(&record, handle), record.fraction()))
    }

    fn complete_locked(
        &self,
        transfer: &LiveTransfer,
        result: Result<(), TransportFailure>,
    ) -> Result<(), TransferError> {
        let id = transfer.oc_id_transfer.as_str();
        let task = transfer.handle.task_identifier;
        let record = self.require(id)?;
        if record.session_task_identifier != task || !record.status.is_active() {
            debug!(oc_id_transfer = id, task, status = ?record.status, "stale completion ignored");
            return Ok(());
        }

        match result {
            Ok(()) => {
                let done = self.store.update(
                    id,
                    Condition::status(record.status).and_task(task),
                    &mut |r| {
                        r.transition(TransferEvent::Succeed)?;
                        r.bytes_transferred = r.size.max(r.bytes_transferred);
                        r.clear_session();
                        Ok(())
                    },
                )?;
                if let Some(done) = done {
                    self.success.mark(id);
                    info!(oc_id_transfer = id, task, "transfer completed");
                    self.fanout
                        .broadcast_transfer_change(TransferPhase::Succeeded, done, None);
                }
            }
            Err(TransportFailure::Cancelled) => {
                let cancelled = self.clear_cancelled(&record)?;
                self.fanout
                    .broadcast_transfer_change(TransferPhase::Cancelled, cancelled, None);
            }
            Err(failure) => {
                if let Some(failed) = self.record_failure(&record, &failure)? {
                    self.fanout.broadcast_transfer_change(
                        TransferPhase::Failed,
                        failed,
                        Some(failure.message()),
                    );
                }
            }
        }
        Ok(())
    }

    fn record_failure(
        &self,
        record: &TransferRecord,
        failure: &TransportFailure,
    ) -> Result<Option<TransferRecord>, TransferError> {
        let condition =
            Condition::status(record.status).and_task(record.session_task_identifier);
        self.apply_failure(record, condition, &[TransferEvent::Fail], failure)
    }

    /// A waiting record whose transport task could not be opened goes
    /// straight to its error status.
    fn record_start_failure(
        &self,
        record: &TransferRecord,
        failure: &TransportFailure,
    ) -> Result<Option<TransferRecord>, TransferError> {
        self.apply_failure(
            record,
            Condition::status(record.status),
            &[TransferEvent::Begin, TransferEvent::Fail],
            failure,
        )
    }

    fn apply_failure(
        &self,
        record: &TransferRecord,
        condition: Condition,
        events: &[TransferEvent],
        failure: &TransportFailure,
    ) -> Result<Option<TransferRecord>, TransferError> {
        let retry_after = failure
            .auto_retry()
            .then(|| self.retry_deadline(Utc::now()));
        let updated = self
            .store
            .update(&record.oc_id_transfer, condition, &mut |r| {
                for event in events {
                    r.transition(*event)?;
                }
                r.session_task_identifier = 0;
                r.session_error = failure.message();
                r.error_code = failure.code();
                r.retry_after = retry_after;
                Ok(())
            })?;
        if let Some(r) = &updated {
            warn!(
                oc_id_transfer = %r.oc_id_transfer,
                code = r.error_code,
                error = %r.session_error,
                auto_retry = retry_after.is_some(),
                "transfer failed"
            );
        }
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    /// Acquires the mutation lock. Held by every status-changing operation,
    /// including reconciliation.
    pub(crate) async fn serialize(&self) -> AsyncMutexGuard<'_, ()> {
        self.actor.lock().await
    }

    /// Drops in-memory tracking for `record` and resets its progress key.
    /// With `cancel_task`, the bound transport task is cancelled too.
    pub(crate) fn release(&self, record: &TransferRecord, cancel_task: bool) {
        let key = record.progress_key();
        let tracked = {
            let mut live = self.live();
            live.snapshot.remove(&key);
            live.throttle.forget(&record.oc_id_transfer);
            let tracked = live.tasks.remove(&record.session_task_identifier);
            self.fanout.reset_progress(key);
            tracked
        };
        if !cancel_task {
            return;
        }
        let handle = tracked.map(|t| t.handle).or_else(|| {
            (record.session_task_identifier != 0).then_some(TaskHandle {
                task_identifier: record.session_task_identifier,
                session: record.session,
            })
        });
        if let Some(handle) = handle {
            debug!(oc_id_transfer = %record.oc_id_transfer, task = handle.task_identifier, "cancelling transport task");
            self.remote.cancel(handle);
        }
    }

    fn take_task(&self, task_identifier: u64) -> Option<LiveTransfer> {
        let mut live = self.live();
        let transfer = live.tasks.remove(&task_identifier)?;
        live.snapshot.remove(&transfer.key);
        live.throttle.forget(&transfer.oc_id_transfer);
        self.fanout.reset_progress(transfer.key.clone());
        Some(transfer)
    }

    pub(crate) fn retry_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.config.retry_backoff().as_secs() as i64;
        now + chrono::Duration::seconds(secs)
    }

    fn require(&self, oc_id_transfer: &str) -> Result<TransferRecord, TransferError> {
        self.store
            .get(oc_id_transfer)?
            .ok_or_else(|| TransferError::NotFound(oc_id_transfer.to_string()))
    }

    fn live(&self) -> MutexGuard<'_, LiveState> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
