//! Zombie reconciliation.
//!
//! When the app is suspended the OS may tear down transport tasks without
//! reporting a completion. On the next launch (or when the transfers panel
//! opens) the store can therefore contain records stuck in `downloading` /
//! `uploading` whose task no longer exists. A pass compares the active
//! records with the transport's live task list and repairs the ones that
//! lost their task.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use vaultsync_model::{TransferEvent, TransferRecord, TransferStatus};
use vaultsync_store::{Condition, RecordQuery, RecordStore};

use crate::TransferError;
use crate::dispatcher::Dispatcher;
use crate::fanout::TransferPhase;

/// Error stored on records whose task vanished and cannot resume.
pub const SESSION_LOST_MESSAGE: &str = "session lost";

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Active records whose task is still alive.
    pub consistent: usize,
    /// Zombies put back in their waiting status.
    pub requeued: usize,
    /// Zombies moved to their error status.
    pub failed: usize,
    /// Records that changed under the pass and were left alone.
    pub skipped: usize,
}

impl ReconcileReport {
    pub fn repaired(&self) -> usize {
        self.requeued + self.failed
    }
}

/// Repairs active records whose transport task disappeared.
///
/// A pass is idempotent: running it twice in a row changes nothing the
/// second time.
#[derive(Clone)]
pub struct Reconciler {
    dispatcher: Arc<Dispatcher>,
}

impl Reconciler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Runs one pass. Mutations are serialized with the dispatcher, so a
    /// completion arriving mid-pass is applied either before or after it.
    pub async fn reconcile(&self) -> Result<ReconcileReport, TransferError> {
        let _actor = self.dispatcher.serialize().await;
        let store = self.dispatcher.store();
        let active = store.query(&RecordQuery::statuses(TransferStatus::ACTIVE))?;
        let mut report = ReconcileReport::default();
        if active.is_empty() {
            return Ok(report);
        }

        let live: HashSet<u64> = self
            .dispatcher
            .remote()
            .list_live_tasks()
            .await
            .into_iter()
            .collect();

        for record in active {
            let task = record.session_task_identifier;
            if task != 0 && live.contains(&task) {
                report.consistent += 1;
                continue;
            }
            match self.repair(&record)? {
                Some(TransferPhase::Requeued) => report.requeued += 1,
                Some(_) => report.failed += 1,
                None => report.skipped += 1,
            }
        }

        if report.repaired() > 0 {
            info!(
                consistent = report.consistent,
                requeued = report.requeued,
                failed = report.failed,
                "reconciled zombie transfers"
            );
        } else {
            debug!(consistent = report.consistent, "no zombie transfers");
        }
        Ok(report)
    }

    fn repair(&self, record: &TransferRecord) -> Result<Option<TransferPhase>, TransferError> {
        let dispatcher = &self.dispatcher;
        let id = record.oc_id_transfer.as_str();
        let task = record.session_task_identifier;
        let moved = record.bytes_transferred > 0
            || dispatcher
                .progress_for(&record.progress_key())
                .is_some_and(|p| p > 0.0);
        let resumable = moved && dispatcher.remote().supports_resume(record);
        // Active but never bound to a task: nothing reached the transport.
        let never_opened = task == 0 && !moved;
        let condition = Condition::status(record.status).and_task(task);

        let (phase, updated) = if resumable || never_opened {
            let updated = dispatcher.store().update(id, condition, &mut |r| {
                r.transition(TransferEvent::Requeue)?;
                r.clear_session();
                Ok(())
            })?;
            (TransferPhase::Requeued, updated)
        } else {
            let updated = dispatcher.store().update(id, condition, &mut |r| {
                r.transition(TransferEvent::Fail)?;
                r.session_task_identifier = 0;
                r.session_error = TransferError::SessionLost.to_string();
                r.error_code = 0;
                r.retry_after = None;
                Ok(())
            })?;
            (TransferPhase::Failed, updated)
        };

        let Some(updated) = updated else {
            debug!(oc_id_transfer = id, "record changed during reconciliation");
            return Ok(None);
        };
        // The task is already gone; only the in-memory tracking is dropped.
        dispatcher.release(record, false);

        let error =
            (phase == TransferPhase::Failed).then(|| TransferError::SessionLost.to_string());
        if error.is_some() {
            warn!(oc_id_transfer = id, task, status = ?updated.status, "zombie transfer failed");
        } else {
            debug!(oc_id_transfer = id, task, status = ?updated.status, "zombie transfer requeued");
        }
        dispatcher
            .fanout()
            .broadcast_transfer_change(phase, updated, error);
        Ok(Some(phase))
    }
}
