//! Feed for the transfers panel.
//!
//! While the panel is visible a background task keeps a `watch` channel
//! filled with one [`PanelRow`] per pending record. It refreshes on every
//! store change and on a fixed tick (retry countdowns move even when the
//! store does not). Closing or dropping the [`TransfersPanel`] stops the
//! task without waiting for the next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vaultsync_model::{TransferRecord, TransferStatus};
use vaultsync_store::{RecordQuery, RecordStore};

use crate::dispatcher::Dispatcher;
use crate::reconcile::Reconciler;
use crate::TransferError;

/// One line of the transfers panel.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelRow {
    pub oc_id_transfer: String,
    pub file_name: String,
    pub server_url: String,
    pub status: TransferStatus,
    pub status_text: String,
    /// Fraction in `[0, 1]`.
    pub progress: f64,
    /// Remaining backoff before an automatic retry, for errored records
    /// and deferred metadata operations alike.
    pub retry_in: Option<Duration>,
    pub error: Option<String>,
    pub can_cancel: bool,
    pub can_force_start: bool,
}

impl PanelRow {
    fn new(record: &TransferRecord, snapshot: &HashMap<String, f64>, now: DateTime<Utc>) -> Self {
        let progress = snapshot
            .get(&record.progress_key())
            .copied()
            .unwrap_or_else(|| record.fraction());
        let retry_in = record.retry_countdown(now);
        let error = (!record.session_error.is_empty()).then(|| record.session_error.clone());

        let label = record.status.label();
        let status_text = if record.status.is_active() {
            format!("{label} {:.0}%", progress * 100.0)
        } else if let Some(left) = retry_in {
            format!("{label}, retry in {}s", left.as_secs().max(1))
        } else {
            label.to_string()
        };

        Self {
            oc_id_transfer: record.oc_id_transfer.clone(),
            file_name: record.file_name_view.clone(),
            server_url: record.server_url.clone(),
            status: record.status,
            status_text,
            progress,
            retry_in,
            error,
            can_cancel: record.status.is_active() || record.status.is_waiting(),
            can_force_start: record.status.is_waiting(),
        }
    }
}

/// Builds the panel rows for every non-idle record, oldest first.
pub fn build_rows(
    records: &[TransferRecord],
    snapshot: &HashMap<String, f64>,
    now: DateTime<Utc>,
) -> Vec<PanelRow> {
    let mut pending: Vec<&TransferRecord> = records
        .iter()
        .filter(|r| r.status != TransferStatus::Normal)
        .collect();
    pending.sort_by(|a, b| {
        a.session_date
            .cmp(&b.session_date)
            .then_with(|| a.oc_id_transfer.cmp(&b.oc_id_transfer))
    });
    pending
        .into_iter()
        .map(|r| PanelRow::new(r, snapshot, now))
        .collect()
}

/// Handle to an open transfers panel feed.
pub struct TransfersPanel {
    rows: watch::Receiver<Vec<PanelRow>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TransfersPanel {
    /// Opens the feed. A reconciliation pass runs before the first rows
    /// are published.
    pub fn open(reconciler: Reconciler) -> Self {
        let (tx, rows) = watch::channel(Vec::new());
        let cancel = CancellationToken::new();
        let period = reconciler.dispatcher().config().panel_poll_interval();
        let task = tokio::spawn(feed_loop(reconciler, tx, cancel.clone(), period));
        Self {
            rows,
            cancel,
            task: Some(task),
        }
    }

    /// Latest published rows.
    pub fn rows(&self) -> Vec<PanelRow> {
        self.rows.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PanelRow>> {
        self.rows.clone()
    }

    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stops the feed and waits for its task to exit.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "transfers panel task failed");
        }
    }
}

impl Drop for TransfersPanel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn feed_loop(
    reconciler: Reconciler,
    tx: watch::Sender<Vec<PanelRow>>,
    cancel: CancellationToken,
    period: Duration,
) {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = reconciler.reconcile() => {
            if let Err(e) = result {
                warn!(error = %e, "reconciliation on panel open failed");
            }
        }
    }

    let dispatcher = Arc::clone(reconciler.dispatcher());
    let mut changes = dispatcher.store().observe(RecordQuery::all());
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.reset();

    loop {
        match snapshot_rows(&dispatcher) {
            Ok(rows) => {
                tx.send_replace(rows);
            }
            Err(e) => warn!(error = %e, "failed to refresh transfers panel"),
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            change = changes.next() => {
                if change.is_none() {
                    break;
                }
            }
        }
    }
    debug!("transfers panel feed stopped");
}

fn snapshot_rows(dispatcher: &Dispatcher) -> Result<Vec<PanelRow>, TransferError> {
    let records = dispatcher.store().query(&RecordQuery::all())?;
    let snapshot = dispatcher.progress_snapshot();
    Ok(build_rows(&records, &snapshot, Utc::now()))
}
