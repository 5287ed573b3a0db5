//! Delegate registry and progress fan-out.
//!
//! The dispatcher publishes events here from whatever task produced them.
//! Delivery to observers always happens on the [`MainContext`], in the
//! order the events were published. Observers are held weakly and
//! addressed by [`DelegateToken`]; dead observers are pruned on the next
//! broadcast.

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::broadcast;
use tracing::{trace, warn};
use vaultsync_model::TransferRecord;

use crate::main_context::MainContext;

/// Capacity of the typed event bus.
const EVENT_BUS_CAPACITY: usize = 256;

/// One progress sample for a file.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub progress: f64,
    pub total_bytes: i64,
    pub total_bytes_expected: i64,
    pub file_name: String,
    pub server_url: String,
    pub oc_id_transfer: String,
}

impl ProgressEvent {
    pub fn key(&self) -> String {
        vaultsync_model::progress_key(&self.server_url, &self.file_name)
    }
}

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferPhase {
    Queued,
    Started,
    Succeeded,
    Failed,
    Deferred,
    Requeued,
    Cancelled,
}

/// Records of a batch change grouped by error message (`None` = no error).
pub type RecordsByError = BTreeMap<Option<String>, Vec<TransferRecord>>;

/// Observer contract. Every method has an empty default.
pub trait TransferDelegate: Send + Sync {
    fn transfer_progress(&self, _event: &ProgressEvent) {}

    fn transfer_change(&self, _phase: TransferPhase, _record: &TransferRecord, _error: Option<&str>) {}

    fn transfer_changes(&self, _phase: TransferPhase, _records: &RecordsByError) {}

    fn flush_begin(&self) {}

    fn flush_end(&self) {}
}

/// Typed event mirrored onto the broadcast bus after delegate delivery.
#[derive(Debug, Clone)]
pub enum FanoutEvent {
    Progress(ProgressEvent),
    Change {
        phase: TransferPhase,
        record: TransferRecord,
        error: Option<String>,
    },
    Batch {
        phase: TransferPhase,
        records: RecordsByError,
    },
    ProgressReset {
        key: String,
    },
    FlushBegin,
    FlushEnd,
}

/// Identifies a registered delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DelegateToken(u64);

#[derive(Default)]
struct DelegateRegistry {
    entries: Vec<(DelegateToken, Weak<dyn TransferDelegate>)>,
    next_token: u64,
}

impl DelegateRegistry {
    fn add(&mut self, delegate: &Arc<dyn TransferDelegate>) -> DelegateToken {
        let weak = Arc::downgrade(delegate);
        if let Some((token, _)) = self.entries.iter().find(|(_, w)| w.ptr_eq(&weak)) {
            return *token;
        }
        self.next_token += 1;
        let token = DelegateToken(self.next_token);
        self.entries.push((token, weak));
        token
    }

    fn remove(&mut self, token: DelegateToken) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(t, _)| *t != token);
        self.entries.len() != before
    }

    /// Upgrades live entries and prunes dead ones.
    fn live(&mut self) -> Vec<(DelegateToken, Arc<dyn TransferDelegate>)> {
        let mut live = Vec::with_capacity(self.entries.len());
        self.entries.retain(|(token, weak)| match weak.upgrade() {
            Some(delegate) => {
                live.push((*token, delegate));
                true
            }
            None => {
                trace!(token = token.0, "pruning dead delegate");
                false
            }
        });
        live
    }
}

struct FanoutShared {
    registry: Mutex<DelegateRegistry>,
    /// Last delivered progress per key. Only touched on the main context.
    delivered: Mutex<HashMap<String, f64>>,
    bus: broadcast::Sender<FanoutEvent>,
}

impl FanoutShared {
    fn deliver(&self, event: FanoutEvent) {
        if let FanoutEvent::Progress(p) = &event {
            let mut delivered = self.delivered.lock().unwrap_or_else(PoisonError::into_inner);
            let key = p.key();
            if delivered.get(&key).is_some_and(|last| p.progress < *last) {
                trace!(%key, progress = p.progress, "dropping regressing progress");
                return;
            }
            delivered.insert(key, p.progress);
        }
        if let FanoutEvent::ProgressReset { key } = &event {
            self.delivered
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(key);
        }

        let delegates = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live();
        for (token, delegate) in delegates {
            let outcome = catch_unwind(AssertUnwindSafe(|| match &event {
                FanoutEvent::Progress(p) => delegate.transfer_progress(p),
                FanoutEvent::Change {
                    phase,
                    record,
                    error,
                } => delegate.transfer_change(*phase, record, error.as_deref()),
                FanoutEvent::Batch { phase, records } => delegate.transfer_changes(*phase, records),
                FanoutEvent::FlushBegin => delegate.flush_begin(),
                FanoutEvent::FlushEnd => delegate.flush_end(),
                FanoutEvent::ProgressReset { .. } => {}
            }));
            if outcome.is_err() {
                warn!(token = token.0, "delegate panicked during delivery");
            }
        }

        let _ = self.bus.send(event);
    }
}

/// Fans transfer events out to every registered observer.
pub struct ProgressFanout {
    main: MainContext,
    shared: Arc<FanoutShared>,
}

impl ProgressFanout {
    pub fn new(main: MainContext) -> Self {
        let (bus, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            main,
            shared: Arc::new(FanoutShared {
                registry: Mutex::new(DelegateRegistry::default()),
                delivered: Mutex::new(HashMap::new()),
                bus,
            }),
        }
    }

    /// Registers an observer. Registering the same observer again returns
    /// its existing token.
    pub fn add_delegate(&self, delegate: &Arc<dyn TransferDelegate>) -> DelegateToken {
        self.registry().add(delegate)
    }

    /// Deregisters an observer. Unknown tokens are ignored.
    pub fn remove_delegate(&self, token: DelegateToken) -> bool {
        self.registry().remove(token)
    }

    /// Number of registered delegates, including dead ones not yet pruned.
    pub fn delegate_count(&self) -> usize {
        self.registry().entries.len()
    }

    /// Subscribes to the typed event bus.
    pub fn subscribe(&self) -> broadcast::Receiver<FanoutEvent> {
        self.shared.bus.subscribe()
    }

    pub fn broadcast_progress(&self, event: ProgressEvent) {
        self.publish(FanoutEvent::Progress(event));
    }

    /// Forgets the last delivered value for `key` so a new transfer
    /// generation may start again from zero.
    pub fn reset_progress(&self, key: String) {
        self.publish(FanoutEvent::ProgressReset { key });
    }

    pub fn broadcast_transfer_change(
        &self,
        phase: TransferPhase,
        record: TransferRecord,
        error: Option<String>,
    ) {
        self.publish(FanoutEvent::Change {
            phase,
            record,
            error,
        });
    }

    pub fn broadcast_transfer_changes(&self, phase: TransferPhase, records: RecordsByError) {
        if records.values().all(Vec::is_empty) {
            return;
        }
        self.publish(FanoutEvent::Batch { phase, records });
    }

    pub fn flush_begin(&self) {
        self.publish(FanoutEvent::FlushBegin);
    }

    pub fn flush_end(&self) {
        self.publish(FanoutEvent::FlushEnd);
    }

    /// Resolves once every event published before this call was delivered.
    pub async fn flushed(&self) {
        self.main.barrier().await;
    }

    fn publish(&self, event: FanoutEvent) {
        let shared = Arc::clone(&self.shared);
        if !self.main.dispatch(move || shared.deliver(event)) {
            warn!("main context closed, dropping fan-out event");
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, DelegateRegistry> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
