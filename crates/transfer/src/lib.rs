//! Transfer pipeline core: dispatcher, record state machine driver,
//! progress fan-out, success tracking and zombie reconciliation.
//!
//! # Flow
//!
//! 1. **Enqueue**: a user action or the auto-upload scan queues a record
//!    in a `wait*` status.
//! 2. **Dispatch**: a scheduler pass picks eligible records in
//!    [`dispatch_order`] and opens transport tasks through the
//!    [`RemoteFileService`].
//! 3. **Progress**: transport callbacks feed [`Dispatcher::on_progress`],
//!    which updates the [`ProgressSnapshot`] and fans out to observers.
//! 4. **Complete**: [`Dispatcher::on_completion`] settles the record and
//!    marks it in the [`SuccessTracker`], or records the failure.
//! 5. **Reconcile**: the [`Reconciler`] repairs records whose transport
//!    task disappeared while the app was suspended.

mod config;
mod dispatcher;
mod fanout;
mod main_context;
mod panel;
mod policy;
mod progress;
mod reconcile;
mod remote;
mod success;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{DispatcherConfig, MIN_PERSIST_STEP};
pub use dispatcher::{Dispatcher, EnqueueOutcome, PassReport};
pub use fanout::{
    DelegateToken, FanoutEvent, ProgressEvent, ProgressFanout, RecordsByError, TransferDelegate,
    TransferPhase,
};
pub use main_context::{MainContext, MainQueue};
pub use panel::{PanelRow, TransfersPanel, build_rows};
pub use policy::dispatch_order;
pub use progress::{PersistThrottle, ProgressSnapshot};
pub use reconcile::{ReconcileReport, Reconciler, SESSION_LOST_MESSAGE};
pub use remote::{BoxFuture, MetadataOperation, RemoteFileService, TaskHandle, TransportFailure};
pub use success::SuccessTracker;

use vaultsync_model::{Session, TransitionError};
use vaultsync_store::StoreError;

/// Errors surfaced by dispatcher operations.
///
/// Completion callbacks never return these; their failures are written to
/// the record instead.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no network path available for {session:?} session")]
    TransportUnavailable { session: Session },

    #[error("remote rejected the operation ({code}): {message}")]
    RemoteRejected { code: i32, message: String },

    #[error("transport interrupted ({code}): {message}")]
    Interrupted { code: i32, message: String },

    /// The OS dropped the transport task and the transfer cannot resume.
    /// Its message is what reconciliation stores on the record.
    #[error("{}", reconcile::SESSION_LOST_MESSAGE)]
    SessionLost,

    #[error("cancelled")]
    Cancelled,

    #[error("record not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    IllegalTransition(#[from] TransitionError),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl TransferError {
    /// Maps a transport failure onto the error returned to callers.
    pub fn from_failure(failure: &TransportFailure, session: Session) -> Self {
        match failure {
            TransportFailure::Unavailable => Self::TransportUnavailable { session },
            TransportFailure::Rejected { code, message } => Self::RemoteRejected {
                code: *code,
                message: message.clone(),
            },
            TransportFailure::Interrupted { code, message } => Self::Interrupted {
                code: *code,
                message: message.clone(),
            },
            TransportFailure::Cancelled => Self::Cancelled,
        }
    }
}

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transition(t) => Self::IllegalTransition(t),
            other => Self::Store(other),
        }
    }
}
