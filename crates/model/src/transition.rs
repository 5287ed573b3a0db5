//! Per-record state machine.
//!
//! Every status mutation goes through [`TransferStatus::apply`]. An edge
//! that is not listed here is rejected with a [`TransitionError`] instead of
//! being applied silently.

use crate::status::TransferStatus;

/// An event that moves a record from one status to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    /// Queue the record into the given wait status. Allowed from `Normal`
    /// into any wait status, and from an error status back into the wait
    /// status of the same direction (retry).
    Queue(TransferStatus),
    /// The dispatcher picked up a waiting download or upload.
    Begin,
    /// Bytes moved on an active transfer.
    Progress,
    /// Transport or remote operation reported success.
    Succeed,
    /// Transport reported a failure for an active transfer.
    Fail,
    /// A metadata operation failed but stays queued.
    Defer,
    /// An active transfer goes back to waiting (session lost while
    /// resumable, or start rolled back).
    Requeue,
    /// Explicit user or system cancellation.
    Cancel,
}

/// An edge that the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition from {from:?} on {event:?}")]
pub struct TransitionError {
    pub from: TransferStatus,
    pub event: TransferEvent,
}

impl TransferStatus {
    /// Returns the status reached by applying `event`, or an error for an
    /// illegal edge.
    pub fn apply(self, event: TransferEvent) -> Result<TransferStatus, TransitionError> {
        use TransferEvent as E;
        use TransferStatus as S;

        let illegal = TransitionError { from: self, event };
        match event {
            E::Queue(target) => {
                if !target.is_waiting() {
                    return Err(illegal);
                }
                match self {
                    S::Normal => Ok(target),
                    s if s.is_error() && s.direction() == target.direction() => Ok(target),
                    _ => Err(illegal),
                }
            }
            E::Begin => match self {
                S::WaitDownload => Ok(S::Downloading),
                S::WaitUpload => Ok(S::Uploading),
                _ => Err(illegal),
            },
            E::Progress if self.is_active() => Ok(self),
            E::Succeed if self.is_active() || self.is_metadata_operation() => Ok(S::Normal),
            E::Defer if self.is_metadata_operation() => Ok(self),
            E::Fail | E::Requeue => match (self.is_active(), self.direction()) {
                (true, Some(dir)) if event == E::Fail => Ok(dir.errored()),
                (true, Some(dir)) => Ok(dir.waiting()),
                _ => Err(illegal),
            },
            E::Cancel if self != S::Normal => Ok(S::Normal),
            _ => Err(illegal),
        }
    }

    /// Returns `true` if `event` is a legal edge from this status.
    pub fn can_apply(self, event: TransferEvent) -> bool {
        self.apply(event).is_ok()
    }
}
