//! Seams to the OS background task scheduler and to the host app.

use std::time::Duration;

use vaultsync_model::TransferRecord;
use vaultsync_transfer::BoxFuture;

/// Kind of OS background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Short wake used for the auto-upload scan.
    Refresh,
    /// Long, deferrable wake used for queue maintenance.
    Processing,
}

/// A wake request handed to the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub identifier: String,
    pub kind: TaskKind,
    /// Minimum delay from now before the OS may run the task.
    pub earliest_begin: Duration,
    pub requires_network: bool,
    pub requires_external_power: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("too many pending task requests")]
    TooManyPendingRequests,

    #[error("background tasks not permitted")]
    NotPermitted,

    #[error("task identifier not registered: {0}")]
    NotRegistered(String),

    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
}

/// OS background task scheduler.
pub trait OsTaskScheduler: Send + Sync {
    /// Registers a launch handler for `identifier`. Must happen before the
    /// app finishes launching.
    fn register(&self, identifier: &str, kind: TaskKind) -> Result<(), ScheduleError>;

    /// Submits a one-shot wake request. A pending request with the same
    /// identifier is replaced.
    fn submit(&self, request: TaskRequest) -> Result<(), ScheduleError>;
}

/// Supplies the account whose queue the background tasks work on.
pub trait AccountSource: Send + Sync {
    fn active_account(&self) -> Option<String>;
}

/// Finds new local assets to upload for an account.
pub trait AutoUploadScanner: Send + Sync {
    /// Returns records to queue, in a `wait*` status.
    fn scan(&self, account: &str) -> BoxFuture<'_, Vec<TransferRecord>>;
}
