//! Remote file service seam.
//!
//! The host app implements [`RemoteFileService`] on top of its HTTP/WebDAV
//! client and background URL sessions. Progress and completion are
//! reported back through [`Dispatcher::on_progress`] and
//! [`Dispatcher::on_completion`].
//!
//! [`Dispatcher::on_progress`]: crate::Dispatcher::on_progress
//! [`Dispatcher::on_completion`]: crate::Dispatcher::on_completion

use std::future::Future;
use std::pin::Pin;

use vaultsync_model::{NetworkPath, Session, TransferRecord, TransferStatus};

/// Boxed future returned by the service methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handle to a live transport task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    /// OS task identifier, never 0.
    pub task_identifier: u64,
    pub session: Session,
}

/// Failure reported by the remote service for a start, a transfer or a
/// metadata operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// No network path satisfies the session constraints.
    Unavailable,
    /// Definitive server error (conflict, permission denied, ...).
    Rejected { code: i32, message: String },
    /// Transient transport error (timeout, connection reset, 5xx).
    Interrupted { code: i32, message: String },
    /// The task was cancelled.
    Cancelled,
}

impl TransportFailure {
    /// Error code persisted on the record.
    pub fn code(&self) -> i32 {
        match self {
            Self::Rejected { code, .. } | Self::Interrupted { code, .. } => *code,
            Self::Unavailable | Self::Cancelled => 0,
        }
    }

    /// Message persisted in `session_error`.
    pub fn message(&self) -> String {
        match self {
            Self::Unavailable => "network unavailable".into(),
            Self::Rejected { message, .. } | Self::Interrupted { message, .. } => message.clone(),
            Self::Cancelled => "cancelled".into(),
        }
    }

    /// Returns `true` if the failure may be retried automatically after the
    /// backoff window.
    pub fn auto_retry(&self) -> bool {
        matches!(self, Self::Unavailable | Self::Interrupted { .. })
    }
}

/// A remote call that moves no bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataOperation {
    CreateFolder,
    Favorite,
    Copy { destination: String },
    Move { destination: String },
    Rename { new_name: String },
    Delete,
}

impl MetadataOperation {
    /// Maps a waiting record to the remote call it stands for.
    pub fn for_record(record: &TransferRecord) -> Option<Self> {
        let destination = record.destination.clone();
        match record.status {
            TransferStatus::WaitCreateFolder => Some(Self::CreateFolder),
            TransferStatus::WaitFavorite => Some(Self::Favorite),
            TransferStatus::WaitCopy => Some(Self::Copy { destination }),
            TransferStatus::WaitMove => Some(Self::Move { destination }),
            TransferStatus::WaitRename => Some(Self::Rename {
                new_name: destination,
            }),
            TransferStatus::WaitDelete => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Client for the remote file service.
///
/// Implementations clone what they need out of `record`; the returned
/// futures only borrow `self`.
pub trait RemoteFileService: Send + Sync {
    /// Opens an upload task for `record`.
    fn start_upload(
        &self,
        record: &TransferRecord,
    ) -> BoxFuture<'_, Result<TaskHandle, TransportFailure>>;

    /// Opens a download task for `record`.
    fn start_download(
        &self,
        record: &TransferRecord,
    ) -> BoxFuture<'_, Result<TaskHandle, TransportFailure>>;

    /// Executes a metadata operation and waits for the server answer.
    fn perform(
        &self,
        operation: MetadataOperation,
        record: &TransferRecord,
    ) -> BoxFuture<'_, Result<(), TransportFailure>>;

    /// Requests cancellation of a task. Must not wait for teardown.
    fn cancel(&self, handle: TaskHandle);

    /// Identifiers of transport tasks that are still alive.
    fn list_live_tasks(&self) -> BoxFuture<'_, Vec<u64>>;

    /// Currently available network path.
    fn network_path(&self) -> NetworkPath;

    /// Returns `true` if an interrupted transfer of `record` can resume.
    fn supports_resume(&self, record: &TransferRecord) -> bool;
}
