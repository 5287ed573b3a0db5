//! The persisted transfer record.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::status::TransferStatus;
use crate::transition::{TransferEvent, TransitionError};

/// Logical transport channel a record is bound to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Session {
    /// Foreground session used while the app is active.
    #[default]
    Foreground,
    /// Background session, any network path.
    Background,
    /// Background session restricted to unmetered (non-cellular) paths.
    BackgroundWwan,
    /// Session owned by a share / file-provider extension.
    Extension,
}

/// Network path currently available to the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkPath {
    Offline,
    Cellular,
    Unmetered,
}

impl Session {
    /// Returns `true` if a transfer bound to this session may run on `path`.
    pub fn allows(self, path: NetworkPath) -> bool {
        match (self, path) {
            (_, NetworkPath::Offline) => false,
            (Session::BackgroundWwan, NetworkPath::Cellular) => false,
            _ => true,
        }
    }
}

/// Who asked for the operation. User-initiated records are dispatched first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Origin {
    #[default]
    User,
    Automatic,
}

/// One persisted file operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    /// Identifies the file object on the remote service.
    pub oc_id: String,
    /// Identifies this transfer attempt; primary key of the store.
    pub oc_id_transfer: String,
    pub account: String,
    pub server_url: String,
    pub file_name: String,
    pub file_name_view: String,
    pub status: TransferStatus,
    #[serde(default)]
    pub session: Session,
    pub session_date: DateTime<Utc>,
    #[serde(default)]
    pub session_error: String,
    /// OS task identifier of the live transport task; 0 when unbound.
    #[serde(default)]
    pub session_task_identifier: u64,
    /// Expected total byte count.
    pub size: i64,
    #[serde(default)]
    pub bytes_transferred: i64,
    /// Last remote-service error code; 0 means none.
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub origin: Origin,
    /// Instant after which an errored record may be retried automatically.
    /// `None` means no automatic retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
    /// Destination for copy/move/rename operations.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination: String,
}

impl TransferRecord {
    /// Creates a record queued in `status` with a fresh transfer identifier.
    pub fn new(
        oc_id: impl Into<String>,
        account: impl Into<String>,
        server_url: impl Into<String>,
        file_name: impl Into<String>,
        status: TransferStatus,
    ) -> Self {
        let file_name = file_name.into();
        Self {
            oc_id: oc_id.into(),
            oc_id_transfer: uuid::Uuid::new_v4().to_string(),
            account: account.into(),
            server_url: server_url.into(),
            file_name_view: file_name.clone(),
            file_name,
            status,
            session: Session::default(),
            session_date: Utc::now(),
            session_error: String::new(),
            session_task_identifier: 0,
            size: 0,
            bytes_transferred: 0,
            error_code: 0,
            origin: Origin::default(),
            retry_after: None,
            destination: String::new(),
        }
    }

    pub fn with_transfer_id(mut self, id: impl Into<String>) -> Self {
        self.oc_id_transfer = id.into();
        self
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = size;
        self
    }

    pub fn with_session(mut self, session: Session) -> Self {
        self.session = session;
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    /// Key used by the in-memory progress snapshot.
    pub fn progress_key(&self) -> String {
        progress_key(&self.server_url, &self.file_name)
    }

    /// Applies a state-machine event. `session_date` is stamped only when
    /// the status actually changes.
    pub fn transition(&mut self, event: TransferEvent) -> Result<(), TransitionError> {
        let next = self.status.apply(event)?;
        if next != self.status {
            self.status = next;
            self.session_date = Utc::now();
        }
        Ok(())
    }

    /// Returns `true` if a waiting record may be picked up by a scheduler
    /// pass at `now`. Records deferred with an error and no retry stamp wait
    /// for an explicit user retry.
    pub fn dispatchable(&self, now: DateTime<Utc>) -> bool {
        if !self.status.is_waiting() {
            return false;
        }
        match self.retry_after {
            Some(after) => after <= now,
            None => self.session_error.is_empty(),
        }
    }

    /// Fraction of bytes moved, in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.size <= 0 {
            return 0.0;
        }
        (self.bytes_transferred as f64 / self.size as f64).clamp(0.0, 1.0)
    }

    /// Remaining backoff window, if the record is inside one.
    pub fn retry_countdown(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        let after = self.retry_after?;
        let remaining: ChronoDuration = after - now;
        remaining.to_std().ok().filter(|d| !d.is_zero())
    }

    /// Returns `true` if the record is errored and its backoff window elapsed.
    pub fn auto_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_error() && self.retry_after.is_some_and(|after| after <= now)
    }

    /// Clears session binding and error fields.
    pub fn clear_session(&mut self) {
        self.session_task_identifier = 0;
        self.session_error.clear();
        self.error_code = 0;
        self.retry_after = None;
    }
}

/// Builds the `"serverUrl|fileName"` progress key.
pub fn progress_key(server_url: &str, file_name: &str) -> String {
    format!("{server_url}|{file_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload() -> TransferRecord {
        TransferRecord::new(
            "oc1",
            "alice@cloud",
            "https://cloud/remote.php/dav/files/alice",
            "a.jpg",
            TransferStatus::WaitUpload,
        )
        .with_size(1000)
    }

    #[test]
    fn new_record_has_unique_transfer_id() {
        let a = upload();
        let b = upload();
        assert_ne!(a.oc_id_transfer, b.oc_id_transfer);
        assert_eq!(a.oc_id, b.oc_id);
        assert_eq!(a.file_name_view, "a.jpg");
    }

    #[test]
    fn progress_key_format() {
        let r = upload();
        assert_eq!(
            r.progress_key(),
            "https://cloud/remote.php/dav/files/alice|a.jpg"
        );
    }

    #[test]
    fn transition_rejects_illegal_edge() {
        let mut r = upload();
        r.status = TransferStatus::Normal;
        assert!(r.transition(TransferEvent::Begin).is_err());
        assert_eq!(r.status, TransferStatus::Normal);
    }

    #[test]
    fn fraction_is_clamped() {
        let mut r = upload();
        r.bytes_transferred = 400;
        assert!((r.fraction() - 0.4).abs() < f64::EPSILON);
        r.bytes_transferred = 5000;
        assert_eq!(r.fraction(), 1.0);
        r.size = 0;
        assert_eq!(r.fraction(), 0.0);
    }

    #[test]
    fn retry_countdown_and_due() {
        let now = Utc::now();
        let mut r = upload();
        r.status = TransferStatus::UploadError;
        r.retry_after = Some(now + ChronoDuration::seconds(120));
        let left = r.retry_countdown(now).unwrap();
        assert_eq!(left.as_secs(), 120);
        assert!(!r.auto_retry_due(now));
        assert!(r.auto_retry_due(now + ChronoDuration::seconds(121)));

        r.retry_after = None;
        assert!(r.retry_countdown(now).is_none());
        assert!(!r.auto_retry_due(now + ChronoDuration::days(1)));
    }

    #[test]
    fn deferred_records_wait_for_their_window() {
        let now = Utc::now();
        let mut r = upload();
        assert!(r.dispatchable(now));

        r.session_error = "timed out".into();
        r.retry_after = Some(now + ChronoDuration::seconds(30));
        assert!(!r.dispatchable(now));
        assert!(r.dispatchable(now + ChronoDuration::seconds(30)));

        r.retry_after = None;
        assert!(!r.dispatchable(now + ChronoDuration::days(1)));

        r.status = TransferStatus::Uploading;
        r.clear_session();
        assert!(!r.dispatchable(now));
    }

    #[test]
    fn wwan_session_refuses_cellular() {
        assert!(!Session::BackgroundWwan.allows(NetworkPath::Cellular));
        assert!(Session::BackgroundWwan.allows(NetworkPath::Unmetered));
        assert!(Session::Background.allows(NetworkPath::Cellular));
        assert!(!Session::Foreground.allows(NetworkPath::Offline));
    }

    #[test]
    fn json_defaults_optional_fields() {
        let json = r#"{
            "ocId": "oc1",
            "ocIdTransfer": "t1",
            "account": "a",
            "serverUrl": "s",
            "fileName": "f",
            "fileNameView": "f",
            "status": "waitDownload",
            "sessionDate": "2024-01-01T00:00:00Z",
            "size": 10
        }"#;
        let r: TransferRecord = serde_json::from_str(json).unwrap();
        assert_eq!(r.session, Session::Foreground);
        assert_eq!(r.origin, Origin::User);
        assert_eq!(r.error_code, 0);
        assert!(r.retry_after.is_none());
    }
}
