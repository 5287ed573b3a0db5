//! Record status enumeration and its numeric codes.

use serde::{Deserialize, Serialize};

/// Status of a persisted transfer record.
///
/// A record holds exactly one status at any time. The `Wait*` family has
/// never moved bytes, `Downloading`/`Uploading` are bound to a transport
/// task, and the `*Error` family is a terminal attempt awaiting retry or
/// cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Normal,
    WaitCreateFolder,
    WaitFavorite,
    WaitCopy,
    WaitMove,
    WaitRename,
    WaitDelete,
    WaitDownload,
    Downloading,
    WaitUpload,
    Uploading,
    DownloadError,
    UploadError,
}

/// Direction of the bytes for statuses that belong to a transfer family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Download,
    Upload,
}

impl TransferStatus {
    pub const ALL: [TransferStatus; 13] = [
        Self::Normal,
        Self::WaitCreateFolder,
        Self::WaitFavorite,
        Self::WaitCopy,
        Self::WaitMove,
        Self::WaitRename,
        Self::WaitDelete,
        Self::WaitDownload,
        Self::Downloading,
        Self::WaitUpload,
        Self::Uploading,
        Self::DownloadError,
        Self::UploadError,
    ];

    pub const WAITING: [TransferStatus; 8] = [
        Self::WaitCreateFolder,
        Self::WaitFavorite,
        Self::WaitCopy,
        Self::WaitMove,
        Self::WaitRename,
        Self::WaitDelete,
        Self::WaitDownload,
        Self::WaitUpload,
    ];

    pub const ACTIVE: [TransferStatus; 2] = [Self::Downloading, Self::Uploading];

    pub const ERRORED: [TransferStatus; 2] = [Self::DownloadError, Self::UploadError];

    /// Stable integer code used by the persisted representation.
    pub fn code(self) -> i32 {
        match self {
            Self::Normal => 0,
            Self::WaitDownload => -1,
            Self::Downloading => -2,
            Self::DownloadError => -4,
            Self::WaitUpload => 1,
            Self::Uploading => 2,
            Self::UploadError => 4,
            Self::WaitCreateFolder => 10,
            Self::WaitDelete => 11,
            Self::WaitFavorite => 12,
            Self::WaitCopy => 13,
            Self::WaitMove => 14,
            Self::WaitRename => 15,
        }
    }

    /// Inverse of [`code`](Self::code).
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn is_waiting(self) -> bool {
        Self::WAITING.contains(&self)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Downloading | Self::Uploading)
    }

    pub fn is_error(self) -> bool {
        matches!(self, Self::DownloadError | Self::UploadError)
    }

    /// Returns `true` for wait statuses that are resolved by a single remote
    /// call instead of a byte transfer.
    pub fn is_metadata_operation(self) -> bool {
        self.is_waiting() && self.direction().is_none()
    }

    /// Byte direction, if this status belongs to the download or upload family.
    pub fn direction(self) -> Option<Direction> {
        match self {
            Self::WaitDownload | Self::Downloading | Self::DownloadError => {
                Some(Direction::Download)
            }
            Self::WaitUpload | Self::Uploading | Self::UploadError => Some(Direction::Upload),
            _ => None,
        }
    }

    /// Short label shown in the transfers panel.
    pub fn label(self) -> &'static str {
        match self {
            Self::Normal => "Synced",
            Self::WaitCreateFolder => "Waiting to create folder",
            Self::WaitFavorite => "Waiting to update favorite",
            Self::WaitCopy => "Waiting to copy",
            Self::WaitMove => "Waiting to move",
            Self::WaitRename => "Waiting to rename",
            Self::WaitDelete => "Waiting to delete",
            Self::WaitDownload => "Waiting to download",
            Self::Downloading => "Downloading",
            Self::WaitUpload => "Waiting to upload",
            Self::Uploading => "Uploading",
            Self::DownloadError => "Download error",
            Self::UploadError => "Upload error",
        }
    }
}

impl Direction {
    pub fn waiting(self) -> TransferStatus {
        match self {
            Self::Download => TransferStatus::WaitDownload,
            Self::Upload => TransferStatus::WaitUpload,
        }
    }

    pub fn active(self) -> TransferStatus {
        match self {
            Self::Download => TransferStatus::Downloading,
            Self::Upload => TransferStatus::Uploading,
        }
    }

    pub fn errored(self) -> TransferStatus {
        match self {
            Self::Download => TransferStatus::DownloadError,
            Self::Upload => TransferStatus::UploadError,
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
