//! Deterministic precedence among waiting records.

use std::cmp::Ordering;

use vaultsync_model::{TransferRecord, TransferStatus};

/// Status-class rank: metadata operations first, then downloads, then
/// uploads.
fn status_rank(status: TransferStatus) -> u8 {
    match status {
        TransferStatus::WaitCreateFolder => 0,
        TransferStatus::WaitDelete => 1,
        TransferStatus::WaitFavorite => 2,
        TransferStatus::WaitCopy => 3,
        TransferStatus::WaitMove => 4,
        TransferStatus::WaitRename => 5,
        TransferStatus::WaitDownload => 6,
        TransferStatus::WaitUpload => 7,
        _ => u8::MAX,
    }
}

/// Orders waiting records for dispatch.
///
/// User-initiated before automatic, then status class, then oldest
/// `session_date`, then transfer identifier.
pub fn dispatch_order(a: &TransferRecord, b: &TransferRecord) -> Ordering {
    a.origin
        .cmp(&b.origin)
        .then_with(|| status_rank(a.status).cmp(&status_rank(b.status)))
        .then_with(|| a.session_date.cmp(&b.session_date))
        .then_with(|| a.oc_id_transfer.cmp(&b.oc_id_transfer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use vaultsync_model::Origin;

    fn rec(id: &str, status: TransferStatus, origin: Origin, age_secs: i64) -> TransferRecord {
        let mut r = TransferRecord::new("oc", "a", "s", id, status)
            .with_transfer_id(id)
            .with_origin(origin);
        r.session_date = Utc::now() - Duration::seconds(age_secs);
        r
    }

    #[test]
    fn user_before_automatic_then_class_then_age() {
        let mut records = vec![
            rec("auto-old", TransferStatus::WaitUpload, Origin::Automatic, 900),
            rec("user-upload-new", TransferStatus::WaitUpload, Origin::User, 10),
            rec("user-upload-old", TransferStatus::WaitUpload, Origin::User, 500),
            rec("user-download", TransferStatus::WaitDownload, Origin::User, 1),
            rec("user-folder", TransferStatus::WaitCreateFolder, Origin::User, 1),
        ];
        records.sort_by(dispatch_order);
        let ids: Vec<&str> = records.iter().map(|r| r.oc_id_transfer.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "user-folder",
                "user-download",
                "user-upload-old",
                "user-upload-new",
                "auto-old",
            ]
        );
    }

    #[test]
    fn identical_dates_break_ties_by_id() {
        let now = Utc::now();
        let mut a = rec("b", TransferStatus::WaitUpload, Origin::User, 0);
        let mut b = rec("a", TransferStatus::WaitUpload, Origin::User, 0);
        a.session_date = now;
        b.session_date = now;
        assert_eq!(dispatch_order(&a, &b), Ordering::Greater);
    }
}
