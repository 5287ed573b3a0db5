//! Typed record predicates.

use vaultsync_model::{TransferRecord, TransferStatus};

/// Sort order applied to query results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Unsorted,
    /// Oldest `session_date` first; ties broken by transfer identifier.
    SessionDateAsc,
    SessionDateDesc,
}

/// Predicate, sort and limit for [`RecordStore::query`](crate::RecordStore::query).
///
/// Unset fields match everything. An empty status list matches any status.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub account: Option<String>,
    pub statuses: Vec<TransferStatus>,
    pub oc_id: Option<String>,
    pub task_identifier: Option<u64>,
    pub sort: SortOrder,
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn statuses(statuses: impl IntoIterator<Item = TransferStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn oc_id(mut self, oc_id: impl Into<String>) -> Self {
        self.oc_id = Some(oc_id.into());
        self
    }

    pub fn task_identifier(mut self, task: u64) -> Self {
        self.task_identifier = Some(task);
        self
    }

    pub fn sorted(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &TransferRecord) -> bool {
        if self.account.as_ref().is_some_and(|a| *a != record.account) {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }
        if self.oc_id.as_ref().is_some_and(|id| *id != record.oc_id) {
            return false;
        }
        if self
            .task_identifier
            .is_some_and(|t| t != record.session_task_identifier)
        {
            return false;
        }
        true
    }

    /// Sorts and truncates `records` in place according to this query.
    pub(crate) fn finish(&self, records: &mut Vec<TransferRecord>) {
        match self.sort {
            SortOrder::Unsorted => {}
            SortOrder::SessionDateAsc => records.sort_by(|a, b| {
                a.session_date
                    .cmp(&b.session_date)
                    .then_with(|| a.oc_id_transfer.cmp(&b.oc_id_transfer))
            }),
            SortOrder::SessionDateDesc => records.sort_by(|a, b| {
                b.session_date
                    .cmp(&a.session_date)
                    .then_with(|| a.oc_id_transfer.cmp(&b.oc_id_transfer))
            }),
        }
        if let Some(limit) = self.limit {
            records.truncate(limit);
        }
    }
}

/// Precondition for a conditional update or delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Condition {
    pub status: Option<TransferStatus>,
    pub task_identifier: Option<u64>,
}

impl Condition {
    /// No precondition.
    pub fn any() -> Self {
        Self::default()
    }

    /// The record must currently hold `status`.
    pub fn status(status: TransferStatus) -> Self {
        Self {
            status: Some(status),
            task_identifier: None,
        }
    }

    /// Additionally require the record to be bound to `task`.
    pub fn and_task(mut self, task: u64) -> Self {
        self.task_identifier = Some(task);
        self
    }

    pub fn holds(&self, record: &TransferRecord) -> bool {
        self.status.is_none_or(|s| s == record.status)
            && self
                .task_identifier
                .is_none_or(|t| t == record.session_task_identifier)
    }
}
