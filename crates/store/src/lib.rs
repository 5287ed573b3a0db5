//! Persisted transfer record store.
//!
//! The store is the single source of truth for record status. Every
//! mutation goes through [`RecordStore::update`], which applies a closure
//! atomically and only when the record still matches a [`Condition`]
//! (compare-and-set), so concurrent writers never overwrite each other's
//! status blindly.

mod memory;
mod query;

pub use memory::MemoryStore;
pub use query::{Condition, RecordQuery, SortOrder};

use tokio::sync::broadcast;
use vaultsync_model::{TransferRecord, TransitionError};

/// Errors produced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record already exists: {0}")]
    Duplicate(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// A change applied to the store.
#[derive(Debug, Clone)]
pub enum StoreChange {
    Inserted(TransferRecord),
    Updated(TransferRecord),
    Deleted(TransferRecord),
    /// The observer fell behind and missed this many changes.
    Lagged(u64),
}

impl StoreChange {
    pub fn record(&self) -> Option<&TransferRecord> {
        match self {
            Self::Inserted(r) | Self::Updated(r) | Self::Deleted(r) => Some(r),
            Self::Lagged(_) => None,
        }
    }
}

/// Mutation closure passed to [`RecordStore::update`].
///
/// Returning an error aborts the update and leaves the record untouched.
pub type Mutation<'a> = &'a mut dyn FnMut(&mut TransferRecord) -> Result<(), TransitionError>;

/// Storage backend for transfer records, keyed by `oc_id_transfer`.
pub trait RecordStore: Send + Sync {
    /// Returns records matching `query`, sorted and limited as requested.
    fn query(&self, query: &RecordQuery) -> Result<Vec<TransferRecord>, StoreError>;

    /// Returns the record with the given transfer identifier.
    fn get(&self, oc_id_transfer: &str) -> Result<Option<TransferRecord>, StoreError>;

    /// Inserts a new record. Fails with [`StoreError::Duplicate`] if the
    /// transfer identifier is already present.
    fn insert(&self, record: TransferRecord) -> Result<(), StoreError>;

    /// Atomically mutates a record if it satisfies `condition`.
    ///
    /// Returns `Ok(None)` when the record is missing or the condition does
    /// not hold; nothing is written in that case.
    fn update(
        &self,
        oc_id_transfer: &str,
        condition: Condition,
        mutation: Mutation<'_>,
    ) -> Result<Option<TransferRecord>, StoreError>;

    /// Removes a record if it satisfies `condition`.
    fn delete(
        &self,
        oc_id_transfer: &str,
        condition: Condition,
    ) -> Result<Option<TransferRecord>, StoreError>;

    /// Subscribes to changes of records matching `query`.
    fn observe(&self, query: RecordQuery) -> RecordWatch;
}

/// Filtered change stream returned by [`RecordStore::observe`].
pub struct RecordWatch {
    rx: broadcast::Receiver<StoreChange>,
    query: RecordQuery,
}

impl RecordWatch {
    pub fn new(rx: broadcast::Receiver<StoreChange>, query: RecordQuery) -> Self {
        Self { rx, query }
    }

    /// Waits for the next matching change. Returns `None` once the store is
    /// dropped.
    pub async fn next(&mut self) -> Option<StoreChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) => {
                    let matches = change.record().is_none_or(|r| self.query.matches(r));
                    if matches {
                        return Some(change);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Some(StoreChange::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
