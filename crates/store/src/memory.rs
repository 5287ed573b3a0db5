//! In-memory record store with an optional JSON snapshot file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use vaultsync_model::TransferRecord;

use crate::query::{Condition, RecordQuery};
use crate::{Mutation, RecordStore, RecordWatch, StoreChange, StoreError};

/// Capacity of the change broadcast channel.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Record store backed by a `HashMap`.
///
/// When opened with [`open`](Self::open), inserts, deletes and updates that
/// change a record's status or task binding are written to the JSON
/// snapshot file before the change is broadcast. Updates that only touch
/// byte counts are kept in memory until the next such write, an explicit
/// [`flush`](Self::flush), or drop.
pub struct MemoryStore {
    records: RwLock<HashMap<String, TransferRecord>>,
    changes: broadcast::Sender<StoreChange>,
    path: Option<PathBuf>,
    /// Set when memory holds changes the snapshot file does not.
    dirty: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty, non-persistent store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            records: RwLock::new(HashMap::new()),
            changes,
            path: None,
            dirty: AtomicBool::new(false),
        }
    }

    /// Opens a store persisted to `path`, loading existing records.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let records = load_records(&path)?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            records: RwLock::new(records),
            changes,
            path: Some(path),
            dirty: AtomicBool::new(false),
        })
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Writes the current records to the snapshot file, if any.
    pub fn flush(&self) -> Result<(), StoreError> {
        let map = self.read();
        self.persist(&map)
    }

    /// Returns `true` if some updates have not reached the snapshot file.
    pub fn has_unflushed_changes(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, TransferRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, TransferRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, map: &HashMap<String, TransferRecord>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut records: Vec<&TransferRecord> = map.values().collect();
        records.sort_by(|a, b| a.oc_id_transfer.cmp(&b.oc_id_transfer));
        let json = serde_json::to_string_pretty(&records)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        self.dirty.store(false, Ordering::Release);
        trace!("persisted {} record(s) to {:?}", records.len(), path);
        Ok(())
    }

    fn publish(&self, change: StoreChange) {
        // No receivers is not an error.
        let _ = self.changes.send(change);
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if !self.has_unflushed_changes() {
            return;
        }
        if let Err(e) = self.flush() {
            warn!(error = %e, "failed to flush record store on drop");
        }
    }
}

impl RecordStore for MemoryStore {
    fn query(&self, query: &RecordQuery) -> Result<Vec<TransferRecord>, StoreError> {
        let map = self.read();
        let mut out: Vec<TransferRecord> =
            map.values().filter(|r| query.matches(r)).cloned().collect();
        query.finish(&mut out);
        Ok(out)
    }

    fn get(&self, oc_id_transfer: &str) -> Result<Option<TransferRecord>, StoreError> {
        Ok(self.read().get(oc_id_transfer).cloned())
    }

    fn insert(&self, record: TransferRecord) -> Result<(), StoreError> {
        let mut map = self.write();
        if map.contains_key(&record.oc_id_transfer) {
            return Err(StoreError::Duplicate(record.oc_id_transfer));
        }
        map.insert(record.oc_id_transfer.clone(), record.clone());
        if let Err(e) = self.persist(&map) {
            map.remove(&record.oc_id_transfer);
            return Err(e);
        }
        drop(map);
        debug!(oc_id_transfer = %record.oc_id_transfer, status = ?record.status, "record inserted");
        self.publish(StoreChange::Inserted(record));
        Ok(())
    }

    fn update(
        &self,
        oc_id_transfer: &str,
        condition: Condition,
        mutation: Mutation<'_>,
    ) -> Result<Option<TransferRecord>, StoreError> {
        let mut map = self.write();
        let Some(current) = map.get(oc_id_transfer) else {
            return Ok(None);
        };
        if !condition.holds(current) {
            trace!(oc_id_transfer, status = ?current.status, "update condition not met");
            return Ok(None);
        }

        let mut next = current.clone();
        mutation(&mut next)?;
        // Primary key is immutable.
        next.oc_id_transfer = oc_id_transfer.to_string();

        let durable = current.status != next.status
            || current.session_task_identifier != next.session_task_identifier;
        let previous = map.insert(oc_id_transfer.to_string(), next.clone());
        if !durable {
            self.dirty.store(self.path.is_some(), Ordering::Release);
        } else if let Err(e) = self.persist(&map) {
            if let Some(previous) = previous {
                map.insert(oc_id_transfer.to_string(), previous);
            }
            return Err(e);
        }
        drop(map);
        self.publish(StoreChange::Updated(next.clone()));
        Ok(Some(next))
    }

    fn delete(
        &self,
        oc_id_transfer: &str,
        condition: Condition,
    ) -> Result<Option<TransferRecord>, StoreError> {
        let mut map = self.write();
        let holds = map.get(oc_id_transfer).is_some_and(|r| condition.holds(r));
        if !holds {
            return Ok(None);
        }
        let Some(removed) = map.remove(oc_id_transfer) else {
            return Ok(None);
        };
        if let Err(e) = self.persist(&map) {
            map.insert(oc_id_transfer.to_string(), removed);
            return Err(e);
        }
        drop(map);
        debug!(oc_id_transfer, "record deleted");
        self.publish(StoreChange::Deleted(removed.clone()));
        Ok(Some(removed))
    }

    fn observe(&self, query: RecordQuery) -> RecordWatch {
        RecordWatch::new(self.changes.subscribe(), query)
    }
}

/// Loads records from a JSON snapshot on disk.
fn load_records(path: &Path) -> Result<HashMap<String, TransferRecord>, StoreError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let records: Vec<TransferRecord> = serde_json::from_str(&data)?;
    debug!("loaded {} record(s) from {:?}", records.len(), path);
    Ok(records
        .into_iter()
        .map(|r| (r.oc_id_transfer.clone(), r))
        .collect())
}
