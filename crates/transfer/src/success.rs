//! Registry of transfers that completed during this process lifetime.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

/// Transfer identifiers marked successful, until a consumer acknowledges
/// them.
///
/// The UI uses this to tell "freshly completed, show once" apart from
/// "already seen". Membership only grows until drained or reset.
#[derive(Debug, Default)]
pub struct SuccessTracker {
    ids: Mutex<HashSet<String>>,
}

impl SuccessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, oc_id_transfer: &str) {
        self.lock().insert(oc_id_transfer.to_string());
    }

    pub fn contains(&self, oc_id_transfer: &str) -> bool {
        self.lock().contains(oc_id_transfer)
    }

    /// Removes one identifier. Returns `true` if it was present.
    pub fn acknowledge(&self, oc_id_transfer: &str) -> bool {
        self.lock().remove(oc_id_transfer)
    }

    /// Takes every identifier, leaving the tracker empty.
    pub fn drain(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().drain().collect();
        ids.sort();
        ids
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
