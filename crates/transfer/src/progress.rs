//! In-memory progress snapshot and the persist throttle.

use std::collections::HashMap;

/// Last known fractional progress per `"serverUrl|fileName"` key.
///
/// A key is present only while its transfer is active. Nothing here is
/// persisted; after a restart the snapshot starts empty.
#[derive(Debug, Default, Clone)]
pub struct ProgressSnapshot {
    entries: HashMap<String, f64>,
}

impl ProgressSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `key` at zero.
    pub fn begin(&mut self, key: String) {
        self.entries.insert(key, 0.0);
    }

    /// Records `fraction` for an already tracked key. Untracked keys are
    /// ignored.
    pub fn update(&mut self, key: &str, fraction: f64) -> bool {
        match self.entries.get_mut(key) {
            Some(value) => {
                *value = fraction.clamp(0.0, 1.0);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<f64> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.entries.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_map(&self) -> HashMap<String, f64> {
        self.entries.clone()
    }
}

/// Decides when an active transfer's byte count is written to the store.
///
/// A write happens when progress advanced by at least `step` since the
/// last write, or when the transfer reaches completion.
#[derive(Debug)]
pub struct PersistThrottle {
    step: f64,
    last: HashMap<String, f64>,
}

impl PersistThrottle {
    pub fn new(step: f64) -> Self {
        Self {
            step,
            last: HashMap::new(),
        }
    }

    pub fn should_persist(&mut self, oc_id_transfer: &str, fraction: f64) -> bool {
        let last = self.last.get(oc_id_transfer).copied().unwrap_or(0.0);
        let due = fraction - last >= self.step || (fraction >= 1.0 && last < 1.0);
        if due {
            self.last.insert(oc_id_transfer.to_string(), fraction);
        }
        due
    }

    pub fn forget(&mut self, oc_id_transfer: &str) {
        self.last.remove(oc_id_transfer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_tracks_only_begun_keys() {
        let mut snap = ProgressSnapshot::new();
        assert!(!snap.update("srv|a", 0.5));
        assert!(!snap.contains("srv|a"));

        snap.begin("srv|a".into());
        assert_eq!(snap.get("srv|a"), Some(0.0));
        assert!(snap.update("srv|a", 1.7));
        assert_eq!(snap.get("srv|a"), Some(1.0));

        assert_eq!(snap.remove("srv|a"), Some(1.0));
        assert!(snap.is_empty());
    }

    #[test]
    fn throttle_skips_sub_step_deltas() {
        let mut t = PersistThrottle::new(0.05);
        assert!(!t.should_persist("t1", 0.001));
        assert!(!t.should_persist("t1", 0.049));
        assert!(t.should_persist("t1", 0.05));
        assert!(!t.should_persist("t1", 0.09));
        assert!(t.should_persist("t1", 0.4));
        assert!(t.should_persist("t1", 1.0));
        assert!(!t.should_persist("t1", 1.0));
    }

    #[test]
    fn throttle_completion_always_persists_once() {
        let mut t = PersistThrottle::new(0.05);
        assert!(t.should_persist("t1", 0.98));
        assert!(t.should_persist("t1", 1.0));

        t.forget("t1");
        assert!(t.should_persist("t1", 0.5));
    }
}
