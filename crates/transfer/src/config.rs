//! Dispatcher policy parameters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Smallest allowed persist step. Byte counts are never persisted at
/// sub-percent granularity.
pub const MIN_PERSIST_STEP: f64 = 0.01;

/// Upper bound applied to the backoff window (one week).
pub const MAX_RETRY_BACKOFF_SECS: u64 = 7 * 24 * 60 * 60;

/// Tunable dispatcher policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatcherConfig {
    /// Maximum number of simultaneously active transfers.
    pub max_concurrent: usize,
    /// Backoff window before an errored record is auto-retried.
    pub retry_backoff_secs: u64,
    /// Minimum progress delta between two persisted byte-count writes.
    pub persist_step: f64,
    /// Transfers panel refresh interval.
    pub panel_poll_millis: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            retry_backoff_secs: 300,
            persist_step: 0.05,
            panel_poll_millis: 500,
        }
    }
}

impl DispatcherConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs.min(MAX_RETRY_BACKOFF_SECS))
    }

    pub fn persist_step(&self) -> f64 {
        self.persist_step.max(MIN_PERSIST_STEP)
    }

    pub fn panel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.panel_poll_millis.max(1))
    }
}
