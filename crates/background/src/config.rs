use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifiers and time budgets of the OS background tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackgroundConfig {
    pub refresh_identifier: String,
    pub processing_identifier: String,
    /// Earliest begin of a refresh wake, from the moment it is requested.
    pub refresh_earliest_secs: u64,
    pub processing_earliest_secs: u64,
    /// Time the OS grants a refresh wake before it expires.
    pub refresh_budget_secs: u64,
    pub processing_budget_secs: u64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            refresh_identifier: "com.vaultsync.refreshTask".into(),
            processing_identifier: "com.vaultsync.processingTask".into(),
            refresh_earliest_secs: 60,
            processing_earliest_secs: 300,
            refresh_budget_secs: 30,
            processing_budget_secs: 300,
        }
    }
}

impl BackgroundConfig {
    pub fn refresh_earliest(&self) -> Duration {
        Duration::from_secs(self.refresh_earliest_secs)
    }

    pub fn processing_earliest(&self) -> Duration {
        Duration::from_secs(self.processing_earliest_secs)
    }

    pub fn refresh_budget(&self) -> Duration {
        Duration::from_secs(self.refresh_budget_secs)
    }

    pub fn processing_budget(&self) -> Duration {
        Duration::from_secs(self.processing_budget_secs)
    }
}
