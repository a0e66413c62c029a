use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Dumper,
    Cdc,
}

/// Per-table counters accumulated since the previous flush.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskTableMetric {
    pub mode: SyncMode,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub last_synced_keys: Option<serde_json::Map<String, serde_json::Value>>,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl TaskTableMetric {
    pub fn is_empty(&self) -> bool {
        self.inserted == 0 && self.updated == 0 && self.deleted == 0
    }

    pub fn last_synced_key_json(&self) -> Option<String> {
        self.last_synced_keys
            .as_ref()
            .filter(|keys| !keys.is_empty())
            .map(|keys| serde_json::Value::Object(keys.clone()).to_string())
    }
}
