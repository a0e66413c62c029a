use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

pub mod metric;

pub use metric::{SyncMode, TaskTableMetric};

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(display("unknown {} '{}'", kind, value))]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

// string-backed enums, stored as text in the catalog
macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => ParseEnumSnafu {
                        kind: $kind,
                        value: s.to_string(),
                    }
                    .fail(),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    MySql,
    Postgres,
    StarRocks,
    Elasticsearch,
}

string_enum!(DbType, "connector type", {
    MySql => "mysql",
    Postgres => "postgres",
    StarRocks => "starrocks",
    Elasticsearch => "elasticsearch",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Reader,
    Writer,
    #[default]
    Both,
}

string_enum!(TargetType, "target type", {
    Reader => "reader",
    Writer => "writer",
    Both => "both",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connector {
    pub id: String,
    pub name: String,
    pub db_type: DbType,
    #[serde(default)]
    pub target_type: TargetType,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    #[default]
    Inactive,
}

string_enum!(TaskStatus, "task status", {
    Active => "active",
    Inactive => "inactive",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CdcStatus {
    #[default]
    Idle,
    Running,
    Failed,
    Stopped,
}

string_enum!(CdcStatus, "cdc status", {
    Idle => "idle",
    Running => "running",
    Failed => "failed",
    Stopped => "stopped",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DumperState {
    #[default]
    Initialed,
    Running,
    Completed,
    Failed,
    Stopped,
}

string_enum!(DumperState, "dumper state", {
    Initialed => "initialed",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Stopped => "stopped",
});

impl DumperState {
    /// Whether a table in this state still has snapshot work left.
    pub fn needs_dump(&self) -> bool {
        matches!(self, DumperState::Initialed | DumperState::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Task {
    pub id: String,
    pub name: String,
    /// connector id of the source
    pub reader: String,
    /// connector id of the destination
    pub writer: String,
    /// comma separated table list
    pub tables: String,
    pub dumper_enabled: bool,
    pub cdc_enabled: bool,
    pub migrate_enabled: bool,
    pub debug_enabled: bool,
    pub status: TaskStatus,
    pub cdc_status: CdcStatus,
    pub last_cdc_position: String,
    pub last_cdc_at: Option<DateTime<Utc>>,
    /// opaque reader-private state
    pub extras: String,
    pub batch_size: u32,
}

impl Task {
    pub fn tables(&self) -> Vec<String> {
        self.tables
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskTable {
    pub id: i64,
    pub task_id: String,
    pub schema: String,
    pub table: String,
    pub last_dumper_key: Option<String>,
    pub dumper_state: DumperState,
    pub last_event_at: Option<DateTime<Utc>>,
    pub total_dumped: i64,
    pub total_inserted: i64,
    pub total_updated: i64,
    pub total_deleted: i64,
}

impl TaskTable {
    pub fn new(task_id: &str, table: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            table: table.to_string(),
            ..Default::default()
        }
    }

    /// Applies a flushed metric delta the way the catalog persists it.
    pub fn apply(&mut self, metric: &TaskTableMetric) {
        match metric.mode {
            SyncMode::Dumper => {
                self.total_dumped += metric.inserted as i64;
                if let Some(key) = metric.last_synced_key_json() {
                    self.last_dumper_key = Some(key);
                }
            }
            SyncMode::Cdc => {
                self.total_inserted += metric.inserted as i64;
                self.total_updated += metric.updated as i64;
                self.total_deleted += metric.deleted as i64;
                if metric.last_event_at.is_some() {
                    self.last_event_at = metric.last_event_at;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_tables_are_trimmed() {
        let task = Task {
            tables: " users, orders,,items ".to_string(),
            ..Default::default()
        };
        assert_eq!(task.tables(), vec!["users", "orders", "items"]);
    }

    #[test]
    fn enums_parse_from_catalog_text() {
        assert_eq!("starrocks".parse::<DbType>().unwrap(), DbType::StarRocks);
        assert_eq!(
            "completed".parse::<DumperState>().unwrap(),
            DumperState::Completed
        );
        assert!("oracle".parse::<DbType>().is_err());
        assert_eq!(CdcStatus::Stopped.to_string(), "stopped");
    }

    #[test]
    fn dumper_flush_counts_rows_and_keeps_last_key() {
        let mut table = TaskTable::new("t1", "users");
        let mut keys = serde_json::Map::new();
        keys.insert("id".to_string(), serde_json::json!(7));
        table.apply(&TaskTableMetric {
            mode: SyncMode::Dumper,
            inserted: 3,
            last_synced_keys: Some(keys),
            ..Default::default()
        });
        assert_eq!(table.total_dumped, 3);
        assert_eq!(table.total_inserted, 0);
        assert_eq!(table.last_dumper_key.as_deref(), Some(r#"{"id":7}"#));

        // an empty delta leaves the cursor alone
        table.apply(&TaskTableMetric {
            mode: SyncMode::Dumper,
            ..Default::default()
        });
        assert_eq!(table.last_dumper_key.as_deref(), Some(r#"{"id":7}"#));
    }

    #[test]
    fn cdc_flush_accumulates_totals() {
        let mut table = TaskTable::new("t1", "users");
        let metric = TaskTableMetric {
            mode: SyncMode::Cdc,
            inserted: 2,
            updated: 1,
            deleted: 1,
            ..Default::default()
        };
        table.apply(&metric);
        table.apply(&metric);
        assert_eq!(table.total_inserted, 4);
        assert_eq!(table.total_updated, 2);
        assert_eq!(table.total_deleted, 2);
        assert_eq!(table.total_dumped, 0);
    }
}
