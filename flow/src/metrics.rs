use std::collections::HashMap;

use peer_core::{Event, EventType, MetadataStore, Record};
use pt::{SyncMode, TaskTableMetric};
use tokio::sync::Mutex;

#[derive(Default)]
struct Tables {
    dumper: HashMap<String, TaskTableMetric>,
    cdc: HashMap<String, TaskTableMetric>,
}

impl Tables {
    fn mode(&mut self, mode: SyncMode) -> &mut HashMap<String, TaskTableMetric> {
        match mode {
            SyncMode::Dumper => &mut self.dumper,
            SyncMode::Cdc => &mut self.cdc,
        }
    }

    fn entry(&mut self, mode: SyncMode, table: &str) -> &mut TaskTableMetric {
        self.mode(mode)
            .entry(table.to_string())
            .or_insert_with(|| TaskTableMetric {
                mode,
                ..Default::default()
            })
    }
}

/// Per-table deltas of one task since the last flush. Shared by the event
/// path and the periodic save.
#[derive(Default)]
pub struct TaskMetrics {
    tables: Mutex<Tables>,
}

impl TaskMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a snapshot page written to the destination.
    pub async fn record_dumped(&self, table: &str, records: &[Record], keys: &[&str]) {
        let Some(last) = records.last() else {
            return;
        };
        let mut tables = self.tables.lock().await;
        let metric = tables.entry(SyncMode::Dumper, table);
        metric.inserted += records.len() as u64;
        if !keys.is_empty() {
            metric.last_synced_keys = Some(last.key_json(keys));
        }
    }

    /// Counts one applied change event.
    pub async fn record_event(&self, event: &Event) {
        let mut tables = self.tables.lock().await;
        let metric = tables.entry(SyncMode::Cdc, &event.source_table);
        match event.event_type {
            EventType::Insert => metric.inserted += 1,
            EventType::Update => metric.updated += 1,
            EventType::Delete => metric.deleted += 1,
        }
        if let Some(schema) = &event.source_schema {
            let keys = schema.primary_key_names();
            if !keys.is_empty() {
                metric.last_synced_keys = Some(event.record.key_json(&keys));
            }
        }
        if event.occurred_at.is_some() {
            metric.last_event_at = event.occurred_at;
        }
    }

    /// Removes and returns the pending deltas of `mode`.
    pub async fn take(&self, mode: SyncMode) -> Vec<(String, TaskTableMetric)> {
        let mut tables = self.tables.lock().await;
        tables
            .mode(mode)
            .drain()
            .filter(|(_, m)| !m.is_empty() || m.last_synced_keys.is_some())
            .collect()
    }

    /// Puts back a delta that could not be persisted. Counts are added to
    /// anything recorded since; newer keys win.
    pub async fn restore(&self, table: &str, older: TaskTableMetric) {
        let mut tables = self.tables.lock().await;
        let metric = tables.entry(older.mode, table);
        metric.inserted += older.inserted;
        metric.updated += older.updated;
        metric.deleted += older.deleted;
        if metric.last_synced_keys.is_none() {
            metric.last_synced_keys = older.last_synced_keys;
        }
        if metric.last_event_at.is_none() {
            metric.last_event_at = older.last_event_at;
        }
    }

    /// Persists the pending deltas of `mode`. Failed tables keep their delta
    /// for the next attempt; the first failure is returned.
    pub async fn flush(
        &self,
        task_id: &str,
        mode: SyncMode,
        store: &dyn MetadataStore,
    ) -> anyhow::Result<()> {
        let mut first_err = None;
        for (table, metric) in self.take(mode).await {
            tracing::info!(
                "table {} I={}, U={}, D={}",
                table,
                metric.inserted,
                metric.updated,
                metric.deleted
            );
            if let Err(e) = store.flush_metric(task_id, &table, &metric).await {
                tracing::warn!("can not flush metric of table {}: {:#}", table, e);
                self.restore(&table, metric).await;
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
