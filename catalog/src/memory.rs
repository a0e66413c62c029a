use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use peer_core::{CdcError, MetadataStore};
use pt::{CdcStatus, Connector, DumperState, Task, TaskStatus, TaskTable, TaskTableMetric};

/// Process-local catalog. Nothing survives a restart; used by tests and
/// single-shot runs.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    tasks: DashMap<String, Task>,
    connectors: DashMap<String, Connector>,
    tables: DashMap<(String, String), TaskTable>,
    next_table_id: AtomicI64,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_task<F>(&self, id: &str, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut Task),
    {
        let mut task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| CdcError::not_found("task", id))?;
        f(&mut *task);
        Ok(())
    }

    fn with_table<F>(&self, task_id: &str, table: &str, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut TaskTable),
    {
        let mut row = self
            .tables
            .get_mut(&(task_id.to_string(), table.to_string()))
            .ok_or_else(|| CdcError::not_found("task table", table))?;
        f(&mut *row);
        Ok(())
    }
}

#[async_trait::async_trait]
impl MetadataStore for MemoryCatalog {
    async fn get_task(&self, id: &str) -> anyhow::Result<Option<Task>> {
        Ok(self.tasks.get(id).map(|t| t.clone()))
    }

    async fn get_connector(&self, id: &str) -> anyhow::Result<Option<Connector>> {
        Ok(self.connectors.get(id).map(|c| c.clone()))
    }

    async fn active_tasks(&self) -> anyhow::Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Active)
            .map(|t| t.clone())
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn save_task(&self, task: &Task) -> anyhow::Result<()> {
        self.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn save_connector(&self, connector: &Connector) -> anyhow::Result<()> {
        self.connectors
            .insert(connector.id.clone(), connector.clone());
        Ok(())
    }

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> anyhow::Result<()> {
        self.with_task(id, |t| t.status = status)
    }

    async fn update_cdc_status(&self, id: &str, status: CdcStatus) -> anyhow::Result<()> {
        self.with_task(id, |t| t.cdc_status = status)
    }

    async fn update_cdc_position(
        &self,
        id: &str,
        position: &str,
        last_event_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        self.with_task(id, |t| {
            t.last_cdc_position = position.to_string();
            if last_event_at.is_some() {
                t.last_cdc_at = last_event_at;
            }
        })
    }

    async fn update_extras(&self, id: &str, extras: &str) -> anyhow::Result<()> {
        self.with_task(id, |t| t.extras = extras.to_string())
    }

    async fn get_task_table(
        &self,
        task_id: &str,
        table: &str,
    ) -> anyhow::Result<Option<TaskTable>> {
        Ok(self
            .tables
            .get(&(task_id.to_string(), table.to_string()))
            .map(|t| t.clone()))
    }

    async fn create_task_table(
        &self,
        task_id: &str,
        table: &str,
        state: DumperState,
    ) -> anyhow::Result<TaskTable> {
        let row = self
            .tables
            .entry((task_id.to_string(), table.to_string()))
            .or_insert_with(|| TaskTable {
                id: self.next_table_id.fetch_add(1, Ordering::SeqCst) + 1,
                dumper_state: state,
                ..TaskTable::new(task_id, table)
            });
        Ok(row.clone())
    }

    async fn list_task_tables(&self, task_id: &str) -> anyhow::Result<Vec<TaskTable>> {
        let mut rows: Vec<TaskTable> = self
            .tables
            .iter()
            .filter(|t| t.task_id == task_id)
            .map(|t| t.clone())
            .collect();
        rows.sort_by_key(|t| t.id);
        Ok(rows)
    }

    async fn update_dumper_state(
        &self,
        task_id: &str,
        table: &str,
        state: DumperState,
    ) -> anyhow::Result<()> {
        self.with_table(task_id, table, |t| t.dumper_state = state)
    }

    async fn flush_metric(
        &self,
        task_id: &str,
        table: &str,
        metric: &TaskTableMetric,
    ) -> anyhow::Result<()> {
        self.with_table(task_id, table, |t| t.apply(metric))
    }

    async fn resync_task_table(&self, task_id: &str, table: &str) -> anyhow::Result<()> {
        self.with_table(task_id, table, |t| {
            t.dumper_state = DumperState::Initialed;
            t.total_dumped = 0;
            t.last_dumper_key = None;
        })
    }
}
