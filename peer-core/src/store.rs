use chrono::{DateTime, Utc};
use pt::{CdcStatus, Connector, DumperState, Task, TaskStatus, TaskTable, TaskTableMetric};

/// Durable home of tasks, connectors and per-table progress.
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_task(&self, id: &str) -> anyhow::Result<Option<Task>>;

    async fn get_connector(&self, id: &str) -> anyhow::Result<Option<Connector>>;

    async fn active_tasks(&self) -> anyhow::Result<Vec<Task>>;

    /// Inserts or replaces the definition of a task.
    async fn save_task(&self, task: &Task) -> anyhow::Result<()>;

    async fn save_connector(&self, connector: &Connector) -> anyhow::Result<()>;

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> anyhow::Result<()>;

    async fn update_cdc_status(&self, id: &str, status: CdcStatus) -> anyhow::Result<()>;

    async fn update_cdc_position(
        &self,
        id: &str,
        position: &str,
        last_event_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()>;

    async fn update_extras(&self, id: &str, extras: &str) -> anyhow::Result<()>;

    async fn get_task_table(&self, task_id: &str, table: &str)
        -> anyhow::Result<Option<TaskTable>>;

    /// Returns the existing row, or creates one in `state`.
    async fn create_task_table(
        &self,
        task_id: &str,
        table: &str,
        state: DumperState,
    ) -> anyhow::Result<TaskTable>;

    async fn get_or_create_task_table(
        &self,
        task_id: &str,
        table: &str,
    ) -> anyhow::Result<TaskTable> {
        self.create_task_table(task_id, table, DumperState::Initialed)
            .await
    }

    async fn list_task_tables(&self, task_id: &str) -> anyhow::Result<Vec<TaskTable>>;

    async fn update_dumper_state(
        &self,
        task_id: &str,
        table: &str,
        state: DumperState,
    ) -> anyhow::Result<()>;

    /// Adds a metric delta to the table's totals.
    async fn flush_metric(
        &self,
        task_id: &str,
        table: &str,
        metric: &TaskTableMetric,
    ) -> anyhow::Result<()>;

    /// Resets the snapshot progress of a table so it is dumped again.
    async fn resync_task_table(&self, task_id: &str, table: &str) -> anyhow::Result<()>;
}
