use anyhow::Context;
use peer_core::{CdcError, Event, ReaderOptions, ReaderSubscriber};
use pt::{CdcStatus, DumperState, Task, TaskStatus};
use tokio_util::sync::CancellationToken;

use crate::Runtime;

/// Subscriber for readers that are only opened for maintenance.
struct RejectEvents;

#[async_trait::async_trait]
impl ReaderSubscriber for RejectEvents {
    async fn reader_event(&self, event: Event) -> anyhow::Result<()> {
        anyhow::bail!(
            "unexpected {} event on {} from a maintenance reader",
            event.event_type,
            event.source_table
        )
    }
}

impl Runtime {
    async fn load_task(&self, id: &str) -> anyhow::Result<Task> {
        Ok(self
            .store
            .get_task(id)
            .await?
            .ok_or_else(|| CdcError::not_found("task", id))?)
    }

    fn require_inactive(task: &Task, action: &str) -> anyhow::Result<()> {
        if task.status != TaskStatus::Inactive {
            return Err(CdcError::configuration(format!(
                "task {} must be inactive to {}",
                task.id, action
            ))
            .into());
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn activate_task(&self, id: &str) -> anyhow::Result<()> {
        self.load_task(id).await?;
        self.store.update_task_status(id, TaskStatus::Active).await?;
        self.start_task(id).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn deactivate_task(&self, id: &str) -> anyhow::Result<()> {
        self.store
            .update_task_status(id, TaskStatus::Inactive)
            .await?;
        self.stop_task(id).await
    }

    /// Clears a stopped or failed CDC status and restarts an active task.
    #[tracing::instrument(skip(self))]
    pub async fn resume_cdc(&self, id: &str) -> anyhow::Result<()> {
        let task = self.load_task(id).await?;
        self.store.update_cdc_status(id, CdcStatus::Running).await?;
        if task.status == TaskStatus::Active {
            self.start_task(id).await?;
        }
        Ok(())
    }

    /// Overwrites the stored change log position of an inactive task.
    #[tracing::instrument(skip(self))]
    pub async fn rotate_position(&self, id: &str, position: &str) -> anyhow::Result<()> {
        let task = self.load_task(id).await?;
        Self::require_inactive(&task, "rotate its position")?;
        self.store.update_cdc_position(id, position, None).await?;
        tracing::info!("task {} will read from position {}", id, position);
        Ok(())
    }

    /// Makes the next start dump `table` again from scratch.
    #[tracing::instrument(skip(self))]
    pub async fn resync_table(&self, task_id: &str, table: &str) -> anyhow::Result<()> {
        let task = self.load_task(task_id).await?;
        let _guard = self.control.lock().await;
        self.stop_task_locked(task_id, false).await;
        self.store
            .get_or_create_task_table(task_id, table)
            .await?;
        self.store.resync_task_table(task_id, table).await?;
        tracing::info!("table {} of task {} will be dumped again", table, task_id);
        if task.status == TaskStatus::Active {
            self.start_task_locked(task_id).await?;
        }
        Ok(())
    }

    /// Frees the reader's server side resources of an inactive task.
    #[tracing::instrument(skip(self))]
    pub async fn release_task(&self, id: &str) -> anyhow::Result<()> {
        let task = self.load_task(id).await?;
        Self::require_inactive(&task, "be released")?;
        let connector = self
            .store
            .get_connector(&task.reader)
            .await?
            .ok_or_else(|| CdcError::not_found("reader connector", &task.reader))?;
        let plugin = self.plugins.get(connector.db_type)?;
        let Some(mut reader) = plugin.reader(ReaderOptions {
            connector,
            task,
            subscriber: std::sync::Arc::new(RejectEvents),
            store: self.store.clone(),
            cancel: CancellationToken::new(),
        }) else {
            return Ok(());
        };
        reader.prepare().await.context("can not prepare reader")?;
        reader.release().await.context("can not release reader")?;
        tracing::info!("task {} released", id);
        Ok(())
    }

    /// Registers tables added to a task as already snapshotted, so they are
    /// streamed without being dumped. Existing progress is left alone.
    #[tracing::instrument(skip(self, tables))]
    pub async fn mark_tables_completed(
        &self,
        task_id: &str,
        tables: &[String],
    ) -> anyhow::Result<()> {
        for table in tables {
            self.store
                .create_task_table(task_id, table, DumperState::Completed)
                .await?;
        }
        Ok(())
    }
}
