use std::sync::Arc;

use dashmap::DashMap;
use peer_core::{MetadataStore, PluginRegistry};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{task::TaskRunner, RuntimeConfig};

/// Process wide supervisor of task instances.
pub struct Runtime {
    pub(crate) store: Arc<dyn MetadataStore>,
    pub(crate) plugins: Arc<PluginRegistry>,
    config: RuntimeConfig,
    tasks: DashMap<String, Arc<TaskRunner>>,
    // serializes start/stop of instances
    pub(crate) control: Mutex<()>,
}

impl Runtime {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        plugins: Arc<PluginRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            plugins,
            config,
            tasks: DashMap::new(),
            control: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Starts every active task. A task that fails to start is logged and
    /// skipped.
    pub async fn prepare(&self) -> anyhow::Result<()> {
        let tasks = self.store.active_tasks().await?;
        tracing::info!("starting {} active tasks", tasks.len());
        for task in tasks {
            if let Err(e) = self.start_task(&task.id).await {
                tracing::error!("can not start task {}: {:#}", task.id, e);
            }
        }
        Ok(())
    }

    pub fn task(&self, id: &str) -> Option<Arc<TaskRunner>> {
        self.tasks.get(id).map(|t| t.value().clone())
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.key().clone()).collect()
    }

    /// Replaces any live instance of the task with a fresh one.
    pub async fn start_task(&self, id: &str) -> anyhow::Result<()> {
        let _guard = self.control.lock().await;
        self.start_task_locked(id).await
    }

    pub(crate) async fn start_task_locked(&self, id: &str) -> anyhow::Result<()> {
        if let Some((_, old)) = self.tasks.remove(id) {
            old.suspend().await;
            tokio::time::sleep(self.config.restart_grace).await;
        }
        let mut runner = TaskRunner::new(
            id,
            self.store.clone(),
            self.plugins.clone(),
            self.config.clone(),
        );
        runner.prepare().await?;
        let runner = Arc::new(runner);
        runner.start();
        self.tasks.insert(id.to_string(), runner);
        tracing::info!("task {} started", id);
        Ok(())
    }

    /// Stops and forgets the live instance of the task, if any.
    pub async fn stop_task(&self, id: &str) -> anyhow::Result<()> {
        let _guard = self.control.lock().await;
        self.stop_task_locked(id, true).await;
        Ok(())
    }

    pub(crate) async fn stop_task_locked(&self, id: &str, halt: bool) {
        if let Some((_, runner)) = self.tasks.remove(id) {
            if halt {
                runner.stop().await;
            } else {
                runner.suspend().await;
            }
        }
    }

    /// Checkpoints every live instance.
    pub async fn save_all(&self) {
        let runners: Vec<Arc<TaskRunner>> = self.tasks.iter().map(|t| t.value().clone()).collect();
        for runner in runners {
            if let Err(e) = runner.save().await {
                tracing::warn!("can not save task {}: {:#}", runner.id(), e);
            }
        }
    }

    /// Saves all tasks every `save_interval` until `shutdown` fires.
    pub async fn run_save_loop(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.save_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => self.save_all().await,
            }
        }
    }

    /// Stops every instance. Their CDC status is kept, so the next process
    /// resumes streaming.
    pub async fn shutdown(&self) {
        let _guard = self.control.lock().await;
        for id in self.task_ids() {
            self.stop_task_locked(&id, false).await;
        }
    }
}
