use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use peer_core::{
    error::is_transient, retry::Backoff, CdcError, ConnectorOptions, DumpOutcome, Dumper,
    DumperOptions, MetadataStore, PluginRegistry, Reader, ReaderOptions, SchemaManager, Writer,
    WriterOptions,
};
use pt::{CdcStatus, Connector, DumperState, SyncMode, Task, TaskTable};
use tokio::{
    sync::{watch, Mutex},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{metrics::TaskMetrics, sink::TaskSink, RuntimeConfig};

/// Lifecycle of one task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prepared,
    Starting,
    Dumping,
    Streaming,
    Stopped,
    Failed,
}

impl Phase {
    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Starting | Phase::Dumping | Phase::Streaming)
    }
}

struct TaskState {
    task: Task,
    reader: Connector,
    writer: Connector,
}

/// Runs one task: migration, snapshot of the tables that still need it,
/// then change streaming. One live instance per task id.
pub struct TaskRunner {
    id: String,
    store: Arc<dyn MetadataStore>,
    plugins: Arc<PluginRegistry>,
    config: RuntimeConfig,
    state: Option<TaskState>,
    metrics: Arc<TaskMetrics>,
    cancel: CancellationToken,
    phase: watch::Sender<Phase>,
    dumper: Mutex<Option<Arc<dyn Dumper>>>,
    reader: Mutex<Option<Arc<dyn Reader>>>,
    position: Mutex<String>,
    halted: AtomicBool,
}

impl TaskRunner {
    pub fn new(
        id: &str,
        store: Arc<dyn MetadataStore>,
        plugins: Arc<PluginRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Prepared);
        Self {
            id: id.to_string(),
            store,
            plugins,
            config,
            state: None,
            metrics: Arc::new(TaskMetrics::new()),
            cancel: CancellationToken::new(),
            phase,
            dumper: Mutex::new(None),
            reader: Mutex::new(None),
            position: Mutex::new(String::new()),
            halted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Loads the task and both connectors.
    pub async fn prepare(&mut self) -> anyhow::Result<()> {
        let task = self
            .store
            .get_task(&self.id)
            .await?
            .ok_or_else(|| CdcError::not_found("task", &self.id))?;
        let reader = self
            .store
            .get_connector(&task.reader)
            .await?
            .ok_or_else(|| CdcError::not_found("reader connector", &task.reader))?;
        let writer = self
            .store
            .get_connector(&task.writer)
            .await?
            .ok_or_else(|| CdcError::not_found("writer connector", &task.writer))?;
        *self.position.get_mut() = task.last_cdc_position.clone();
        self.state = Some(TaskState {
            task,
            reader,
            writer,
        });
        Ok(())
    }

    fn state(&self) -> anyhow::Result<&TaskState> {
        self.state.as_ref().context("task used before prepare")
    }

    /// Spawns the task body. The returned handle resolves once the task
    /// has finished or was stopped.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.phase.send_replace(Phase::Starting);
        let runner = self.clone();
        let span = tracing::info_span!("task", id = %self.id);
        tokio::spawn(
            async move {
                let phase = match runner.run().await {
                    Ok(()) => Phase::Stopped,
                    Err(e) => {
                        tracing::error!("task {} failed: {:#}", runner.id, e);
                        Phase::Failed
                    }
                };
                runner.phase.send_replace(phase);
            }
            .instrument(span),
        )
    }

    async fn run(&self) -> anyhow::Result<()> {
        let state = self.state()?;
        let task = &state.task;
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let mut tables = Vec::new();
        for name in task.tables() {
            tables.push(self.store.get_or_create_task_table(&task.id, &name).await?);
        }

        if task.migrate_enabled {
            self.migrate().await?;
        }

        let should_dump = task.dumper_enabled && tables.iter().any(|t| t.dumper_state.needs_dump());
        if should_dump {
            self.phase.send_replace(Phase::Dumping);
            let result = self.run_dumper(tables).await;
            if let Err(e) = self.save().await {
                tracing::warn!("can not save task {} after dump: {:#}", self.id, e);
            }
            result?;
        }

        if self.cancel.is_cancelled() {
            return Ok(());
        }
        if task.cdc_enabled && task.cdc_status != CdcStatus::Stopped {
            self.phase.send_replace(Phase::Streaming);
            self.run_cdc().await?;
        }
        Ok(())
    }

    /// Creates missing destination tables from the source schema. Existing
    /// destination tables are left alone.
    #[tracing::instrument(skip(self))]
    async fn migrate(&self) -> anyhow::Result<()> {
        let state = self.state()?;
        tracing::info!("starting migrating tables");
        let source = self.plugins.schema_manager(ConnectorOptions {
            connector: state.reader.clone(),
        })?;
        let destination = self.plugins.schema_manager(ConnectorOptions {
            connector: state.writer.clone(),
        })?;
        for table in state.task.tables() {
            self.migrate_table(state, source.as_ref(), destination.as_ref(), &table)
                .await?;
        }
        Ok(())
    }

    async fn migrate_table(
        &self,
        state: &TaskState,
        source: &dyn SchemaManager,
        destination: &dyn SchemaManager,
        table: &str,
    ) -> anyhow::Result<()> {
        let existing = destination.get(&state.writer.database, table).await?;
        if existing.is_some_and(|t| t.exists()) {
            tracing::info!(
                "skip migrate table {}, because of already exists on writer connection",
                table
            );
            return Ok(());
        }
        let schema = source
            .get(&state.reader.database, table)
            .await?
            .filter(|t| t.exists())
            .ok_or_else(|| CdcError::not_found("source table", table))?;
        if schema.primary_keys().is_empty() {
            return Err(CdcError::configuration(format!(
                "can not find primary key for table {}",
                table
            ))
            .into());
        }
        destination
            .create_table(&state.writer.database, &schema)
            .await
            .with_context(|| format!("can not migrate table {}", table))?;
        tracing::info!("success migrate table {}", table);
        Ok(())
    }

    fn task_snapshot(&self, state: &TaskState, position: String) -> Task {
        Task {
            last_cdc_position: position,
            ..state.task.clone()
        }
    }

    async fn writer(&self, state: &TaskState) -> anyhow::Result<Arc<dyn Writer>> {
        let mut writer = self.plugins.writer(WriterOptions {
            connector: state.writer.clone(),
            task: state.task.clone(),
            cancel: self.cancel.child_token(),
        })?;
        writer.prepare().await.context("can not prepare writer")?;
        Ok(Arc::from(writer))
    }

    async fn run_dumper(&self, tables: Vec<TaskTable>) -> anyhow::Result<()> {
        let state = self.state()?;
        tracing::info!(
            "start dumper task on task {}, tables={:?}",
            state.task.name,
            state.task.tables()
        );
        let writer = self.writer(state).await?;
        let sink = Arc::new(TaskSink::new(
            writer,
            self.metrics.clone(),
            state.task.debug_enabled,
        ));

        self.seed_position(state, sink.clone()).await?;

        let batch_size = match state.task.batch_size {
            0 => self.config.batch_size,
            n => n as usize,
        };
        let mut dumper = self.plugins.dumper(DumperOptions {
            connector: state.reader.clone(),
            task: state.task.clone(),
            subscriber: sink,
            batch_size,
            cancel: self.cancel.child_token(),
        })?;
        dumper.prepare().await.context("dumper prepare fail")?;
        let dumper: Arc<dyn Dumper> = Arc::from(dumper);
        *self.dumper.lock().await = Some(dumper.clone());

        let mut workers = JoinSet::new();
        for table in tables {
            match table.dumper_state {
                DumperState::Completed => {
                    tracing::info!("skipped table {}, it's already completed", table.table)
                }
                DumperState::Failed => tracing::info!(
                    "skipped table {}, please manual re-trigger dumper",
                    table.table
                ),
                _ => {
                    workers.spawn(
                        dump_table(self.store.clone(), dumper.clone(), table)
                            .instrument(tracing::Span::current()),
                    );
                }
            }
        }

        let mut first_err = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined
                .map_err(anyhow::Error::from)
                .and_then(|result| result);
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        *self.dumper.lock().await = None;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Records the head of the source change log before the snapshot
    /// starts, so streaming later resumes from there.
    async fn seed_position(&self, state: &TaskState, sink: Arc<TaskSink>) -> anyhow::Result<()> {
        if !self.position.lock().await.is_empty() {
            return Ok(());
        }
        let plugin = self.plugins.get(state.reader.db_type)?;
        let Some(mut reader) = plugin.reader(ReaderOptions {
            connector: state.reader.clone(),
            task: state.task.clone(),
            subscriber: sink,
            store: self.store.clone(),
            cancel: self.cancel.child_token(),
        }) else {
            return Ok(());
        };
        reader.prepare().await.context("can not prepare reader")?;
        let latest = reader.latest_position().await?;
        tracing::info!("cdc reader will read from position {}", latest.position);
        match self
            .store
            .update_cdc_position(&self.id, &latest.position, None)
            .await
        {
            Ok(()) => *self.position.lock().await = latest.position,
            Err(e) => tracing::error!("can not save latest cdc position: {:#}", e),
        }
        if let Err(e) = reader.stop().await {
            tracing::warn!("can not stop position reader: {:#}", e);
        }
        Ok(())
    }

    async fn run_cdc(&self) -> anyhow::Result<()> {
        self.store
            .update_cdc_status(&self.id, CdcStatus::Running)
            .await?;
        let result = self.stream().await;

        if let Err(e) = self.save().await {
            tracing::warn!("can not save task {} after streaming: {:#}", self.id, e);
        }
        *self.reader.lock().await = None;
        let status = match &result {
            Ok(()) if self.cancel.is_cancelled() && !self.halted.load(Ordering::SeqCst) => None,
            Ok(()) => Some(CdcStatus::Stopped),
            Err(_) => Some(CdcStatus::Failed),
        };
        if let Some(status) = status {
            if let Err(e) = self.store.update_cdc_status(&self.id, status).await {
                tracing::error!("can not update cdc status of task {}: {:#}", self.id, e);
            }
        }
        result
    }

    async fn stream(&self) -> anyhow::Result<()> {
        let state = self.state()?;
        let writer = self.writer(state).await?;
        let sink = Arc::new(TaskSink::new(
            writer,
            self.metrics.clone(),
            state.task.debug_enabled,
        ));
        let position = self.position.lock().await.clone();
        let mut reader = self.plugins.reader(ReaderOptions {
            connector: state.reader.clone(),
            task: self.task_snapshot(state, position),
            subscriber: sink,
            store: self.store.clone(),
            cancel: self.cancel.child_token(),
        })?;
        reader.prepare().await.context("can not prepare reader")?;
        let reader: Arc<dyn Reader> = Arc::from(reader);
        *self.reader.lock().await = Some(reader.clone());

        let mut backoff = Backoff::default();
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let before = reader.current_position();
            match reader.start().await {
                Ok(()) => return Ok(()),
                Err(e) if is_transient(&e) => {
                    if reader.current_position() != before {
                        backoff.succeeded();
                    }
                    backoff.failed(&e, &self.cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Persists the reader position, when it moved, and the pending metrics.
    pub async fn save(&self) -> anyhow::Result<()> {
        let reader = self.reader.lock().await.clone();
        if let Some(reader) = reader {
            let current = reader.current_position();
            let mut persisted = self.position.lock().await;
            if !current.position.is_empty() && current.position != *persisted {
                tracing::info!("CDC Position: {}", current.position);
                self.store
                    .update_cdc_position(&self.id, &current.position, current.last_event_at)
                    .await
                    .context("can not save latest cdc position")?;
                *persisted = current.position;
            }
        }
        self.metrics
            .flush(&self.id, SyncMode::Dumper, self.store.as_ref())
            .await?;
        self.metrics
            .flush(&self.id, SyncMode::Cdc, self.store.as_ref())
            .await
    }

    /// Stops the task for good: streaming ends with CDC status Stopped.
    pub async fn stop(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.shutdown().await
    }

    /// Stops the task but keeps its CDC status, so the next start streams
    /// again. Used for restarts and process shutdown.
    pub async fn suspend(&self) {
        self.shutdown().await
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let dumper = self.dumper.lock().await.clone();
        if let Some(dumper) = dumper {
            if let Err(e) = dumper.stop().await {
                tracing::warn!("can not stop dumper of task {}: {:#}", self.id, e);
            }
        }
        let reader = self.reader.lock().await.clone();
        if let Some(reader) = reader {
            if let Err(e) = reader.stop().await {
                tracing::warn!("can not stop reader of task {}: {:#}", self.id, e);
            }
        }

        let mut phase = self.phase.subscribe();
        if phase.wait_for(|p| !p.is_active()).await.is_err() {
            tracing::warn!("task {} went away while stopping", self.id);
        }
        if let Err(e) = self.save().await {
            tracing::warn!("can not save task {} on stop: {:#}", self.id, e);
        }
        tracing::info!("task {} stopped", self.id);
    }
}

async fn dump_table(
    store: Arc<dyn MetadataStore>,
    dumper: Arc<dyn Dumper>,
    table: TaskTable,
) -> anyhow::Result<()> {
    tracing::info!("starting dump table {}", table.table);
    store
        .update_dumper_state(&table.task_id, &table.table, DumperState::Running)
        .await?;
    match dumper.start_dump_table(&table).await {
        Ok(DumpOutcome::Completed) => {
            tracing::info!("table {} dumper completed", table.table);
            store
                .update_dumper_state(&table.task_id, &table.table, DumperState::Completed)
                .await
        }
        Ok(DumpOutcome::Stopped) => {
            tracing::info!("table {} dumper stopped, it will resume on next start", table.table);
            Ok(())
        }
        Err(e) => {
            tracing::error!("table {} dumper failed, {:#}", table.table, e);
            if let Err(state_err) = store
                .update_dumper_state(&table.task_id, &table.table, DumperState::Failed)
                .await
            {
                tracing::error!("can not mark table {} failed: {:#}", table.table, state_err);
            }
            Err(e.context(format!("failed to run dump task on table {}", table.table)))
        }
    }
}
