use std::sync::Arc;

use chrono::{DateTime, Utc};
use pt::{Task, TaskTable};
use tokio_util::sync::CancellationToken;

pub mod cache;
pub mod dump;
pub mod error;
pub mod event;
pub mod plugin;
pub mod retry;
pub mod schema;
pub mod store;

pub use cache::CachedSchemaManager;
pub use dump::{BatchSource, DumpDriver, DumpOutcome};
pub use error::CdcError;
pub use event::{Event, EventType, Field, Record};
pub use plugin::{Plugin, PluginRegistry};
pub use schema::{Column, Table, TableRef};
pub use store::MetadataStore;

/// Opaque, reader-defined checkpoint into the source change log.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReaderPosition {
    pub position: String,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl ReaderPosition {
    pub fn new(position: impl Into<String>) -> Self {
        Self {
            position: position.into(),
            last_event_at: None,
        }
    }
}

#[async_trait::async_trait]
pub trait SchemaManager: Send + Sync {
    async fn get(&self, database: &str, table: &str) -> anyhow::Result<Option<TableRef>>;

    async fn create_table(&self, database: &str, table: &Table) -> anyhow::Result<()>;
}

/// Receives snapshot pages from a dumper.
#[async_trait::async_trait]
pub trait DumperSubscriber: Send + Sync {
    async fn dumper_event(&self, table: &TableRef, records: &[Record]) -> anyhow::Result<()>;
}

/// Receives change events from a reader, in source order.
#[async_trait::async_trait]
pub trait ReaderSubscriber: Send + Sync {
    async fn reader_event(&self, event: Event) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait Reader: Send + Sync {
    async fn prepare(&mut self) -> anyhow::Result<()>;

    /// Streams events into the subscriber until stopped or failed.
    async fn start(&self) -> anyhow::Result<()>;

    /// Makes a running `start` return.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Current head of the source change log.
    async fn latest_position(&self) -> anyhow::Result<ReaderPosition>;

    /// Position of the last event handed to the subscriber.
    fn current_position(&self) -> ReaderPosition;

    /// Frees server side resources such as replication slots.
    async fn release(&self) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait Writer: Send + Sync {
    async fn prepare(&mut self) -> anyhow::Result<()>;

    /// Applies one change. Replays of inserts and updates must be harmless.
    async fn execute(&self, event: &Event) -> anyhow::Result<()>;

    /// Upserts one snapshot page of `table`.
    async fn execute_batch(&self, table: &Table, records: &[Record]) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait Dumper: Send + Sync {
    async fn prepare(&mut self) -> anyhow::Result<()>;

    async fn start_dump_table(&self, table: &TaskTable) -> anyhow::Result<DumpOutcome>;

    async fn stop(&self) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Checks connectivity and credentials without side effects.
    async fn test(&self) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct ReaderOptions {
    pub connector: pt::Connector,
    pub task: Task,
    pub subscriber: Arc<dyn ReaderSubscriber>,
    pub store: Arc<dyn MetadataStore>,
    pub cancel: CancellationToken,
}

#[derive(Clone)]
pub struct WriterOptions {
    pub connector: pt::Connector,
    pub task: Task,
    pub cancel: CancellationToken,
}

#[derive(Clone)]
pub struct DumperOptions {
    pub connector: pt::Connector,
    pub task: Task,
    pub subscriber: Arc<dyn DumperSubscriber>,
    pub batch_size: usize,
    pub cancel: CancellationToken,
}

#[derive(Clone)]
pub struct ConnectorOptions {
    pub connector: pt::Connector,
}
