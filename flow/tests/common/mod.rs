#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use catalog::MemoryCatalog;
use flow::{Runtime, RuntimeConfig};
use peer_core::{
    BatchSource, CdcError, Column, DumpDriver, DumpOutcome, Dumper, DumperOptions, Event,
    EventType, Field, MetadataStore, Plugin, PluginRegistry, Reader, ReaderOptions, ReaderPosition,
    ReaderSubscriber, Record, SchemaManager, Table, TableRef, Writer, WriterOptions,
};
use pt::{CdcStatus, Connector, DbType, TargetType, Task, TaskStatus, TaskTable};
use tokio_util::sync::CancellationToken;
use value::{Type, TypeMap, TypedData, Value};

pub const SOURCE: &str = "source";
pub const DESTINATION: &str = "destination";

struct MemTable {
    schema: TableRef,
    rows: BTreeMap<i64, Record>,
}

/// A tiny database: tables keyed by an integer `id` plus a change log whose
/// position is the number of entries read.
#[derive(Default)]
pub struct MemoryDb {
    tables: Mutex<HashMap<String, MemTable>>,
    log: Mutex<Vec<Event>>,
    failing_tables: Mutex<HashSet<String>>,
    pub released: AtomicBool,
    /// While set, readers drop their connection right after starting.
    pub unreachable: AtomicBool,
    pub reader_starts: AtomicUsize,
    active_readers: AtomicUsize,
    pub max_active_readers: AtomicUsize,
}

fn id_of(record: &Record) -> i64 {
    match record.value("id").map(|v| &v.v) {
        Some(Value::Int(id)) => *id,
        other => panic!("record without integer id: {:?}", other),
    }
}

impl MemoryDb {
    pub fn create(&self, schema: Table) {
        self.tables.lock().unwrap().insert(
            schema.name.clone(),
            MemTable {
                schema: Arc::new(schema),
                rows: BTreeMap::new(),
            },
        );
    }

    pub fn schema(&self, table: &str) -> Option<TableRef> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.schema.clone())
    }

    pub fn upsert(&self, table: &str, record: Record) {
        let mut tables = self.tables.lock().unwrap();
        let t = tables.get_mut(table).expect("table exists");
        t.rows.insert(id_of(&record), record);
    }

    pub fn remove(&self, table: &str, id: i64) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(t) = tables.get_mut(table) {
            t.rows.remove(&id);
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn ids(&self, table: &str) -> Vec<i64> {
        self.rows(table).iter().map(id_of).collect()
    }

    /// Applies a change to the source table and appends it to the log.
    pub fn change(&self, event: Event) {
        match event.event_type {
            EventType::Insert | EventType::Update => {
                self.upsert(&event.source_table, event.record.clone())
            }
            EventType::Delete => self.remove(&event.source_table, id_of(&event.record)),
        }
        self.log.lock().unwrap().push(event);
    }

    /// Appends to the log without touching the tables.
    pub fn append(&self, event: Event) {
        self.log.lock().unwrap().push(event);
    }

    /// Makes every snapshot fetch of `table` fail.
    pub fn fail_fetches(&self, table: &str) {
        self.failing_tables
            .lock()
            .unwrap()
            .insert(table.to_string());
    }

    fn log_len(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    fn log_entry(&self, index: usize) -> Option<Event> {
        self.log.lock().unwrap().get(index).cloned()
    }
}

pub fn users_schema() -> Table {
    named_schema("users")
}

/// The users layout under another table name.
pub fn named_schema(name: &str) -> Table {
    Table::new(
        name,
        vec![
            Column::new("id", Type::Int).primary_key(),
            Column::new("name", Type::String),
        ],
    )
}

pub fn user(id: i64, name: &str) -> Record {
    Record::new(vec![
        Field::new("id", TypedData::new(Type::Int, Value::Int(id))),
        Field::new("name", TypedData::new(Type::String, Value::text(name))),
    ])
}

struct MemorySchema {
    db: Arc<MemoryDb>,
}

#[async_trait::async_trait]
impl SchemaManager for MemorySchema {
    async fn get(&self, _database: &str, table: &str) -> anyhow::Result<Option<TableRef>> {
        Ok(self.db.schema(table))
    }

    async fn create_table(&self, _database: &str, table: &Table) -> anyhow::Result<()> {
        self.db.create(table.clone());
        Ok(())
    }
}

struct MemoryWriter {
    db: Arc<MemoryDb>,
}

#[async_trait::async_trait]
impl Writer for MemoryWriter {
    async fn prepare(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&self, event: &Event) -> anyhow::Result<()> {
        let Some(schema) = self.db.schema(&event.source_table) else {
            return Ok(());
        };
        match event.event_type {
            EventType::Insert | EventType::Update => self
                .db
                .upsert(&event.source_table, event.record.project(&schema)),
            EventType::Delete => self.db.remove(&event.source_table, id_of(&event.record)),
        }
        Ok(())
    }

    async fn execute_batch(&self, table: &Table, records: &[Record]) -> anyhow::Result<()> {
        let Some(schema) = self.db.schema(&table.name) else {
            return Ok(());
        };
        for record in records {
            self.db.upsert(&table.name, record.project(&schema));
        }
        Ok(())
    }
}

struct MemoryBatchSource {
    db: Arc<MemoryDb>,
}

#[async_trait::async_trait]
impl BatchSource for MemoryBatchSource {
    async fn fetch(
        &self,
        table: &Table,
        from: Option<&Record>,
        limit: usize,
    ) -> anyhow::Result<Vec<Record>> {
        if self.db.failing_tables.lock().unwrap().contains(&table.name) {
            anyhow::bail!("select from {} failed", table.name);
        }
        let start = from.map(id_of).unwrap_or(i64::MIN);
        Ok(self
            .db
            .rows(&table.name)
            .into_iter()
            .filter(|r| id_of(r) >= start)
            .take(limit)
            .collect())
    }
}

struct MemoryDumper {
    opts: DumperOptions,
    db: Arc<MemoryDb>,
    driver: Option<DumpDriver<MemoryBatchSource>>,
}

#[async_trait::async_trait]
impl Dumper for MemoryDumper {
    async fn prepare(&mut self) -> anyhow::Result<()> {
        self.driver = Some(DumpDriver::new(
            MemoryBatchSource {
                db: self.db.clone(),
            },
            Arc::new(MemorySchema {
                db: self.db.clone(),
            }),
            Arc::new(TypeMap::with_defaults()),
            self.opts.subscriber.clone(),
            &self.opts.connector.database,
            self.opts.batch_size,
            self.opts.cancel.clone(),
        ));
        Ok(())
    }

    async fn start_dump_table(&self, table: &TaskTable) -> anyhow::Result<DumpOutcome> {
        self.driver.as_ref().unwrap().dump_table(table).await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.opts.cancel.cancel();
        Ok(())
    }
}

struct ActiveReader<'a>(&'a AtomicUsize);

impl Drop for ActiveReader<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemoryReader {
    db: Arc<MemoryDb>,
    subscriber: Arc<dyn ReaderSubscriber>,
    cancel: CancellationToken,
    position: AtomicUsize,
}

#[async_trait::async_trait]
impl Reader for MemoryReader {
    async fn prepare(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.db.reader_starts.fetch_add(1, Ordering::SeqCst);
        let active = self.db.active_readers.fetch_add(1, Ordering::SeqCst) + 1;
        self.db.max_active_readers.fetch_max(active, Ordering::SeqCst);
        let _active = ActiveReader(&self.db.active_readers);

        if self.db.unreachable.load(Ordering::SeqCst) {
            return Err(CdcError::transient("connection reset by peer").into());
        }
        loop {
            let next = self.position.load(Ordering::SeqCst);
            match self.db.log_entry(next) {
                Some(event) => {
                    let event = match self.db.schema(&event.source_table) {
                        Some(schema) => event.with_schema(schema),
                        None => event,
                    };
                    self.subscriber.reader_event(event).await?;
                    self.position.store(next + 1, Ordering::SeqCst);
                }
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                    }
                }
            }
            if self.cancel.is_cancelled() {
                return Ok(());
            }
        }
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.cancel.cancel();
        Ok(())
    }

    async fn latest_position(&self) -> anyhow::Result<ReaderPosition> {
        Ok(ReaderPosition::new(self.db.log_len().to_string()))
    }

    fn current_position(&self) -> ReaderPosition {
        ReaderPosition::new(self.position.load(Ordering::SeqCst).to_string())
    }

    async fn release(&self) -> anyhow::Result<()> {
        self.db.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Every capability, backed by [`MemoryDb`]s picked by connector id.
pub struct MemoryPlugin {
    dbs: HashMap<String, Arc<MemoryDb>>,
}

impl MemoryPlugin {
    fn db(&self, connector: &Connector) -> Arc<MemoryDb> {
        self.dbs
            .get(&connector.id)
            .cloned()
            .expect("connector is backed by a memory db")
    }
}

impl Plugin for MemoryPlugin {
    fn name(&self) -> &str {
        "memory"
    }

    fn schema_manager(
        &self,
        opts: peer_core::ConnectorOptions,
    ) -> Option<Arc<dyn SchemaManager>> {
        Some(Arc::new(MemorySchema {
            db: self.db(&opts.connector),
        }))
    }

    fn reader(&self, opts: ReaderOptions) -> Option<Box<dyn Reader>> {
        let position = opts.task.last_cdc_position.parse().unwrap_or(0);
        Some(Box::new(MemoryReader {
            db: self.db(&opts.connector),
            subscriber: opts.subscriber,
            cancel: opts.cancel,
            position: AtomicUsize::new(position),
        }))
    }

    fn writer(&self, opts: WriterOptions) -> Option<Box<dyn Writer>> {
        Some(Box::new(MemoryWriter {
            db: self.db(&opts.connector),
        }))
    }

    fn dumper(&self, opts: DumperOptions) -> Option<Box<dyn Dumper>> {
        let db = self.db(&opts.connector);
        Some(Box::new(MemoryDumper {
            opts,
            db,
            driver: None,
        }))
    }
}

fn connector(id: &str) -> Connector {
    Connector {
        id: id.to_string(),
        name: id.to_string(),
        db_type: DbType::Postgres,
        target_type: TargetType::Both,
        host: "localhost".to_string(),
        port: 5432,
        username: "cdc".to_string(),
        password: "cdc".to_string(),
        database: "app".to_string(),
    }
}

/// A fresh source, destination, catalog and runtime.
pub struct Fixture {
    pub source: Arc<MemoryDb>,
    pub destination: Arc<MemoryDb>,
    pub store: Arc<MemoryCatalog>,
    pub runtime: Runtime,
}

impl Fixture {
    pub async fn new() -> Self {
        let source = Arc::new(MemoryDb::default());
        let destination = Arc::new(MemoryDb::default());
        let mut dbs = HashMap::new();
        dbs.insert(SOURCE.to_string(), source.clone());
        dbs.insert(DESTINATION.to_string(), destination.clone());
        let mut plugins = PluginRegistry::new();
        plugins.register(DbType::Postgres, Arc::new(MemoryPlugin { dbs }));

        let store = Arc::new(MemoryCatalog::new());
        store.save_connector(&connector(SOURCE)).await.unwrap();
        store.save_connector(&connector(DESTINATION)).await.unwrap();

        let config = RuntimeConfig {
            save_interval: Duration::from_millis(50),
            restart_grace: Duration::from_millis(10),
            batch_size: 2,
        };
        let runtime = Runtime::new(store.clone(), Arc::new(plugins), config);
        Self {
            source,
            destination,
            store,
            runtime,
        }
    }

    pub async fn add_task(&self, id: &str, configure: impl FnOnce(&mut Task)) -> Task {
        let mut task = Task {
            id: id.to_string(),
            name: id.to_string(),
            reader: SOURCE.to_string(),
            writer: DESTINATION.to_string(),
            tables: "users".to_string(),
            dumper_enabled: true,
            cdc_enabled: true,
            migrate_enabled: true,
            status: TaskStatus::Active,
            cdc_status: CdcStatus::Running,
            ..Default::default()
        };
        configure(&mut task);
        self.store.save_task(&task).await.unwrap();
        task
    }

    pub fn seed_users(&self, count: i64) {
        self.seed("users", count);
    }

    /// Creates `table` on the source with rows `1..=count`.
    pub fn seed(&self, table: &str, count: i64) {
        self.source.create(named_schema(table));
        for id in 1..=count {
            self.source.upsert(table, user(id, &format!("{}{}", table, id)));
        }
    }

    pub async fn task(&self, id: &str) -> Task {
        self.store.get_task(id).await.unwrap().unwrap()
    }

    pub async fn task_table(&self, id: &str, table: &str) -> TaskTable {
        self.store.get_task_table(id, table).await.unwrap().unwrap()
    }

    /// Checkpoints all tasks until the persisted state satisfies `check`.
    pub async fn save_until(
        &self,
        id: &str,
        table: &str,
        check: impl Fn(&Task, &TaskTable) -> bool,
    ) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            self.runtime.save_all().await;
            if check(&self.task(id).await, &self.task_table(id, table).await) {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for checkpoint of task {}", id);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Polls `check` until it holds, failing the test after a few seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
