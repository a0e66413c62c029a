use std::sync::Arc;

use anyhow::Context;
use peer_connections::PeerConnections;
use peer_core::{CachedSchemaManager, Event, Record, Table, TableRef, Writer, WriterOptions};
use sql_generator::{Dialect, SqlGenerator, Statement};
use value::TypeMap;

use crate::{schema::PostgresSchema, sql_params};

/// Upper bound on bind parameters in one postgres statement.
const MAX_PARAMS: usize = 65535;

pub struct PostgresWriter {
    opts: WriterOptions,
    connections: Arc<PeerConnections>,
    type_map: Arc<TypeMap>,
    schema: Option<CachedSchemaManager>,
}

impl PostgresWriter {
    pub fn new(
        opts: WriterOptions,
        connections: Arc<PeerConnections>,
        type_map: Arc<TypeMap>,
    ) -> Self {
        Self {
            opts,
            connections,
            type_map,
            schema: None,
        }
    }

    async fn destination(&self, table: &str) -> anyhow::Result<Option<TableRef>> {
        self.schema
            .as_ref()
            .context("writer used before prepare")?
            .existing(&self.opts.connector.database, table)
            .await
    }

    async fn run(&self, stmt: &Statement) -> anyhow::Result<u64> {
        let client = self
            .connections
            .postgres(&self.opts.connector)?
            .get()
            .await
            .context("Failed to get connection from pool")?;
        client
            .execute(stmt.sql.as_str(), &sql_params(&stmt.params))
            .await
            .with_context(|| format!("cannot execute: {}", stmt.sql))
    }
}

#[async_trait::async_trait]
impl Writer for PostgresWriter {
    async fn prepare(&mut self) -> anyhow::Result<()> {
        self.connections
            .postgres(&self.opts.connector)
            .context("cannot connect to postgres connector")?;
        self.schema = Some(CachedSchemaManager::new(Arc::new(PostgresSchema::new(
            self.opts.connector.clone(),
            self.connections.clone(),
            self.type_map.clone(),
        ))));
        Ok(())
    }

    #[tracing::instrument(skip(self, event), fields(table = %event.source_table))]
    async fn execute(&self, event: &Event) -> anyhow::Result<()> {
        let Some(sch) = self.destination(&event.source_table).await? else {
            return Ok(());
        };
        let projected = event.project(&sch);

        let stmt = SqlGenerator::new(Dialect::Postgres, &sch, &self.type_map)
            .dml(&projected)
            .context("cannot generate DML")?;
        self.run(&stmt).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, table, records), fields(table = %table.name, rows = records.len()))]
    async fn execute_batch(&self, table: &Table, records: &[Record]) -> anyhow::Result<()> {
        let Some(sch) = self.destination(&table.name).await? else {
            return Ok(());
        };
        let converted: Vec<Record> = records.iter().map(|r| r.project(&sch)).collect();
        let width = converted.first().map(|r| r.fields.len()).unwrap_or(1).max(1);
        let generator = SqlGenerator::new(Dialect::Postgres, &sch, &self.type_map);
        for chunk in converted.chunks((MAX_PARAMS / width).max(1)) {
            let stmt = generator
                .batch_upsert(chunk)
                .context("cannot generate batch SQL")?;
            self.run(&stmt).await?;
        }
        Ok(())
    }
}
