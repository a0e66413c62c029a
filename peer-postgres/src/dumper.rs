use std::sync::Arc;

use anyhow::Context;
use peer_connections::PeerConnections;
use peer_core::{
    BatchSource, CachedSchemaManager, DumpDriver, DumpOutcome, Dumper, DumperOptions, Record,
    Table,
};
use pt::TaskTable;
use sql_generator::{Dialect, SqlGenerator};
use value::TypeMap;

use crate::{rows::record_from_row, schema::PostgresSchema, sql_params};

pub struct PgBatchSource {
    connector: pt::Connector,
    connections: Arc<PeerConnections>,
    type_map: Arc<TypeMap>,
}

#[async_trait::async_trait]
impl BatchSource for PgBatchSource {
    async fn fetch(
        &self,
        table: &Table,
        from: Option<&Record>,
        limit: usize,
    ) -> anyhow::Result<Vec<Record>> {
        let stmt = SqlGenerator::new(Dialect::Postgres, table, &self.type_map).dumper(limit, from)?;
        let client = self
            .connections
            .postgres(&self.connector)?
            .get()
            .await
            .context("Failed to get connection from pool")?;
        let rows = client
            .query(stmt.sql.as_str(), &sql_params(&stmt.params))
            .await
            .with_context(|| format!("failed run batch on table {}", table.name))?;
        rows.iter()
            .map(|row| record_from_row(row, table, &self.type_map))
            .collect()
    }
}

pub struct PostgresDumper {
    opts: DumperOptions,
    connections: Arc<PeerConnections>,
    type_map: Arc<TypeMap>,
    driver: Option<DumpDriver<PgBatchSource>>,
}

impl PostgresDumper {
    pub fn new(
        opts: DumperOptions,
        connections: Arc<PeerConnections>,
        type_map: Arc<TypeMap>,
    ) -> Self {
        Self {
            opts,
            connections,
            type_map,
            driver: None,
        }
    }
}

#[async_trait::async_trait]
impl Dumper for PostgresDumper {
    async fn prepare(&mut self) -> anyhow::Result<()> {
        let connector = self.opts.connector.clone();
        // fail early on bad settings
        self.connections.postgres(&connector)?;
        let schema = CachedSchemaManager::new(Arc::new(PostgresSchema::new(
            connector.clone(),
            self.connections.clone(),
            self.type_map.clone(),
        )));
        self.driver = Some(DumpDriver::new(
            PgBatchSource {
                connector: connector.clone(),
                connections: self.connections.clone(),
                type_map: self.type_map.clone(),
            },
            Arc::new(schema),
            self.type_map.clone(),
            self.opts.subscriber.clone(),
            &connector.database,
            self.opts.batch_size,
            self.opts.cancel.clone(),
        ));
        Ok(())
    }

    #[tracing::instrument(skip(self, table), fields(table = %table.table))]
    async fn start_dump_table(&self, table: &TaskTable) -> anyhow::Result<DumpOutcome> {
        let driver = self
            .driver
            .as_ref()
            .context("dumper used before prepare")?;
        driver.dump_table(table).await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.opts.cancel.cancel();
        Ok(())
    }
}
