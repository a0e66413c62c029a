use std::sync::Arc;

use anyhow::Context;
use mysql_async::{prelude::Queryable, Row};
use peer_connections::PeerConnections;
use peer_core::{
    BatchSource, CachedSchemaManager, DumpDriver, DumpOutcome, Dumper, DumperOptions, Record,
    Table,
};
use pt::TaskTable;
use sql_generator::{Dialect, SqlGenerator};
use value::TypeMap;

use crate::{
    rows::{params, record_from_row},
    schema::MySqlSchema,
};

pub struct MySqlBatchSource {
    connector: pt::Connector,
    dialect: Dialect,
    connections: Arc<PeerConnections>,
    type_map: Arc<TypeMap>,
}

#[async_trait::async_trait]
impl BatchSource for MySqlBatchSource {
    async fn fetch(
        &self,
        table: &Table,
        from: Option<&Record>,
        limit: usize,
    ) -> anyhow::Result<Vec<Record>> {
        let stmt = SqlGenerator::new(self.dialect, table, &self.type_map).dumper(limit, from)?;
        let mut conn = self
            .connections
            .mysql(&self.connector)?
            .get_conn()
            .await
            .with_context(|| format!("can not connect to {}", self.connector.name))?;
        let rows: Vec<Row> = conn
            .exec(stmt.sql.as_str(), params(&stmt.params))
            .await
            .with_context(|| format!("failed run batch on table {}", table.name))?;
        rows.iter()
            .map(|row| record_from_row(row, table, &self.type_map))
            .collect()
    }
}

pub struct MySqlDumper {
    opts: DumperOptions,
    dialect: Dialect,
    connections: Arc<PeerConnections>,
    type_map: Arc<TypeMap>,
    driver: Option<DumpDriver<MySqlBatchSource>>,
}

impl MySqlDumper {
    pub fn new(
        opts: DumperOptions,
        dialect: Dialect,
        connections: Arc<PeerConnections>,
        type_map: Arc<TypeMap>,
    ) -> Self {
        Self {
            opts,
            dialect,
            connections,
            type_map,
            driver: None,
        }
    }
}

#[async_trait::async_trait]
impl Dumper for MySqlDumper {
    async fn prepare(&mut self) -> anyhow::Result<()> {
        let connector = self.opts.connector.clone();
        self.connections.mysql(&connector)?;
        let schema = CachedSchemaManager::new(Arc::new(MySqlSchema::new(
            connector.clone(),
            self.dialect,
            self.connections.clone(),
            self.type_map.clone(),
        )));
        self.driver = Some(DumpDriver::new(
            MySqlBatchSource {
                connector: connector.clone(),
                dialect: self.dialect,
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
