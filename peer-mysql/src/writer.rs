use std::sync::Arc;

use anyhow::Context;
use mysql_async::prelude::Queryable;
use peer_connections::PeerConnections;
use peer_core::{CachedSchemaManager, Event, Record, Table, TableRef, Writer, WriterOptions};
use sql_generator::{Dialect, SqlGenerator, Statement};
use value::TypeMap;

use crate::{rows::params, schema::MySqlSchema};

/// Placeholder limit of the MySQL protocol.
const MAX_PARAMS: usize = 65535;

/// Applies events to a MySQL compatible destination.
pub struct MySqlWriter {
    opts: WriterOptions,
    dialect: Dialect,
    connections: Arc<PeerConnections>,
    type_map: Arc<TypeMap>,
    schema: Option<CachedSchemaManager>,
}

impl MySqlWriter {
    pub fn new(
        opts: WriterOptions,
        dialect: Dialect,
        connections: Arc<PeerConnections>,
        type_map: Arc<TypeMap>,
    ) -> Self {
        Self {
            opts,
            dialect,
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

    async fn run(&self, stmt: Statement) -> anyhow::Result<()> {
        let mut conn = self
            .connections
            .mysql(&self.opts.connector)?
            .get_conn()
            .await
            .with_context(|| format!("can not connect to {}", self.opts.connector.name))?;
        conn.exec_drop(stmt.sql.as_str(), params(&stmt.params))
            .await
            .with_context(|| format!("cannot execute: {}", stmt.sql))
    }
}

#[async_trait::async_trait]
impl Writer for MySqlWriter {
    async fn prepare(&mut self) -> anyhow::Result<()> {
        self.connections
            .mysql(&self.opts.connector)
            .context("cannot connect to mysql connector")?;
        self.schema = Some(CachedSchemaManager::new(Arc::new(MySqlSchema::new(
            self.opts.connector.clone(),
            self.dialect,
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

        let stmt = SqlGenerator::new(self.dialect, &sch, &self.type_map)
            .dml(&projected)
            .context("cannot generate DML")?;
        self.run(stmt).await
    }

    #[tracing::instrument(skip(self, table, records), fields(table = %table.name, rows = records.len()))]
    async fn execute_batch(&self, table: &Table, records: &[Record]) -> anyhow::Result<()> {
        let Some(sch) = self.destination(&table.name).await? else {
            return Ok(());
        };
        let converted: Vec<Record> = records.iter().map(|r| r.project(&sch)).collect();
        let width = converted.first().map(|r| r.fields.len()).unwrap_or(1).max(1);
        let generator = SqlGenerator::new(self.dialect, &sch, &self.type_map);
        for chunk in converted.chunks((MAX_PARAMS / width).max(1)) {
            let stmt = generator
                .batch_upsert(chunk)
                .context("cannot generate batch SQL")?;
            self.run(stmt).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use peer_core::{Column, Field};
    use pt::{DbType, TargetType, Task};
    use tokio_util::sync::CancellationToken;
    use value::{Type, TypedData, Value};

    use super::*;

    fn options() -> WriterOptions {
        WriterOptions {
            connector: pt::Connector {
                id: "dest".to_string(),
                name: "destination".to_string(),
                db_type: DbType::MySql,
                target_type: TargetType::Writer,
                host: "localhost".to_string(),
                port: 3306,
                username: "cdc".to_string(),
                password: String::new(),
                database: "app".to_string(),
            },
            task: Task::default(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn writes_need_a_prepared_writer() {
        let writer = MySqlWriter::new(
            options(),
            Dialect::MySql,
            Arc::new(PeerConnections::new()),
            Arc::new(TypeMap::with_defaults()),
        );
        let record = Record::new(vec![Field::new(
            "id",
            TypedData::new(Type::Int, Value::Int(1)),
        )]);
        let err = writer
            .execute(&Event::insert("app", "users", record.clone()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("before prepare"));

        let users = Table::new("users", vec![Column::new("id", Type::Int).primary_key()]);
        assert!(writer.execute_batch(&users, &[record]).await.is_err());
    }
}
