use std::sync::Arc;

use anyhow::Context;
use peer_connections::PeerConnections;
use peer_core::{
    Connector, ConnectorOptions, Dumper, DumperOptions, Plugin, SchemaManager, Writer,
    WriterOptions,
};
use tokio_postgres::types::ToSql;
use value::{TypeMap, Value};

mod dumper;
mod rows;
mod schema;
mod writer;

pub use dumper::{PgBatchSource, PostgresDumper};
pub use rows::{record_from_row, value_from_row};
pub use schema::{builtin_type, column_from_attribute, field_definition, PostgresSchema};
pub use writer::PostgresWriter;

pub(crate) fn sql_params(values: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    values.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

/// Connectivity check for a postgres endpoint.
pub struct PostgresConnector {
    connector: pt::Connector,
    connections: Arc<PeerConnections>,
}

#[async_trait::async_trait]
impl Connector for PostgresConnector {
    #[tracing::instrument(skip(self), fields(connector = %self.connector.name))]
    async fn test(&self) -> anyhow::Result<()> {
        let client = self
            .connections
            .postgres(&self.connector)?
            .get()
            .await
            .context("Failed to get connection from pool")?;
        client
            .query_one("SELECT 1", &[])
            .await
            .with_context(|| format!("can not reach {}", self.connector.name))?;
        Ok(())
    }
}

pub struct PostgresPlugin {
    connections: Arc<PeerConnections>,
    type_map: Arc<TypeMap>,
}

impl PostgresPlugin {
    pub fn new(connections: Arc<PeerConnections>) -> Self {
        Self {
            connections,
            type_map: Arc::new(TypeMap::with_defaults()),
        }
    }
}

impl Plugin for PostgresPlugin {
    fn name(&self) -> &str {
        "postgres"
    }

    fn connector(&self, opts: ConnectorOptions) -> Option<Box<dyn Connector>> {
        Some(Box::new(PostgresConnector {
            connector: opts.connector,
            connections: self.connections.clone(),
        }))
    }

    fn schema_manager(&self, opts: ConnectorOptions) -> Option<Arc<dyn SchemaManager>> {
        Some(Arc::new(PostgresSchema::new(
            opts.connector,
            self.connections.clone(),
            self.type_map.clone(),
        )))
    }

    fn writer(&self, opts: WriterOptions) -> Option<Box<dyn Writer>> {
        Some(Box::new(PostgresWriter::new(
            opts,
            self.connections.clone(),
            self.type_map.clone(),
        )))
    }

    fn dumper(&self, opts: DumperOptions) -> Option<Box<dyn Dumper>> {
        Some(Box::new(PostgresDumper::new(
            opts,
            self.connections.clone(),
            self.type_map.clone(),
        )))
    }
}
