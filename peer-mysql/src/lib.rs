use std::sync::Arc;

use anyhow::Context;
use mysql_async::prelude::Queryable;
use peer_connections::PeerConnections;
use peer_core::{
    Connector, ConnectorOptions, Dumper, DumperOptions, Plugin, SchemaManager, Writer,
    WriterOptions,
};
use sql_generator::Dialect;
use value::{type_map::decode_bool_as_int, Type, TypeMap};

mod dumper;
mod rows;
mod schema;
mod writer;

pub use dumper::{MySqlBatchSource, MySqlDumper};
pub use rows::{column_value, record_from_row, value_from_mysql, value_to_mysql};
pub use schema::{builtin_type, field_definition, MySqlSchema};
pub use writer::MySqlWriter;

/// Connectivity check for a MySQL protocol endpoint.
pub struct MySqlConnector {
    connector: pt::Connector,
    connections: Arc<PeerConnections>,
}

#[async_trait::async_trait]
impl Connector for MySqlConnector {
    #[tracing::instrument(skip(self), fields(connector = %self.connector.name))]
    async fn test(&self) -> anyhow::Result<()> {
        let mut conn = self
            .connections
            .mysql(&self.connector)?
            .get_conn()
            .await
            .with_context(|| format!("can not connect to {}", self.connector.name))?;
        conn.query_drop("SELECT 1")
            .await
            .with_context(|| format!("can not reach {}", self.connector.name))?;
        Ok(())
    }
}

/// MySQL and StarRocks share the wire protocol; the dialect decides the
/// DDL, the upsert form and whether the plugin can be a dump source.
pub struct MySqlPlugin {
    name: &'static str,
    dialect: Dialect,
    connections: Arc<PeerConnections>,
    type_map: Arc<TypeMap>,
}

impl MySqlPlugin {
    pub fn new(connections: Arc<PeerConnections>) -> Self {
        Self::with_dialect("mysql", Dialect::MySql, connections)
    }

    pub fn starrocks(connections: Arc<PeerConnections>) -> Self {
        Self::with_dialect("starrocks", Dialect::StarRocks, connections)
    }

    fn with_dialect(
        name: &'static str,
        dialect: Dialect,
        connections: Arc<PeerConnections>,
    ) -> Self {
        let mut type_map = TypeMap::with_defaults();
        type_map.register_decoder(Type::Bool, decode_bool_as_int);
        Self {
            name,
            dialect,
            connections,
            type_map: Arc::new(type_map),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn type_map(&self) -> &TypeMap {
        &self.type_map
    }
}

impl Plugin for MySqlPlugin {
    fn name(&self) -> &str {
        self.name
    }

    fn connector(&self, opts: ConnectorOptions) -> Option<Box<dyn Connector>> {
        Some(Box::new(MySqlConnector {
            connector: opts.connector,
            connections: self.connections.clone(),
        }))
    }

    fn schema_manager(&self, opts: ConnectorOptions) -> Option<Arc<dyn SchemaManager>> {
        Some(Arc::new(MySqlSchema::new(
            opts.connector,
            self.dialect,
            self.connections.clone(),
            self.type_map.clone(),
        )))
    }

    fn writer(&self, opts: WriterOptions) -> Option<Box<dyn Writer>> {
        Some(Box::new(MySqlWriter::new(
            opts,
            self.dialect,
            self.connections.clone(),
            self.type_map.clone(),
        )))
    }

    fn dumper(&self, opts: DumperOptions) -> Option<Box<dyn Dumper>> {
        // starrocks is only ever a destination
        if self.dialect == Dialect::StarRocks {
            return None;
        }
        Some(Box::new(MySqlDumper::new(
            opts,
            self.dialect,
            self.connections.clone(),
            self.type_map.clone(),
        )))
    }
}
