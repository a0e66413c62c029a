use std::sync::Arc;

use anyhow::Context;
use peer_connections::PeerConnections;
use peer_core::{Column, SchemaManager, Table, TableRef};
use sql_generator::{Dialect, SqlGenerator};
use tokio_postgres::types::Type as PgType;
use value::{SecondaryType, Type, TypeMap};

const COLUMNS_QUERY: &str = "
SELECT
    pa.attname AS column_name,
    pa.attnotnull AS attnotnull,
    pa.atttypmod AS atttypmod,
    pa.attlen AS attlen,
    t.oid AS oid,
    pg_get_expr(ad.adbin, ad.adrelid) AS column_default,
    COALESCE(pa.attnum = ANY(pc.conkey), false) AS is_primary
FROM pg_attribute pa
JOIN pg_class pc_rel ON pa.attrelid = pc_rel.oid
JOIN pg_type t ON pa.atttypid = t.oid
LEFT JOIN pg_constraint pc
    ON pc_rel.oid = pc.conrelid
    AND pc.contype = 'p'
LEFT JOIN pg_attrdef ad
    ON ad.adrelid = pa.attrelid
    AND ad.adnum = pa.attnum
WHERE
    pc_rel.relname = $1
    AND pc_rel.relnamespace = 'public'::regnamespace
    AND pa.attnum > 0
    AND NOT pa.attisdropped
ORDER BY pa.attnum";

/// Maps a postgres type to the canonical tag and its refinement.
pub fn builtin_type(oid: u32) -> (Type, SecondaryType) {
    let Some(ty) = PgType::from_oid(oid) else {
        return (Type::Unknown, SecondaryType::Unknown);
    };
    match ty {
        PgType::INT2 => (Type::Int, SecondaryType::SmallInt),
        PgType::INT4 => (Type::Int, SecondaryType::Unknown),
        PgType::INT8 => (Type::Int, SecondaryType::BigInt),
        PgType::FLOAT4 | PgType::FLOAT8 => (Type::Decimal, SecondaryType::Float),
        PgType::NUMERIC => (Type::Decimal, SecondaryType::Decimal),
        PgType::VARCHAR => (Type::String, SecondaryType::VarChar),
        PgType::CHAR | PgType::BPCHAR => (Type::String, SecondaryType::Char),
        PgType::TEXT => (Type::String, SecondaryType::LongText),
        PgType::BOOL => (Type::Bool, SecondaryType::Unknown),
        PgType::UUID => (Type::Uuid, SecondaryType::Unknown),
        PgType::DATE => (Type::Date, SecondaryType::Unknown),
        PgType::TIME => (Type::Time, SecondaryType::Unknown),
        PgType::TIMESTAMP => (Type::Timestamp, SecondaryType::Unknown),
        PgType::TIMESTAMPTZ => (Type::Timestamp, SecondaryType::TimestampWithTz),
        PgType::JSON | PgType::JSONB => (Type::Json, SecondaryType::Unknown),
        PgType::BYTEA => (Type::Blob, SecondaryType::Blob),
        _ => (Type::Unknown, SecondaryType::Unknown),
    }
}

/// Builds a column from one `pg_attribute` row. A positive typmod carries
/// the declared length of character types and the precision and scale of
/// numerics.
pub fn column_from_attribute(
    name: &str,
    oid: u32,
    not_null: bool,
    typmod: i32,
    attlen: i16,
    is_primary: bool,
    default: Option<String>,
) -> Column {
    let (data_type, secondary_type) = builtin_type(oid);
    let mut column = Column::new(name, data_type).secondary(secondary_type);
    column.nullable = !not_null;
    column.is_primary_key = is_primary;
    column.default = default;
    column.length = attlen.max(0) as u32;
    if typmod > 0 {
        match data_type {
            Type::String => column.length = (typmod - 4).max(0) as u32,
            Type::Decimal => {
                column.precision = ((typmod >> 16) & 0xFFFF) as u32;
                column.scale = ((typmod & 0xFFFF) - 4).max(0) as u32;
            }
            _ => {}
        }
    }
    column
}

fn field_type(c: &Column) -> String {
    match c.data_type {
        Type::Int | Type::Uint => match c.secondary_type {
            SecondaryType::SmallInt => "smallint".to_string(),
            SecondaryType::BigInt => "bigint".to_string(),
            _ => "int".to_string(),
        },
        Type::Decimal => match c.secondary_type {
            SecondaryType::Float | SecondaryType::Real => "float".to_string(),
            _ if c.precision > 0 => format!("decimal({},{})", c.precision, c.scale),
            _ => "numeric".to_string(),
        },
        Type::String => match c.secondary_type {
            SecondaryType::VarChar if c.length > 0 => format!("varchar({})", c.length),
            SecondaryType::Char if c.length > 0 => format!("char({})", c.length),
            _ => "text".to_string(),
        },
        Type::Bool => "bool".to_string(),
        Type::Date => "date".to_string(),
        Type::Time => "time".to_string(),
        Type::Timestamp => match c.secondary_type {
            SecondaryType::TimestampWithTz => "timestamptz".to_string(),
            _ => "timestamp".to_string(),
        },
        Type::Json => "json".to_string(),
        Type::Uuid => "uuid".to_string(),
        Type::Blob => "bytea".to_string(),
        Type::Unknown | Type::Null => "text".to_string(),
    }
}

/// Column definition used when creating a destination table.
pub fn field_definition(c: &Column) -> String {
    let mut def = format!("{} {}", Dialect::Postgres.quote(&c.name), field_type(c));
    if !c.nullable {
        def.push_str(" NOT NULL");
    }
    def
}

pub struct PostgresSchema {
    connector: pt::Connector,
    connections: Arc<PeerConnections>,
    type_map: Arc<TypeMap>,
}

impl PostgresSchema {
    pub fn new(
        connector: pt::Connector,
        connections: Arc<PeerConnections>,
        type_map: Arc<TypeMap>,
    ) -> Self {
        Self {
            connector,
            connections,
            type_map,
        }
    }

    async fn client(&self) -> anyhow::Result<deadpool_postgres::Object> {
        self.connections
            .postgres(&self.connector)?
            .get()
            .await
            .context("Failed to get connection from pool")
    }
}

#[async_trait::async_trait]
impl SchemaManager for PostgresSchema {
    #[tracing::instrument(skip(self))]
    async fn get(&self, _database: &str, table: &str) -> anyhow::Result<Option<TableRef>> {
        let client = self.client().await?;
        let rows = client
            .query(COLUMNS_QUERY, &[&table])
            .await
            .with_context(|| format!("can not get schema information for table {}", table))?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("column_name")?;
            columns.push(column_from_attribute(
                &name,
                row.try_get("oid")?,
                row.try_get("attnotnull")?,
                row.try_get("atttypmod")?,
                row.try_get("attlen")?,
                row.try_get("is_primary")?,
                row.try_get("column_default")?,
            ));
        }
        Ok(Some(Arc::new(Table::new(table, columns))))
    }

    #[tracing::instrument(skip(self, table), fields(table = %table.name))]
    async fn create_table(&self, _database: &str, table: &Table) -> anyhow::Result<()> {
        let sql = SqlGenerator::new(Dialect::Postgres, table, &self.type_map)
            .create_table(field_definition)?;
        tracing::info!("Migrate Table SQL: {}", sql);
        let client = self.client().await?;
        client
            .batch_execute(&sql)
            .await
            .with_context(|| format!("failed to create table {}", table.name))?;
        Ok(())
    }
}
