use std::sync::Arc;

use anyhow::Context;
use mysql_async::{prelude::Queryable, Row};
use peer_connections::PeerConnections;
use peer_core::{Column, SchemaManager, Table, TableRef};
use sql_generator::{Dialect, SqlGenerator};
use value::{SecondaryType, Type, TypeMap};

use crate::rows::column_value;

const COLUMNS_QUERY: &str = "SELECT
    COLUMN_KEY,
    ORDINAL_POSITION,
    IS_NULLABLE,
    COLUMN_NAME,
    COLUMN_TYPE,
    DATA_TYPE,
    CHARACTER_MAXIMUM_LENGTH,
    NUMERIC_PRECISION,
    NUMERIC_SCALE,
    COLUMN_DEFAULT
FROM information_schema.COLUMNS
WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
ORDER BY ORDINAL_POSITION";

/// Maps `DATA_TYPE` (and `COLUMN_TYPE` for signedness and `tinyint(1)`)
/// to the canonical tag and its refinement.
pub fn builtin_type(data_type: &str, column_type: &str) -> (Type, SecondaryType) {
    let column_type = column_type.to_ascii_lowercase();
    match data_type.to_ascii_lowercase().as_str() {
        "tinyint" if column_type.starts_with("tinyint(1)") => (Type::Bool, SecondaryType::Unknown),
        "bool" | "boolean" => (Type::Bool, SecondaryType::Unknown),
        "tinyint" | "smallint" | "year" => (Type::Int, SecondaryType::SmallInt),
        "mediumint" => (Type::Int, SecondaryType::MediumInt),
        "int" | "integer" => (Type::Int, SecondaryType::Unknown),
        "bigint" if column_type.contains("unsigned") => (Type::Uint, SecondaryType::BigInt),
        "bigint" => (Type::Int, SecondaryType::BigInt),
        "float" => (Type::Decimal, SecondaryType::Float),
        "double" | "real" => (Type::Decimal, SecondaryType::Real),
        "decimal" | "numeric" => (Type::Decimal, SecondaryType::Decimal),
        "varchar" => (Type::String, SecondaryType::VarChar),
        "char" => (Type::String, SecondaryType::Char),
        "tinytext" => (Type::String, SecondaryType::SmallText),
        "text" => (Type::String, SecondaryType::Text),
        "mediumtext" => (Type::String, SecondaryType::MediumText),
        "longtext" => (Type::String, SecondaryType::LongText),
        "enum" | "set" => (Type::String, SecondaryType::VarChar),
        "tinyblob" => (Type::Blob, SecondaryType::SmallBlob),
        "blob" | "binary" | "varbinary" => (Type::Blob, SecondaryType::Blob),
        "mediumblob" => (Type::Blob, SecondaryType::MediumBlob),
        "longblob" => (Type::Blob, SecondaryType::LongBlob),
        "json" => (Type::Json, SecondaryType::Unknown),
        "date" => (Type::Date, SecondaryType::Unknown),
        "time" => (Type::Time, SecondaryType::Unknown),
        "datetime" => (Type::Timestamp, SecondaryType::Unknown),
        "timestamp" => (Type::Timestamp, SecondaryType::TimestampWithTz),
        _ => (Type::Unknown, SecondaryType::Unknown),
    }
}

fn mysql_field_type(c: &Column) -> String {
    match c.data_type {
        Type::Int => match c.secondary_type {
            SecondaryType::SmallInt => "smallint".to_string(),
            SecondaryType::MediumInt => "mediumint".to_string(),
            SecondaryType::BigInt => "bigint".to_string(),
            _ => "int".to_string(),
        },
        Type::Uint => "bigint unsigned".to_string(),
        Type::Decimal => match c.secondary_type {
            SecondaryType::Float => "float".to_string(),
            SecondaryType::Real => "double".to_string(),
            _ if c.precision > 0 => format!("decimal({},{})", c.precision, c.scale),
            _ => "decimal(65,30)".to_string(),
        },
        Type::String => match c.secondary_type {
            SecondaryType::VarChar => {
                format!("varchar({})", if c.length > 0 { c.length } else { 255 })
            }
            SecondaryType::Char if c.length > 0 => format!("char({})", c.length),
            SecondaryType::SmallText => "tinytext".to_string(),
            SecondaryType::MediumText => "mediumtext".to_string(),
            SecondaryType::LongText => "longtext".to_string(),
            _ => "text".to_string(),
        },
        Type::Blob => match c.secondary_type {
            SecondaryType::SmallBlob => "tinyblob".to_string(),
            SecondaryType::MediumBlob => "mediumblob".to_string(),
            SecondaryType::LongBlob => "longblob".to_string(),
            _ => "blob".to_string(),
        },
        Type::Date => "date".to_string(),
        Type::Timestamp => "datetime(6)".to_string(),
        Type::Time => "time(6)".to_string(),
        Type::Json => "json".to_string(),
        Type::Uuid => "char(36)".to_string(),
        Type::Bool => "tinyint(1)".to_string(),
        Type::Unknown | Type::Null => "text".to_string(),
    }
}

fn starrocks_field_type(c: &Column) -> String {
    match c.data_type {
        Type::Int => match c.secondary_type {
            SecondaryType::SmallInt => "smallint".to_string(),
            SecondaryType::BigInt => "bigint".to_string(),
            _ => "int".to_string(),
        },
        Type::Uint => "largeint".to_string(),
        Type::Decimal => match c.secondary_type {
            SecondaryType::Float => "float".to_string(),
            SecondaryType::Real => "double".to_string(),
            _ if c.precision > 0 => format!("decimal({},{})", c.precision.min(38), c.scale.min(38)),
            _ => "decimal(38,10)".to_string(),
        },
        Type::String => match c.secondary_type {
            SecondaryType::VarChar if c.length > 0 => format!("varchar({})", c.length),
            SecondaryType::Char if c.length > 0 => format!("char({})", c.length),
            _ => "string".to_string(),
        },
        Type::Blob => "varbinary".to_string(),
        Type::Date => "date".to_string(),
        Type::Timestamp => "datetime".to_string(),
        Type::Json => "json".to_string(),
        Type::Uuid => "varchar(36)".to_string(),
        Type::Bool => "boolean".to_string(),
        Type::Time | Type::Unknown | Type::Null => "string".to_string(),
    }
}

/// Column definition used when creating a destination table.
pub fn field_definition(dialect: Dialect, c: &Column) -> String {
    let field_type = match dialect {
        Dialect::StarRocks => starrocks_field_type(c),
        Dialect::MySql | Dialect::Postgres => mysql_field_type(c),
    };
    let mut def = format!("{} {}", dialect.quote(&c.name), field_type);
    if !c.nullable {
        def.push_str(" NOT NULL");
    }
    def
}

pub struct MySqlSchema {
    connector: pt::Connector,
    dialect: Dialect,
    connections: Arc<PeerConnections>,
    type_map: Arc<TypeMap>,
}

impl MySqlSchema {
    pub fn new(
        connector: pt::Connector,
        dialect: Dialect,
        connections: Arc<PeerConnections>,
        type_map: Arc<TypeMap>,
    ) -> Self {
        Self {
            connector,
            dialect,
            connections,
            type_map,
        }
    }

    fn column_from_row(row: &Row) -> anyhow::Result<Column> {
        let key: String = column_value(row, 0)?.unwrap_or_default();
        let nullable: String = column_value(row, 2)?.unwrap_or_default();
        let name: String = column_value(row, 3)?.context("column without a name")?;
        let column_type: String = column_value(row, 4)?.unwrap_or_default();
        let data_type: String = column_value(row, 5)?.unwrap_or_default();
        let length: Option<u64> = column_value(row, 6)?;
        let precision: Option<u64> = column_value(row, 7)?;
        let scale: Option<u64> = column_value(row, 8)?;
        let default: Option<String> = column_value(row, 9)?;

        let (t, st) = builtin_type(&data_type, &column_type);
        let mut column = Column::new(name, t).secondary(st);
        column.is_primary_key = key.eq_ignore_ascii_case("PRI");
        column.nullable = nullable == "YES";
        column.default = default;
        column.length = length.unwrap_or_default().min(u32::MAX as u64) as u32;
        column.precision = precision.unwrap_or_default() as u32;
        column.scale = scale.unwrap_or_default() as u32;
        Ok(column)
    }
}

#[async_trait::async_trait]
impl SchemaManager for MySqlSchema {
    #[tracing::instrument(skip(self))]
    async fn get(&self, database: &str, table: &str) -> anyhow::Result<Option<TableRef>> {
        let mut conn = self
            .connections
            .mysql(&self.connector)?
            .get_conn()
            .await
            .with_context(|| format!("can not connect to {}", self.connector.name))?;
        let rows: Vec<Row> = conn
            .exec(COLUMNS_QUERY, (database, table))
            .await
            .with_context(|| format!("failed sync schema of table {}", table))?;
        if rows.is_empty() {
            return Ok(None);
        }
        let columns = rows
            .iter()
            .map(Self::column_from_row)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Some(Arc::new(Table::new(table, columns))))
    }

    #[tracing::instrument(skip(self, table), fields(table = %table.name))]
    async fn create_table(&self, _database: &str, table: &Table) -> anyhow::Result<()> {
        let dialect = self.dialect;
        let sql = SqlGenerator::new(dialect, table, &self.type_map)
            .create_table(|c| field_definition(dialect, c))?;
        tracing::info!("Migrate Table SQL: {}", sql);
        let mut conn = self
            .connections
            .mysql(&self.connector)?
            .get_conn()
            .await
            .with_context(|| format!("can not connect to {}", self.connector.name))?;
        conn.query_drop(sql)
            .await
            .with_context(|| format!("failed to create table {}", table.name))?;
        Ok(())
    }
}
