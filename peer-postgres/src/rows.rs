use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use peer_core::{CdcError, Field, Record, Table};
use rust_decimal::Decimal;
use tokio_postgres::{types::Type, Row};
use uuid::Uuid;
use value::{TypeMap, Value};

fn get<'a, T>(row: &'a Row, i: usize, f: impl FnOnce(T) -> Value) -> anyhow::Result<Value>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    Ok(row.try_get::<_, Option<T>>(i)?.map(f).unwrap_or(Value::Null))
}

/// Reads column `i` in its native postgres representation.
pub fn value_from_row(row: &Row, i: usize) -> anyhow::Result<Value> {
    let column = &row.columns()[i];
    match column.type_() {
        &Type::BOOL => get(row, i, Value::Bool),
        &Type::VARCHAR | &Type::TEXT | &Type::BPCHAR | &Type::NAME => get(row, i, Value::Text),
        &Type::CHAR => get(row, i, |c: i8| Value::Text(((c as u8) as char).to_string())),
        &Type::INT2 => get(row, i, |n: i16| Value::Int(n as i64)),
        &Type::INT4 => get(row, i, |n: i32| Value::Int(n as i64)),
        &Type::INT8 => get(row, i, Value::Int),
        &Type::OID => get(row, i, |n: u32| Value::Uint(n as u64)),
        &Type::FLOAT4 => get(row, i, |n: f32| Value::Float(n as f64)),
        &Type::FLOAT8 => get(row, i, Value::Float),
        &Type::NUMERIC => get(row, i, |d: Decimal| Value::Numeric(d)),
        &Type::BYTEA => get(row, i, |b: Vec<u8>| Value::bytes(b)),
        &Type::JSON | &Type::JSONB => get(row, i, Value::Json),
        &Type::UUID => get(row, i, |u: Uuid| Value::Uuid(u)),
        &Type::DATE => get(row, i, |d: NaiveDate| Value::Date(d)),
        &Type::TIME => get(row, i, |t: NaiveTime| Value::Time(t)),
        &Type::TIMESTAMP => get(row, i, |t: NaiveDateTime| Value::Timestamp(t)),
        &Type::TIMESTAMPTZ => get(row, i, |t: DateTime<Utc>| Value::TimestampTz(t)),
        other => Err(CdcError::data(format!(
            "column {} has unsupported type {}",
            column.name(),
            other
        ))
        .into()),
    }
}

/// Converts a result row into a record typed after `table`'s columns.
pub fn record_from_row(row: &Row, table: &Table, type_map: &TypeMap) -> anyhow::Result<Record> {
    let mut fields = Vec::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        let raw = value_from_row(row, i)?;
        let data_type = table
            .column_by_name(column.name())
            .map(|c| c.data_type)
            .unwrap_or_default();
        fields.push(Field::new(column.name(), type_map.encode(data_type, raw)?));
    }
    Ok(Record::new(fields))
}
