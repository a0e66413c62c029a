use chrono::{Datelike, NaiveDate, NaiveTime, Timelike};
use mysql_async::{consts::ColumnType, prelude::FromValue, Params, Row};
use peer_core::{Field, Record, Table};
use value::{TypeMap, Value};

/// Charset id MySQL reports for binary strings.
const BINARY_CHARSET: u16 = 63;

/// Reads column `i` as `T`, with SQL NULL as `None`.
pub fn column_value<T: FromValue>(row: &Row, i: usize) -> anyhow::Result<Option<T>> {
    match row.get_opt::<Option<T>, usize>(i) {
        Some(Ok(v)) => Ok(v),
        Some(Err(e)) => Err(anyhow::anyhow!("can not read column {}: {}", i, e)),
        None => Ok(None),
    }
}

fn is_binary(column: &mysql_async::Column) -> bool {
    matches!(
        column.column_type(),
        ColumnType::MYSQL_TYPE_TINY_BLOB
            | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
            | ColumnType::MYSQL_TYPE_LONG_BLOB
            | ColumnType::MYSQL_TYPE_BLOB
            | ColumnType::MYSQL_TYPE_STRING
            | ColumnType::MYSQL_TYPE_VAR_STRING
            | ColumnType::MYSQL_TYPE_BIT
            | ColumnType::MYSQL_TYPE_GEOMETRY
    ) && column.character_set() == BINARY_CHARSET
}

fn naive_time(h: u32, m: u32, s: u32, us: u32) -> Option<NaiveTime> {
    NaiveTime::from_hms_micro_opt(h, m, s, us)
}

/// Converts a wire value of `column` into its native representation.
/// Text and decimals stay text; the type map gives them their final type.
pub fn value_from_mysql(column: &mysql_async::Column, v: &mysql_async::Value) -> Value {
    match v {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Int(n) => Value::Int(*n),
        mysql_async::Value::UInt(n) => Value::Uint(*n),
        mysql_async::Value::Float(f) => Value::Float(*f as f64),
        mysql_async::Value::Double(f) => Value::Float(*f),
        mysql_async::Value::Bytes(b) if is_binary(column) => Value::bytes(b.clone()),
        mysql_async::Value::Bytes(b) => Value::Text(String::from_utf8_lossy(b).into_owned()),
        mysql_async::Value::Date(y, mo, d, h, mi, s, us) => {
            let date = NaiveDate::from_ymd_opt(*y as i32, *mo as u32, *d as u32);
            match column.column_type() {
                ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => {
                    date.map(Value::Date).unwrap_or(Value::Null)
                }
                _ => date
                    .and_then(|d| {
                        naive_time(*h as u32, *mi as u32, *s as u32, *us).map(|t| d.and_time(t))
                    })
                    .map(Value::Timestamp)
                    // zero dates have no calendar representation
                    .unwrap_or(Value::Null),
            }
        }
        mysql_async::Value::Time(neg, days, h, mi, s, us) => {
            match naive_time(*h as u32, *mi as u32, *s as u32, *us) {
                Some(t) if !*neg && *days == 0 => Value::Time(t),
                _ => Value::Text(format!(
                    "{}{}:{:02}:{:02}.{:06}",
                    if *neg { "-" } else { "" },
                    *days * 24 + *h as u32,
                    mi,
                    s,
                    us
                )),
            }
        }
    }
}

/// Converts a bind value into its wire form.
pub fn value_to_mysql(v: &Value) -> mysql_async::Value {
    match v {
        Value::Null => mysql_async::Value::NULL,
        Value::Bool(b) => mysql_async::Value::Int(*b as i64),
        Value::Int(n) => mysql_async::Value::Int(*n),
        Value::Uint(n) => mysql_async::Value::UInt(*n),
        Value::Float(f) => mysql_async::Value::Double(*f),
        Value::Numeric(d) => mysql_async::Value::Bytes(d.to_string().into_bytes()),
        Value::Text(s) => mysql_async::Value::Bytes(s.as_bytes().to_vec()),
        Value::Bytes(b) => mysql_async::Value::Bytes(b.to_vec()),
        Value::Date(d) => {
            mysql_async::Value::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0)
        }
        Value::Time(t) => mysql_async::Value::Time(
            false,
            0,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
            t.nanosecond() / 1_000,
        ),
        Value::Timestamp(ts) => datetime(&ts.date(), &ts.time()),
        Value::TimestampTz(ts) => {
            let naive = ts.naive_utc();
            datetime(&naive.date(), &naive.time())
        }
        Value::Json(j) => mysql_async::Value::Bytes(j.to_string().into_bytes()),
        Value::Uuid(u) => mysql_async::Value::Bytes(u.hyphenated().to_string().into_bytes()),
    }
}

fn datetime(d: &NaiveDate, t: &NaiveTime) -> mysql_async::Value {
    mysql_async::Value::Date(
        d.year() as u16,
        d.month() as u8,
        d.day() as u8,
        t.hour() as u8,
        t.minute() as u8,
        t.second() as u8,
        t.nanosecond() / 1_000,
    )
}

pub fn params(values: &[Value]) -> Params {
    if values.is_empty() {
        Params::Empty
    } else {
        Params::Positional(values.iter().map(value_to_mysql).collect())
    }
}

/// Converts a result row into a record typed after `table`'s columns.
pub fn record_from_row(row: &Row, table: &Table, type_map: &TypeMap) -> anyhow::Result<Record> {
    let mut fields = Vec::with_capacity(row.len());
    for (i, column) in row.columns_ref().iter().enumerate() {
        let name = column.name_str().to_string();
        let raw = row
            .as_ref(i)
            .map(|v| value_from_mysql(column, v))
            .unwrap_or(Value::Null);
        let data_type = table
            .column_by_name(name.as_str())
            .map(|c| c.data_type)
            .unwrap_or_default();
        fields.push(Field::new(name, type_map.encode(data_type, raw)?));
    }
    Ok(Record::new(fields))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDateTime;

    use super::*;

    #[test]
    fn bind_values_use_wire_types() {
        assert_eq!(value_to_mysql(&Value::Bool(true)), mysql_async::Value::Int(1));
        assert_eq!(value_to_mysql(&Value::Null), mysql_async::Value::NULL);
        assert_eq!(
            value_to_mysql(&Value::text("hi")),
            mysql_async::Value::Bytes(b"hi".to_vec())
        );
        let ts = NaiveDateTime::parse_from_str("2024-03-01 10:20:30.5", "%Y-%m-%d %H:%M:%S%.f")
            .unwrap();
        assert_eq!(
            value_to_mysql(&Value::Timestamp(ts)),
            mysql_async::Value::Date(2024, 3, 1, 10, 20, 30, 500_000)
        );
        assert!(matches!(params(&[]), Params::Empty));
        assert!(matches!(params(&[Value::Int(1)]), Params::Positional(ref v) if v.len() == 1));
    }
}
