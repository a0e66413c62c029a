use std::fmt;

use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

mod error;
mod pg;
pub mod type_map;
mod typed;

pub use error::TypeError;
pub use type_map::{Decoder, Encoder, TypeMap};
pub use typed::{Native, SecondaryType, Type, TypedData};

/// A single column value as it travels between a source and a destination.
#[derive(Debug, PartialEq, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Numeric(Decimal),
    Text(String),
    Bytes(Bytes),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
    Uuid(Uuid),
}

impl Value {
    pub fn null() -> Self {
        Value::Null
    }

    pub fn bool(value: bool) -> Self {
        Value::Bool(value)
    }

    pub fn int(value: i64) -> Self {
        Value::Int(value)
    }

    pub fn uint(value: u64) -> Self {
        Value::Uint(value)
    }

    pub fn float(value: f64) -> Self {
        Value::Float(value)
    }

    pub fn numeric(value: Decimal) -> Self {
        Value::Numeric(value)
    }

    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn bytes(value: impl Into<Bytes>) -> Self {
        Value::Bytes(value.into())
    }

    pub fn json(value: serde_json::Value) -> Self {
        Value::Json(value)
    }

    pub fn uuid(value: Uuid) -> Self {
        Value::Uuid(value)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Uint(_) => "uint",
            Value::Float(_) => "float",
            Value::Numeric(_) => "numeric",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::Timestamp(_) => "timestamp",
            Value::TimestampTz(_) => "timestamptz",
            Value::Json(_) => "json",
            Value::Uuid(_) => "uuid",
        }
    }

    /// Text form without JSON quoting, used when a value has to land in a
    /// character column.
    pub fn to_plain_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Uint(n) => n.to_string(),
            Value::Float(n) => n.to_string(),
            Value::Numeric(n) => n.to_string(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Date(d) => d.to_string(),
            Value::Time(t) => t.to_string(),
            Value::Timestamp(ts) => ts.to_string(),
            Value::TimestampTz(ts) => ts.to_rfc3339(),
            Value::Json(j) => j.to_string(),
            Value::Uuid(u) => u.to_string(),
        }
    }

    pub fn from_serde_json_value(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::Uint(u)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Text(n.to_string())
                }
            }
            serde_json::Value::String(s) => Value::Text(s.clone()),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                Value::Json(value.clone())
            }
        }
    }

    /// Reads back a value written by [`Value::to_serde_json_value`] for a
    /// column of type `t`. Blobs travel as base64 text.
    pub fn from_typed_json(t: Type, value: &serde_json::Value) -> Result<Self, TypeError> {
        match (t, value) {
            (Type::Blob, serde_json::Value::String(s)) => {
                let raw = base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map_err(|_| TypeError::Parse {
                        input: s.clone(),
                        target: "blob",
                    })?;
                Ok(Value::Bytes(raw.into()))
            }
            (Type::Json, serde_json::Value::String(_)) => Ok(Value::Json(value.clone())),
            _ => Ok(Self::from_serde_json_value(value)),
        }
    }

    pub fn to_serde_json_value(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::Number(serde_json::Number::from(*n)),
            Value::Uint(n) => serde_json::Value::Number(serde_json::Number::from(*n)),
            Value::Float(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Numeric(n) => serde_json::Value::String(n.to_string()),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => {
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
            Value::Date(d) => serde_json::Value::String(d.to_string()),
            Value::Time(t) => serde_json::Value::String(t.to_string()),
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_string()),
            Value::TimestampTz(ts) => serde_json::Value::String(ts.to_rfc3339()),
            Value::Json(j) => j.clone(),
            Value::Uuid(u) => serde_json::Value::String(u.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Bytes(b) => write!(f, "\\x{}", hex::encode(b)),
            _ => write!(f, "{}", self.to_serde_json_value()),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value.into())
                }
            }
        )+
    };
}

impl_from!(
    bool => Bool,
    i8 => Int,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    u8 => Uint,
    u16 => Uint,
    u32 => Uint,
    u64 => Uint,
    f32 => Float,
    f64 => Float,
    Decimal => Numeric,
    String => Text,
    &str => Text,
    Vec<u8> => Bytes,
    Bytes => Bytes,
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => Timestamp,
    DateTime<Utc> => TimestampTz,
    serde_json::Value => Json,
    Uuid => Uuid,
);

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}
