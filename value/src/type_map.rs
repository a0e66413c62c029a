use std::{collections::HashMap, str::FromStr};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use snafu::ResultExt;
use uuid::Uuid;

use crate::{
    error::{JsonSnafu, ParseSnafu, UnsupportedSnafu},
    Native, Type, TypeError, TypedData, Value,
};

pub type Encoder = fn(Value) -> Result<Value, TypeError>;
pub type Decoder = fn(Value) -> Result<Value, TypeError>;

/// Per-dialect registry of encoders (driver value to canonical value) and
/// decoders (canonical value to something the destination driver can bind).
#[derive(Clone, Default)]
pub struct TypeMap {
    encoders: HashMap<Type, Encoder>,
    decoders: HashMap<Type, Decoder>,
}

impl TypeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut m = Self::new();
        m.register_encoder(Type::Int, encode_int);
        m.register_encoder(Type::Uint, encode_uint);
        m.register_encoder(Type::Decimal, encode_decimal);
        m.register_encoder(Type::Bool, encode_bool);
        m.register_encoder(Type::Json, encode_json);
        m.register_encoder(Type::String, encode_string);
        m.register_encoder(Type::Uuid, encode_uuid);
        m.register_encoder(Type::Date, encode_date);
        m.register_encoder(Type::Time, encode_time);
        m.register_encoder(Type::Timestamp, encode_timestamp);
        m.register_encoder(Type::Blob, encode_blob);

        m.register_decoder(Type::Json, decode_json);
        m
    }

    pub fn register_encoder(&mut self, t: Type, encoder: Encoder) {
        self.encoders.insert(t, encoder);
    }

    pub fn register_decoder(&mut self, t: Type, decoder: Decoder) {
        self.decoders.insert(t, decoder);
    }

    pub fn encode(&self, t: Type, v: impl Into<Native>) -> Result<TypedData, TypeError> {
        let v = match v.into() {
            Native::Typed(typed) => return Ok(typed),
            Native::Raw(v) => v,
        };
        if v.is_null() {
            return Ok(TypedData::null());
        }
        match self.encoders.get(&t) {
            Some(encoder) => Ok(TypedData::new(t, encoder(v)?)),
            // unregistered types go through untouched
            None => Ok(TypedData::new(t, v)),
        }
    }

    pub fn decode(&self, data: &TypedData) -> Result<Value, TypeError> {
        if data.is_null() {
            return Ok(Value::Null);
        }
        match self.decoders.get(&data.t) {
            Some(decoder) => decoder(data.v.clone()),
            None => Ok(data.v.clone()),
        }
    }
}

impl std::fmt::Debug for TypeMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeMap")
            .field("encoders", &self.encoders.keys().collect::<Vec<_>>())
            .field("decoders", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn text_of(v: &Value) -> Option<String> {
    match v {
        Value::Text(s) => Some(s.clone()),
        Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        _ => None,
    }
}

fn parse<T: FromStr>(input: String, target: &'static str) -> Result<T, TypeError> {
    input
        .trim()
        .parse::<T>()
        .map_err(|_| ParseSnafu { input, target }.build())
}

fn unsupported(target: &'static str, v: &Value) -> TypeError {
    UnsupportedSnafu {
        target,
        kind: v.kind(),
    }
    .build()
}

pub fn encode_int(v: Value) -> Result<Value, TypeError> {
    match v {
        Value::Int(_) | Value::Uint(_) => Ok(v),
        Value::Bool(b) => Ok(Value::Int(b as i64)),
        _ => match text_of(&v) {
            Some(s) => Ok(Value::Int(parse(s, "int")?)),
            None => Err(unsupported("int", &v)),
        },
    }
}

pub fn encode_uint(v: Value) -> Result<Value, TypeError> {
    match v {
        Value::Uint(_) => Ok(v),
        Value::Int(n) if n >= 0 => Ok(Value::Uint(n as u64)),
        _ => match text_of(&v) {
            Some(s) => Ok(Value::Uint(parse(s, "uint")?)),
            None => Err(unsupported("uint", &v)),
        },
    }
}

pub fn encode_decimal(v: Value) -> Result<Value, TypeError> {
    match v {
        Value::Numeric(_) | Value::Float(_) => Ok(v),
        Value::Int(n) => Ok(Value::Numeric(Decimal::from(n))),
        Value::Uint(n) => Ok(Value::Numeric(Decimal::from(n))),
        _ => match text_of(&v) {
            Some(s) => Ok(Value::Numeric(parse(s, "decimal")?)),
            None => Err(unsupported("decimal", &v)),
        },
    }
}

fn parse_bool(s: String) -> Result<bool, TypeError> {
    match s.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => ParseSnafu {
            input: s,
            target: "bool",
        }
        .fail(),
    }
}

pub fn encode_bool(v: Value) -> Result<Value, TypeError> {
    match v {
        Value::Bool(_) => Ok(v),
        Value::Int(n) => Ok(Value::Bool(n != 0)),
        Value::Uint(n) => Ok(Value::Bool(n != 0)),
        _ => match text_of(&v) {
            Some(s) => Ok(Value::Bool(parse_bool(s)?)),
            None => Err(unsupported("bool", &v)),
        },
    }
}

pub fn encode_string(v: Value) -> Result<Value, TypeError> {
    match v {
        Value::Text(_) => Ok(v),
        _ => Ok(Value::Text(v.to_plain_string())),
    }
}

pub fn encode_json(v: Value) -> Result<Value, TypeError> {
    match text_of(&v) {
        Some(s) => Ok(Value::Json(serde_json::from_str(&s).context(JsonSnafu)?)),
        None => Ok(v),
    }
}

pub fn encode_uuid(v: Value) -> Result<Value, TypeError> {
    match v {
        Value::Bytes(ref b) if b.len() == 16 => match Uuid::from_slice(b) {
            Ok(id) => Ok(Value::Uuid(id)),
            Err(_) => Err(unsupported("uuid", &v)),
        },
        Value::Text(s) => Ok(Value::Uuid(parse(s, "uuid")?)),
        _ => Ok(v),
    }
}

// unparsable text is left for the destination driver to interpret
pub fn encode_date(v: Value) -> Result<Value, TypeError> {
    match v {
        Value::Text(ref s) => Ok(NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map(Value::Date)
            .unwrap_or(v)),
        Value::Timestamp(ts) => Ok(Value::Date(ts.date())),
        _ => Ok(v),
    }
}

pub fn encode_time(v: Value) -> Result<Value, TypeError> {
    match v {
        Value::Text(ref s) => Ok(NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")
            .map(Value::Time)
            .unwrap_or(v)),
        _ => Ok(v),
    }
}

pub fn encode_timestamp(v: Value) -> Result<Value, TypeError> {
    match v {
        Value::Text(ref s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Ok(Value::TimestampTz(ts.with_timezone(&Utc)));
            }
            for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
                if let Ok(ts) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Ok(Value::Timestamp(ts));
                }
            }
            Ok(v)
        }
        _ => Ok(v),
    }
}

pub fn encode_blob(v: Value) -> Result<Value, TypeError> {
    match v {
        Value::Text(s) => Ok(Value::Bytes(s.into_bytes().into())),
        _ => Ok(v),
    }
}

pub fn decode_json(v: Value) -> Result<Value, TypeError> {
    match v {
        Value::Text(_) => Ok(v),
        Value::Bytes(b) => Ok(Value::Text(String::from_utf8_lossy(&b).into_owned())),
        _ => Ok(Value::Text(v.to_serde_json_value().to_string())),
    }
}

/// Booleans as 0/1 for dialects without a native boolean.
pub fn decode_bool_as_int(v: Value) -> Result<Value, TypeError> {
    match v {
        Value::Bool(b) => Ok(Value::Int(b as i64)),
        _ => Ok(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(map: &TypeMap, t: Type, v: Value) -> TypedData {
        let typed = map.encode(t, v).unwrap();
        let decoded = map.decode(&typed).unwrap();
        let again = map.encode(t, decoded).unwrap();
        assert_eq!(again, typed, "round trip of {:?}", t);
        typed
    }

    #[test]
    fn canonical_types_survive_a_round_trip() {
        let map = TypeMap::with_defaults();
        round_trip(&map, Type::Int, Value::text("42"));
        round_trip(&map, Type::Decimal, Value::text("12.340"));
        round_trip(&map, Type::String, Value::text("hello"));
        round_trip(&map, Type::Bool, Value::Int(1));
        let id = Uuid::new_v4();
        round_trip(&map, Type::Uuid, Value::bytes(id.as_bytes().to_vec()));
        round_trip(&map, Type::Blob, Value::bytes(vec![1u8, 2, 3]));

        let json = round_trip(&map, Type::Json, Value::text(r#"{"a":[1,2]}"#));
        assert_eq!(json.v, Value::Json(serde_json::json!({"a": [1, 2]})));
    }

    #[test]
    fn encoding_normalises_driver_values() {
        let map = TypeMap::with_defaults();
        assert_eq!(map.encode(Type::Int, Value::text(" 7")).unwrap().v, Value::Int(7));
        assert_eq!(
            map.encode(Type::Bool, Value::text("TRUE")).unwrap().v,
            Value::Bool(true)
        );
        assert_eq!(
            map.encode(Type::String, Value::Int(9)).unwrap().v,
            Value::text("9")
        );
        assert_eq!(
            map.encode(Type::Timestamp, Value::text("2024-01-02 03:04:05")).unwrap().v,
            Value::Timestamp(
                NaiveDate::from_ymd_opt(2024, 1, 2)
                    .unwrap()
                    .and_hms_opt(3, 4, 5)
                    .unwrap()
            )
        );
    }

    #[test]
    fn nulls_and_typed_data_short_circuit() {
        let map = TypeMap::with_defaults();
        assert_eq!(map.encode(Type::Int, Value::Null).unwrap(), TypedData::null());

        let typed = TypedData::new(Type::Int, Value::text("not a number"));
        assert_eq!(map.encode(Type::Int, typed.clone()).unwrap(), typed);

        let null_json = TypedData::new(Type::Json, Value::Null);
        assert_eq!(map.decode(&null_json).unwrap(), Value::Null);
    }

    #[test]
    fn unknown_types_pass_through() {
        let map = TypeMap::with_defaults();
        let typed = map.encode(Type::Unknown, Value::text("geometry")).unwrap();
        assert_eq!(typed, TypedData::new(Type::Unknown, Value::text("geometry")));
        assert_eq!(map.decode(&typed).unwrap(), Value::text("geometry"));
    }

    #[test]
    fn bad_input_is_an_error() {
        let map = TypeMap::with_defaults();
        assert!(map.encode(Type::Int, Value::text("abc")).is_err());
        assert!(map.encode(Type::Json, Value::text("{")).is_err());
        assert!(map.encode(Type::Bool, Value::text("maybe")).is_err());
    }

    #[test]
    fn dialect_overrides_replace_defaults() {
        let mut map = TypeMap::with_defaults();
        map.register_decoder(Type::Bool, decode_bool_as_int);
        let typed = map.encode(Type::Bool, Value::Bool(true)).unwrap();
        assert_eq!(map.decode(&typed).unwrap(), Value::Int(1));
    }
}
