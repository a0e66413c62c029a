use serde::{Deserialize, Serialize};

use crate::Value;

/// Canonical, dialect independent column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Type {
    #[default]
    Unknown,
    Null,
    Int,
    Uint,
    Decimal,
    String,
    Bool,
    Date,
    Time,
    Timestamp,
    Json,
    Uuid,
    Blob,
}

/// Refinement of a [`Type`], used when generating DDL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecondaryType {
    #[default]
    Unknown,
    SmallInt,
    MediumInt,
    BigInt,
    Float,
    Real,
    Decimal,
    VarChar,
    Char,
    SmallText,
    MediumText,
    LongText,
    Text,
    SmallBlob,
    MediumBlob,
    LongBlob,
    Blob,
    TimestampWithTz,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypedData {
    pub t: Type,
    pub v: Value,
}

impl TypedData {
    pub fn new(t: Type, v: Value) -> Self {
        Self { t, v }
    }

    pub fn null() -> Self {
        Self {
            t: Type::Null,
            v: Value::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        self.v.is_null()
    }
}

impl Default for TypedData {
    fn default() -> Self {
        Self::null()
    }
}

/// Input to [`crate::TypeMap::encode`]: either a raw driver value or data
/// that has already been typed.
#[derive(Debug, Clone, PartialEq)]
pub enum Native {
    Raw(Value),
    Typed(TypedData),
}

impl From<Value> for Native {
    fn from(value: Value) -> Self {
        Native::Raw(value)
    }
}

impl From<TypedData> for Native {
    fn from(value: TypedData) -> Self {
        Native::Typed(value)
    }
}
