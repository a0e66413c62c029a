use std::fmt;

use chrono::{DateTime, Utc};
use value::{TypedData, Value};

use crate::{error::CdcError, schema::TableRef, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EventType::Insert => write!(f, "insert"),
            EventType::Update => write!(f, "update"),
            EventType::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub value: TypedData,
}

impl Field {
    pub fn new(name: impl Into<String>, value: TypedData) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Ordered list of typed fields for one row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub fields: Vec<Field>,
}

impl Record {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn value(&self, name: &str) -> Option<&TypedData> {
        self.field_by_name(name).map(|f| &f.value)
    }

    /// Replaces the field if present, appends it otherwise.
    pub fn set(&mut self, name: &str, value: TypedData) {
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(field) => field.value = value,
            None => self.fields.push(Field::new(name, value)),
        }
    }

    /// Keeps only the fields the given schema knows about.
    pub fn project(&self, schema: &Table) -> Record {
        Record {
            fields: self
                .fields
                .iter()
                .filter(|f| schema.has_column(&f.name))
                .cloned()
                .collect(),
        }
    }

    pub fn has_keys(&self, keys: &[&str]) -> bool {
        keys.iter().all(|k| self.field_by_name(k).is_some())
    }

    /// JSON object of the given key columns; missing keys are left out.
    pub fn key_json(&self, keys: &[&str]) -> serde_json::Map<String, serde_json::Value> {
        keys.iter()
            .filter_map(|k| {
                self.value(k)
                    .map(|v| (k.to_string(), v.v.to_serde_json_value()))
            })
            .collect()
    }

    /// Compares key columns by their JSON form, so that integer widths and
    /// other representation details do not matter.
    pub fn same_keys(&self, other: &Record, keys: &[&str]) -> bool {
        !keys.is_empty()
            && keys.iter().all(|k| match (self.value(k), other.value(k)) {
                (Some(a), Some(b)) => {
                    !a.is_null() && a.v.to_serde_json_value() == b.v.to_serde_json_value()
                }
                _ => false,
            })
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.fields.iter().map(|f| &f.value.v)
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub source_database: String,
    pub source_table: String,
    pub record: Record,
    /// Pre-image, only for updates.
    pub old_record: Option<Record>,
    pub source_schema: Option<TableRef>,
    pub occurred_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(event_type: EventType, database: &str, table: &str, record: Record) -> Self {
        Self {
            event_type,
            source_database: database.to_string(),
            source_table: table.to_string(),
            record,
            old_record: None,
            source_schema: None,
            occurred_at: None,
        }
    }

    pub fn insert(database: &str, table: &str, record: Record) -> Self {
        Self::new(EventType::Insert, database, table, record)
    }

    pub fn update(database: &str, table: &str, old: Record, record: Record) -> Self {
        let mut event = Self::new(EventType::Update, database, table, record);
        event.old_record = Some(old);
        event
    }

    pub fn delete(database: &str, table: &str, record: Record) -> Self {
        Self::new(EventType::Delete, database, table, record)
    }

    pub fn with_schema(mut self, schema: TableRef) -> Self {
        self.source_schema = Some(schema);
        self
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }

    /// Copy of the event with both images projected onto `schema`.
    pub fn project(&self, schema: &Table) -> Event {
        Event {
            record: self.record.project(schema),
            old_record: self.old_record.as_ref().map(|r| r.project(schema)),
            ..self.clone()
        }
    }

    /// Rejects events that cannot be applied safely: empty rows, and
    /// updates without a complete pre-image.
    pub fn validate(&self) -> Result<(), CdcError> {
        if self.record.is_empty() {
            return Err(CdcError::data(format!(
                "{} event on {} carries no fields",
                self.event_type, self.source_table
            )));
        }
        if self.event_type != EventType::Update {
            return Ok(());
        }
        let old = match &self.old_record {
            Some(old) if !old.is_empty() => old,
            _ => {
                return Err(CdcError::data(format!(
                    "update on {} is missing its previous row",
                    self.source_table
                )))
            }
        };
        if let Some(schema) = &self.source_schema {
            let keys = schema.primary_key_names();
            if !old.has_keys(&keys) || !self.record.has_keys(&keys) {
                return Err(CdcError::data(format!(
                    "update on {} is missing primary key fields",
                    self.source_table
                )));
            }
        }
        Ok(())
    }
}
