use std::sync::Arc;

use serde::{Deserialize, Serialize};
use value::{SecondaryType, Type};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub index: usize,
    pub data_type: Type,
    pub secondary_type: SecondaryType,
    pub nullable: bool,
    pub default: Option<String>,
    pub is_primary_key: bool,
    pub length: u32,
    pub precision: u32,
    pub scale: u32,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: Type) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            ..Default::default()
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn secondary(mut self, secondary_type: SecondaryType) -> Self {
        self.secondary_type = secondary_type;
        self
    }

    pub fn length(mut self, length: u32) -> Self {
        self.length = length;
        self
    }

    pub fn numeric(mut self, precision: u32, scale: u32) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
}

pub type TableRef = Arc<Table>;

impl Table {
    /// Builds a table, renumbering column indexes by position.
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        let columns = columns
            .into_iter()
            .enumerate()
            .map(|(index, mut column)| {
                column.index = index;
                column
            })
            .collect();
        Self {
            name: name.into(),
            columns,
        }
    }

    /// A table with no columns is treated as absent.
    pub fn exists(&self) -> bool {
        !self.columns.is_empty()
    }

    pub fn primary_keys(&self) -> Vec<&Column> {
        self.columns.iter().filter(|c| c.is_primary_key).collect()
    }

    /// Primary key names in declaration order. This is also the ORDER BY and
    /// cursor comparison order used when paging through a table.
    pub fn primary_key_names(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_by_index(&self, index: usize) -> Option<&Column> {
        self.columns.iter().find(|c| c.index == index)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_by_name(name).is_some()
    }
}
