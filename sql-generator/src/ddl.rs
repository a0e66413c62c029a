use peer_core::{CdcError, Column};

use crate::{Dialect, SqlGenerator};

impl<'a> SqlGenerator<'a> {
    /// `CREATE TABLE IF NOT EXISTS` for the generator's table. Column
    /// definitions come from `field_def`, which knows the destination's
    /// type names.
    pub fn create_table<F>(&self, field_def: F) -> anyhow::Result<String>
    where
        F: Fn(&Column) -> String,
    {
        let keys: Vec<String> = self
            .schema
            .primary_key_names()
            .into_iter()
            .map(|k| self.quote(k))
            .collect();
        if keys.is_empty() {
            return Err(CdcError::configuration(format!(
                "table {} has no primary key, it can not be created",
                self.schema.name
            ))
            .into());
        }
        let mut columns: Vec<&Column> = self.schema.columns.iter().collect();
        if self.dialect == Dialect::StarRocks {
            // primary key columns must lead the column list
            columns.sort_by_key(|c| !c.is_primary_key);
        }
        let defs: Vec<String> = columns.into_iter().map(field_def).collect();
        let keys = keys.join(", ");

        let sql = match self.dialect {
            Dialect::StarRocks => format!(
                "CREATE TABLE IF NOT EXISTS {} ({}) PRIMARY KEY ({}) DISTRIBUTED BY HASH ({})",
                self.table(),
                defs.join(", "),
                keys,
                keys
            ),
            Dialect::MySql | Dialect::Postgres => format!(
                "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}))",
                self.table(),
                defs.join(", "),
                keys
            ),
        };
        Ok(sql)
    }
}
