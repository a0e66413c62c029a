use anyhow::Context;
use peer_core::{CdcError, Event, EventType, Record, Table};
use pt::DbType;
use value::{TypeMap, Value};

mod ddl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Postgres,
    StarRocks,
}

impl Dialect {
    pub fn from_db_type(db_type: DbType) -> Option<Self> {
        match db_type {
            DbType::MySql => Some(Dialect::MySql),
            DbType::Postgres => Some(Dialect::Postgres),
            DbType::StarRocks => Some(Dialect::StarRocks),
            DbType::Elasticsearch => None,
        }
    }

    pub fn quote(&self, ident: &str) -> String {
        match self {
            Dialect::MySql | Dialect::StarRocks => format!("`{}`", ident.replace('`', "``")),
            Dialect::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Placeholder for the `n`th (1-based) parameter.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::MySql | Dialect::StarRocks => "?".to_string(),
            Dialect::Postgres => format!("${}", n),
        }
    }
}

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

struct Binder {
    dialect: Dialect,
    params: Vec<Value>,
}

impl Binder {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, value: Value) -> String {
        self.params.push(value);
        self.dialect.placeholder(self.params.len())
    }

    fn finish(self, sql: String) -> Statement {
        Statement {
            sql,
            params: self.params,
        }
    }
}

/// Builds statements against one destination table.
pub struct SqlGenerator<'a> {
    dialect: Dialect,
    schema: &'a Table,
    type_map: &'a TypeMap,
}

impl<'a> SqlGenerator<'a> {
    pub fn new(dialect: Dialect, schema: &'a Table, type_map: &'a TypeMap) -> Self {
        Self {
            dialect,
            schema,
            type_map,
        }
    }

    fn quote(&self, ident: &str) -> String {
        self.dialect.quote(ident)
    }

    fn table(&self) -> String {
        self.quote(&self.schema.name)
    }

    fn primary_keys(&self) -> anyhow::Result<Vec<&'a str>> {
        let keys = self.schema.primary_key_names();
        if keys.is_empty() {
            return Err(CdcError::configuration(format!(
                "table {} has no primary key",
                self.schema.name
            ))
            .into());
        }
        Ok(keys)
    }

    fn is_key(&self, name: &str) -> bool {
        self.schema
            .column_by_name(name)
            .is_some_and(|c| c.is_primary_key)
    }

    fn check_columns(&self, record: &Record) -> anyhow::Result<()> {
        for field in &record.fields {
            if !self.schema.has_column(&field.name) {
                return Err(CdcError::UnknownColumn {
                    table: self.schema.name.clone(),
                    column: field.name.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn param(&self, record: &Record, name: &str) -> anyhow::Result<Value> {
        let data = record.value(name).ok_or_else(|| {
            CdcError::data(format!(
                "record for {} has no value for {}",
                self.schema.name, name
            ))
        })?;
        self.type_map
            .decode(data)
            .with_context(|| format!("field {} decode fail", name))
    }

    fn decode_fields<'r>(&self, record: &'r Record) -> anyhow::Result<Vec<(&'r str, Value)>> {
        record
            .fields
            .iter()
            .map(|f| {
                let v = self
                    .type_map
                    .decode(&f.value)
                    .with_context(|| format!("field {} decode fail", f.name))?;
                Ok((f.name.as_str(), v))
            })
            .collect()
    }

    pub fn dml(&self, event: &Event) -> anyhow::Result<Statement> {
        match event.event_type {
            EventType::Insert => self.insert(&event.record),
            EventType::Update => self.update(event.old_record.as_ref(), &event.record),
            EventType::Delete => self.delete(&event.record),
        }
    }

    fn upsert_clause(&self, columns: &[&str], keys: &[&str], batch: bool) -> String {
        let updates: Vec<&str> = columns
            .iter()
            .copied()
            .filter(|c| !keys.contains(c))
            .collect();
        match self.dialect {
            Dialect::MySql => {
                let sets: Vec<String> = if updates.is_empty() {
                    // keep the statement valid when only keys are written
                    vec![format!("{0} = {0}", self.quote(keys[0]))]
                } else if batch {
                    updates
                        .iter()
                        .map(|c| format!("{0} = VALUES({0})", self.quote(c)))
                        .collect()
                } else {
                    // filled in by the caller with repeated parameters
                    Vec::new()
                };
                if sets.is_empty() {
                    String::new()
                } else {
                    format!(" ON DUPLICATE KEY UPDATE {}", sets.join(", "))
                }
            }
            Dialect::Postgres => {
                let conflict = keys
                    .iter()
                    .map(|k| self.quote(k))
                    .collect::<Vec<_>>()
                    .join(", ");
                if updates.is_empty() {
                    format!(" ON CONFLICT ({}) DO NOTHING", conflict)
                } else {
                    let sets = updates
                        .iter()
                        .map(|c| format!("{0} = EXCLUDED.{0}", self.quote(c)))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!(" ON CONFLICT ({}) DO UPDATE SET {}", conflict, sets)
                }
            }
            // primary key tables replace rows on insert
            Dialect::StarRocks => String::new(),
        }
    }

    /// Insert that overwrites the existing row with the same key.
    pub fn insert(&self, record: &Record) -> anyhow::Result<Statement> {
        let keys = self.primary_keys()?;
        self.check_columns(record)?;
        if !record.has_keys(&keys) {
            return Err(CdcError::data(format!(
                "insert into {} is missing primary key fields",
                self.schema.name
            ))
            .into());
        }

        let fields = self.decode_fields(record)?;
        let columns: Vec<&str> = fields.iter().map(|(name, _)| *name).collect();
        let mut binder = Binder::new(self.dialect);
        let placeholders: Vec<String> = fields
            .iter()
            .map(|(_, v)| binder.bind(v.clone()))
            .collect();

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table(),
            columns
                .iter()
                .map(|c| self.quote(c))
                .collect::<Vec<_>>()
                .join(", "),
            placeholders.join(", ")
        );

        let has_updates = columns.iter().any(|c| !keys.contains(c));
        if self.dialect == Dialect::MySql && has_updates {
            let sets: Vec<String> = fields
                .iter()
                .filter(|(name, _)| !keys.contains(name))
                .map(|(name, v)| format!("{} = {}", self.quote(name), binder.bind(v.clone())))
                .collect();
            sql.push_str(" ON DUPLICATE KEY UPDATE ");
            sql.push_str(&sets.join(", "));
        } else {
            sql.push_str(&self.upsert_clause(&columns, &keys, false));
        }
        Ok(binder.finish(sql))
    }

    /// Multi-row form of [`SqlGenerator::insert`] for snapshot pages. The
    /// column list comes from the first record and every other record must
    /// carry exactly those fields.
    pub fn batch_upsert(&self, records: &[Record]) -> anyhow::Result<Statement> {
        let keys = self.primary_keys()?;
        let first = records
            .first()
            .ok_or_else(|| CdcError::data("batch upsert needs at least one record"))?;
        self.check_columns(first)?;
        let columns: Vec<&str> = first.fields.iter().map(|f| f.name.as_str()).collect();
        if !keys.iter().all(|k| columns.contains(k)) {
            return Err(CdcError::data(format!(
                "batch for {} is missing primary key fields",
                self.schema.name
            ))
            .into());
        }

        let mut binder = Binder::new(self.dialect);
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            self.check_columns(record)?;
            if record.fields.len() != columns.len() {
                return Err(CdcError::data(format!(
                    "batch for {} mixes records with different columns",
                    self.schema.name
                ))
                .into());
            }
            let mut placeholders = Vec::with_capacity(columns.len());
            for column in &columns {
                placeholders.push(binder.bind(self.param(record, column)?));
            }
            rows.push(format!("({})", placeholders.join(", ")));
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}{}",
            self.table(),
            columns
                .iter()
                .map(|c| self.quote(c))
                .collect::<Vec<_>>()
                .join(", "),
            rows.join(", "),
            self.upsert_clause(&columns, &keys, true)
        );
        Ok(binder.finish(sql))
    }

    /// Updates non-key columns, locating the row by the previous key when
    /// one is known. A changed key is written as well. A previous row that
    /// lacks any key field is rejected.
    pub fn update(&self, old: Option<&Record>, record: &Record) -> anyhow::Result<Statement> {
        let keys = self.primary_keys()?;
        self.check_columns(record)?;
        let locator = match old {
            Some(old) if old.has_keys(&keys) => old,
            Some(_) => {
                return Err(CdcError::data(format!(
                    "update on {} has a previous row without its primary key",
                    self.schema.name
                ))
                .into())
            }
            None => record,
        };
        let key_changed = !std::ptr::eq(locator, record) && !locator.same_keys(record, &keys);

        let mut binder = Binder::new(self.dialect);
        let mut sets = Vec::new();
        for (name, value) in self.decode_fields(record)? {
            if self.is_key(name) && !key_changed {
                continue;
            }
            sets.push(format!("{} = {}", self.quote(name), binder.bind(value)));
        }
        if sets.is_empty() {
            return self.insert(record);
        }

        let mut wheres = Vec::with_capacity(keys.len());
        for key in &keys {
            let value = self.param(locator, key)?;
            wheres.push(format!("{} = {}", self.quote(key), binder.bind(value)));
        }

        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.table(),
            sets.join(", "),
            wheres.join(" AND ")
        );
        Ok(binder.finish(sql))
    }

    pub fn delete(&self, record: &Record) -> anyhow::Result<Statement> {
        let keys = self.primary_keys()?;
        let mut binder = Binder::new(self.dialect);
        let mut wheres = Vec::with_capacity(keys.len());
        for key in &keys {
            let value = self.param(record, key)?;
            wheres.push(format!("{} = {}", self.quote(key), binder.bind(value)));
        }
        let sql = format!("DELETE FROM {} WHERE {}", self.table(), wheres.join(" AND "));
        Ok(binder.finish(sql))
    }

    /// One snapshot page ordered by primary key. With `last`, the page
    /// starts at that key inclusively.
    pub fn dumper(&self, batch_size: usize, last: Option<&Record>) -> anyhow::Result<Statement> {
        let keys = self.primary_keys()?;
        let mut binder = Binder::new(self.dialect);

        let filter = match last {
            None => "1 = 1".to_string(),
            Some(last) => {
                let mut placeholders = Vec::with_capacity(keys.len());
                for key in &keys {
                    placeholders.push(binder.bind(self.param(last, key)?));
                }
                let columns: Vec<String> = keys.iter().map(|k| self.quote(k)).collect();
                if keys.len() == 1 {
                    format!("{} >= {}", columns[0], placeholders[0])
                } else {
                    format!("({}) >= ({})", columns.join(", "), placeholders.join(", "))
                }
            }
        };

        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {} LIMIT {}",
            self.schema
                .columns
                .iter()
                .map(|c| self.quote(&c.name))
                .collect::<Vec<_>>()
                .join(", "),
            self.table(),
            filter,
            keys.iter()
                .map(|k| format!("{} ASC", self.quote(k)))
                .collect::<Vec<_>>()
                .join(", "),
            batch_size
        );
        Ok(binder.finish(sql))
    }
}
