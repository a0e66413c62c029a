use std::{sync::Arc, time::Duration};

use anyhow::Context;
use pt::TaskTable;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use value::{TypeMap, Value};

use crate::{
    error::CdcError, DumperSubscriber, Field, Record, SchemaManager, Table, TableRef,
};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpOutcome {
    /// The table was read to the end.
    Completed,
    /// Cancelled before the end; progress so far is kept.
    Stopped,
}

/// Protocol specific part of a snapshot: one page of rows.
#[async_trait::async_trait]
pub trait BatchSource: Send + Sync {
    /// Returns up to `limit` rows ordered by primary key, starting at
    /// `from` inclusive, or at the first row when `from` is `None`.
    async fn fetch(
        &self,
        table: &Table,
        from: Option<&Record>,
        limit: usize,
    ) -> anyhow::Result<Vec<Record>>;
}

/// Resumable, primary-key ordered paging over one table at a time.
pub struct DumpDriver<S> {
    source: S,
    schema: Arc<dyn SchemaManager>,
    type_map: Arc<TypeMap>,
    subscriber: Arc<dyn DumperSubscriber>,
    database: String,
    batch_size: usize,
    cancel: CancellationToken,
}

impl<S: BatchSource> DumpDriver<S> {
    pub fn new(
        source: S,
        schema: Arc<dyn SchemaManager>,
        type_map: Arc<TypeMap>,
        subscriber: Arc<dyn DumperSubscriber>,
        database: &str,
        batch_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            schema,
            type_map,
            subscriber,
            database: database.to_string(),
            // a page must hold the repeated cursor row plus at least one new row
            batch_size: batch_size.max(2),
            cancel,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn dump_table(&self, task_table: &TaskTable) -> anyhow::Result<DumpOutcome> {
        let table = self
            .schema
            .get(&self.database, &task_table.table)
            .await?
            .filter(|t| t.exists())
            .ok_or_else(|| CdcError::not_found("source table", &task_table.table))?;
        let keys = table.primary_key_names();
        if keys.is_empty() {
            return Err(CdcError::configuration(format!(
                "table {} has no primary key, it can not be dumped",
                table.name
            ))
            .into());
        }

        let mut cursor = match task_table.last_dumper_key.as_deref() {
            Some(raw) if !raw.is_empty() => Some(
                self.decode_last_key(&table, &keys, raw)
                    .with_context(|| format!("invalid last dumper key for {}", table.name))?,
            ),
            _ => None,
        };
        if cursor.is_some() {
            tracing::info!(
                "resuming dump of {} from {}",
                table.name,
                task_table.last_dumper_key.as_deref().unwrap_or_default()
            );
        }

        let mut dumped = 0usize;
        let mut last_report = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("dump of {} stopped after {} rows", table.name, dumped);
                return Ok(DumpOutcome::Stopped);
            }

            let mut rows = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("dump of {} stopped after {} rows", table.name, dumped);
                    return Ok(DumpOutcome::Stopped);
                }
                rows = self.source.fetch(&table, cursor.as_ref(), self.batch_size) => {
                    rows.with_context(|| format!("failed to fetch rows from {}", table.name))?
                }
            };
            let fetched = rows.len();

            // the inclusive lower bound returns the previous cursor row again
            if let Some(prev) = &cursor {
                if rows.first().is_some_and(|first| first.same_keys(prev, &keys)) {
                    rows.remove(0);
                }
            }

            if let Some(last) = rows.last() {
                let next = key_record(last, &keys, &table)?;
                self.subscriber.dumper_event(&table, &rows).await?;
                dumped += rows.len();
                cursor = Some(next);
            }

            if fetched < self.batch_size {
                tracing::info!("dump of {} completed, {} rows", table.name, dumped);
                return Ok(DumpOutcome::Completed);
            }

            if last_report.elapsed() >= PROGRESS_INTERVAL {
                tracing::info!("dumping {}: {} rows so far", table.name, dumped);
                last_report = Instant::now();
            }
        }
    }

    fn decode_last_key(
        &self,
        table: &TableRef,
        keys: &[&str],
        raw: &str,
    ) -> anyhow::Result<Record> {
        let parsed: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(raw).context("last dumper key is not a JSON object")?;
        let mut record = Record::default();
        for key in keys {
            let column = table.column_by_name(key).ok_or_else(|| CdcError::UnknownColumn {
                table: table.name.clone(),
                column: key.to_string(),
            })?;
            let json = parsed
                .get(*key)
                .ok_or_else(|| {
                    CdcError::data(format!("last dumper key has no value for {}", key))
                })?;
            let raw_value = Value::from_typed_json(column.data_type, json)?;
            let typed = self.type_map.encode(column.data_type, raw_value)?;
            record.fields.push(Field::new(*key, typed));
        }
        Ok(record)
    }
}

fn key_record(row: &Record, keys: &[&str], table: &Table) -> anyhow::Result<Record> {
    let mut record = Record::default();
    for key in keys {
        let value = row.value(key).ok_or_else(|| {
            CdcError::data(format!("row from {} has no value for key {}", table.name, key))
        })?;
        record.fields.push(Field::new(*key, value.clone()));
    }
    Ok(record)
}
