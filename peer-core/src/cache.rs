use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::time::Instant;

use crate::{SchemaManager, Table, TableRef};

pub const DEFAULT_SCHEMA_TTL: Duration = Duration::from_secs(60);

/// Wraps a [`SchemaManager`] and remembers successful lookups for a while.
/// Missing tables are never remembered.
pub struct CachedSchemaManager {
    inner: Arc<dyn SchemaManager>,
    ttl: Duration,
    tables: DashMap<(String, String), (Instant, TableRef)>,
}

impl CachedSchemaManager {
    pub fn new(inner: Arc<dyn SchemaManager>) -> Self {
        Self::with_ttl(inner, DEFAULT_SCHEMA_TTL)
    }

    pub fn with_ttl(inner: Arc<dyn SchemaManager>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            tables: DashMap::new(),
        }
    }

    pub fn invalidate(&self, database: &str, table: &str) {
        self.tables
            .remove(&(database.to_string(), table.to_string()));
    }

    /// Looks up a destination table for a writer. Tables without columns
    /// count as missing.
    pub async fn existing(&self, database: &str, table: &str) -> anyhow::Result<Option<TableRef>> {
        let sch = self.get(database, table).await?.filter(|t| t.exists());
        if sch.is_none() {
            tracing::debug!(
                "Skipped event, table {} does not exist in {}",
                table,
                database
            );
        }
        Ok(sch)
    }
}

#[async_trait::async_trait]
impl SchemaManager for CachedSchemaManager {
    async fn get(&self, database: &str, table: &str) -> anyhow::Result<Option<TableRef>> {
        let key = (database.to_string(), table.to_string());
        if let Some(entry) = self.tables.get(&key) {
            let (fetched_at, cached) = entry.value();
            if fetched_at.elapsed() < self.ttl {
                return Ok(Some(cached.clone()));
            }
        }

        let fetched = self.inner.get(database, table).await?;
        match &fetched {
            Some(schema) => {
                self.tables.insert(key, (Instant::now(), schema.clone()));
            }
            None => {
                self.tables.remove(&key);
            }
        }
        Ok(fetched)
    }

    async fn create_table(&self, database: &str, table: &Table) -> anyhow::Result<()> {
        self.inner.create_table(database, table).await
    }
}
