use std::str::FromStr;

use anyhow::Context;
use chrono::{DateTime, Utc};
use peer_core::{CdcError, MetadataStore};
use pt::{
    CdcStatus, Connector, DbType, DumperState, SyncMode, Task, TaskStatus, TaskTable,
    TaskTableMetric,
};
use tokio_postgres::{Client, Row};

mod memory;

pub use memory::MemoryCatalog;

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Catalog backed by a postgres database holding connectors, tasks and
/// per-table progress.
pub struct Catalog {
    pg: Box<Client>,
}

async fn run_migrations(client: &mut Client) -> anyhow::Result<()> {
    let migration_report = embedded::migrations::runner()
        .run_async(client)
        .await
        .context("Failed to run migrations")?;
    for migration in migration_report.applied_migrations() {
        tracing::info!(
            "Migration Applied -  Name: {}, Version: {}",
            migration.name(),
            migration.version()
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl CatalogConfig {
    pub fn new(host: String, port: u16, user: String, password: String, database: String) -> Self {
        Self {
            host,
            port,
            user,
            password,
            database,
        }
    }

    // the catalog is reached like any other postgres connector
    pub fn to_connector(&self) -> Connector {
        Connector {
            id: "catalog".to_string(),
            name: "catalog".to_string(),
            db_type: DbType::Postgres,
            target_type: Default::default(),
            host: self.host.clone(),
            port: self.port,
            username: self.user.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
        }
    }
}

const TASK_COLUMNS: &str = "id, name, reader, writer, tables, dumper_enabled, cdc_enabled, \
    migrate_enabled, debug_enabled, status, cdc_status, last_cdc_position, last_cdc_at, \
    extras, batch_size";

const TASK_TABLE_COLUMNS: &str = "id, task_id, schema_name, table_name, last_dumper_key, \
    dumper_state, last_event_at, total_dumped, total_inserted, total_updated, total_deleted";

fn parse_text<T>(row: &Row, column: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .with_context(|| format!("invalid value for {}", column))
}

fn task_from_row(row: &Row) -> anyhow::Result<Task> {
    let batch_size: i32 = row.try_get("batch_size")?;
    Ok(Task {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        reader: row.try_get("reader")?,
        writer: row.try_get("writer")?,
        tables: row.try_get("tables")?,
        dumper_enabled: row.try_get("dumper_enabled")?,
        cdc_enabled: row.try_get("cdc_enabled")?,
        migrate_enabled: row.try_get("migrate_enabled")?,
        debug_enabled: row.try_get("debug_enabled")?,
        status: parse_text(row, "status")?,
        cdc_status: parse_text(row, "cdc_status")?,
        last_cdc_position: row.try_get("last_cdc_position")?,
        last_cdc_at: row.try_get("last_cdc_at")?,
        extras: row.try_get("extras")?,
        batch_size: batch_size.max(0) as u32,
    })
}

fn connector_from_row(row: &Row) -> anyhow::Result<Connector> {
    let port: i32 = row.try_get("port")?;
    Ok(Connector {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        db_type: parse_text(row, "type")?,
        target_type: parse_text(row, "target_type")?,
        host: row.try_get("host")?,
        port: u16::try_from(port).context("connector port out of range")?,
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        database: row.try_get("database")?,
    })
}

fn task_table_from_row(row: &Row) -> anyhow::Result<TaskTable> {
    Ok(TaskTable {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        schema: row.try_get("schema_name")?,
        table: row.try_get("table_name")?,
        last_dumper_key: row.try_get("last_dumper_key")?,
        dumper_state: parse_text(row, "dumper_state")?,
        last_event_at: row.try_get("last_event_at")?,
        total_dumped: row.try_get("total_dumped")?,
        total_inserted: row.try_get("total_inserted")?,
        total_updated: row.try_get("total_updated")?,
        total_deleted: row.try_get("total_deleted")?,
    })
}

fn expect_one(affected: u64, kind: &'static str, id: &str) -> anyhow::Result<()> {
    if affected == 0 {
        return Err(CdcError::not_found(kind, id).into());
    }
    Ok(())
}

impl Catalog {
    pub async fn new(catalog_config: &CatalogConfig) -> anyhow::Result<Self> {
        let client = postgres_connection::connect_postgres(&catalog_config.to_connector())
            .await
            .context("Failed to connect to catalog database")?;

        Ok(Self {
            pg: Box::new(client),
        })
    }

    pub async fn run_migrations(&mut self) -> anyhow::Result<()> {
        run_migrations(&mut self.pg).await
    }
}

#[async_trait::async_trait]
impl MetadataStore for Catalog {
    async fn get_task(&self, id: &str) -> anyhow::Result<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS);
        self.pg
            .query_opt(sql.as_str(), &[&id])
            .await?
            .map(|row| task_from_row(&row))
            .transpose()
    }

    async fn get_connector(&self, id: &str) -> anyhow::Result<Option<Connector>> {
        self.pg
            .query_opt(
                "SELECT id, name, type, target_type, host, port, username, password, database \
                 FROM connectors WHERE id = $1",
                &[&id],
            )
            .await?
            .map(|row| connector_from_row(&row))
            .transpose()
    }

    async fn active_tasks(&self) -> anyhow::Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE status = $1 ORDER BY id",
            TASK_COLUMNS
        );
        let rows = self
            .pg
            .query(sql.as_str(), &[&TaskStatus::Active.as_str()])
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn save_task(&self, task: &Task) -> anyhow::Result<()> {
        let batch_size = i32::try_from(task.batch_size).context("batch size out of range")?;
        self.pg
            .execute(
                "INSERT INTO tasks (id, name, reader, writer, tables, dumper_enabled, cdc_enabled, \
                 migrate_enabled, debug_enabled, status, cdc_status, last_cdc_position, last_cdc_at, \
                 extras, batch_size) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
                 ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, reader = EXCLUDED.reader, \
                 writer = EXCLUDED.writer, tables = EXCLUDED.tables, \
                 dumper_enabled = EXCLUDED.dumper_enabled, cdc_enabled = EXCLUDED.cdc_enabled, \
                 migrate_enabled = EXCLUDED.migrate_enabled, debug_enabled = EXCLUDED.debug_enabled, \
                 status = EXCLUDED.status, cdc_status = EXCLUDED.cdc_status, \
                 last_cdc_position = EXCLUDED.last_cdc_position, last_cdc_at = EXCLUDED.last_cdc_at, \
                 extras = EXCLUDED.extras, batch_size = EXCLUDED.batch_size, updated_at = now()",
                &[
                    &task.id,
                    &task.name,
                    &task.reader,
                    &task.writer,
                    &task.tables,
                    &task.dumper_enabled,
                    &task.cdc_enabled,
                    &task.migrate_enabled,
                    &task.debug_enabled,
                    &task.status.as_str(),
                    &task.cdc_status.as_str(),
                    &task.last_cdc_position,
                    &task.last_cdc_at,
                    &task.extras,
                    &batch_size,
                ],
            )
            .await
            .with_context(|| format!("failed to save task {}", task.id))?;
        Ok(())
    }

    async fn save_connector(&self, connector: &Connector) -> anyhow::Result<()> {
        let port = connector.port as i32;
        self.pg
            .execute(
                "INSERT INTO connectors (id, name, type, target_type, host, port, username, password, database) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                 ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, type = EXCLUDED.type, \
                 target_type = EXCLUDED.target_type, host = EXCLUDED.host, port = EXCLUDED.port, \
                 username = EXCLUDED.username, password = EXCLUDED.password, \
                 database = EXCLUDED.database, updated_at = now()",
                &[
                    &connector.id,
                    &connector.name,
                    &connector.db_type.as_str(),
                    &connector.target_type.as_str(),
                    &connector.host,
                    &port,
                    &connector.username,
                    &connector.password,
                    &connector.database,
                ],
            )
            .await
            .with_context(|| format!("failed to save connector {}", connector.id))?;
        Ok(())
    }

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> anyhow::Result<()> {
        let n = self
            .pg
            .execute(
                "UPDATE tasks SET status = $2, updated_at = now() WHERE id = $1",
                &[&id, &status.as_str()],
            )
            .await?;
        expect_one(n, "task", id)
    }

    async fn update_cdc_status(&self, id: &str, status: CdcStatus) -> anyhow::Result<()> {
        let n = self
            .pg
            .execute(
                "UPDATE tasks SET cdc_status = $2, updated_at = now() WHERE id = $1",
                &[&id, &status.as_str()],
            )
            .await?;
        expect_one(n, "task", id)
    }

    async fn update_cdc_position(
        &self,
        id: &str,
        position: &str,
        last_event_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        let n = self
            .pg
            .execute(
                "UPDATE tasks SET last_cdc_position = $2, \
                 last_cdc_at = COALESCE($3, last_cdc_at), updated_at = now() WHERE id = $1",
                &[&id, &position, &last_event_at],
            )
            .await?;
        expect_one(n, "task", id)
    }

    async fn update_extras(&self, id: &str, extras: &str) -> anyhow::Result<()> {
        let n = self
            .pg
            .execute(
                "UPDATE tasks SET extras = $2, updated_at = now() WHERE id = $1",
                &[&id, &extras],
            )
            .await?;
        expect_one(n, "task", id)
    }

    async fn get_task_table(
        &self,
        task_id: &str,
        table: &str,
    ) -> anyhow::Result<Option<TaskTable>> {
        let sql = format!(
            "SELECT {} FROM task_tables WHERE task_id = $1 AND table_name = $2",
            TASK_TABLE_COLUMNS
        );
        self.pg
            .query_opt(sql.as_str(), &[&task_id, &table])
            .await?
            .map(|row| task_table_from_row(&row))
            .transpose()
    }

    async fn create_task_table(
        &self,
        task_id: &str,
        table: &str,
        state: DumperState,
    ) -> anyhow::Result<TaskTable> {
        self.pg
            .execute(
                "INSERT INTO task_tables (task_id, table_name, dumper_state) VALUES ($1, $2, $3) \
                 ON CONFLICT (task_id, table_name) DO NOTHING",
                &[&task_id, &table, &state.as_str()],
            )
            .await
            .with_context(|| format!("failed to register table {} for task {}", table, task_id))?;
        self.get_task_table(task_id, table)
            .await?
            .ok_or_else(|| CdcError::not_found("task table", table).into())
    }

    async fn list_task_tables(&self, task_id: &str) -> anyhow::Result<Vec<TaskTable>> {
        let sql = format!(
            "SELECT {} FROM task_tables WHERE task_id = $1 ORDER BY id",
            TASK_TABLE_COLUMNS
        );
        let rows = self.pg.query(sql.as_str(), &[&task_id]).await?;
        rows.iter().map(task_table_from_row).collect()
    }

    async fn update_dumper_state(
        &self,
        task_id: &str,
        table: &str,
        state: DumperState,
    ) -> anyhow::Result<()> {
        let n = self
            .pg
            .execute(
                "UPDATE task_tables SET dumper_state = $3, updated_at = now() \
                 WHERE task_id = $1 AND table_name = $2",
                &[&task_id, &table, &state.as_str()],
            )
            .await?;
        expect_one(n, "task table", table)
    }

    async fn flush_metric(
        &self,
        task_id: &str,
        table: &str,
        metric: &TaskTableMetric,
    ) -> anyhow::Result<()> {
        let n = match metric.mode {
            SyncMode::Dumper => {
                let dumped = metric.inserted as i64;
                let key = metric.last_synced_key_json();
                self.pg
                    .execute(
                        "UPDATE task_tables SET total_dumped = total_dumped + $3, \
                         last_dumper_key = COALESCE($4, last_dumper_key), updated_at = now() \
                         WHERE task_id = $1 AND table_name = $2",
                        &[&task_id, &table, &dumped, &key],
                    )
                    .await?
            }
            SyncMode::Cdc => {
                let inserted = metric.inserted as i64;
                let updated = metric.updated as i64;
                let deleted = metric.deleted as i64;
                self.pg
                    .execute(
                        "UPDATE task_tables SET total_inserted = total_inserted + $3, \
                         total_updated = total_updated + $4, total_deleted = total_deleted + $5, \
                         last_event_at = COALESCE($6, last_event_at), updated_at = now() \
                         WHERE task_id = $1 AND table_name = $2",
                        &[
                            &task_id,
                            &table,
                            &inserted,
                            &updated,
                            &deleted,
                            &metric.last_event_at,
                        ],
                    )
                    .await?
            }
        };
        expect_one(n, "task table", table)
    }

    async fn resync_task_table(&self, task_id: &str, table: &str) -> anyhow::Result<()> {
        let n = self
            .pg
            .execute(
                "UPDATE task_tables SET dumper_state = $3, total_dumped = 0, \
                 last_dumper_key = NULL, updated_at = now() \
                 WHERE task_id = $1 AND table_name = $2",
                &[&task_id, &table, &DumperState::Initialed.as_str()],
            )
            .await?;
        expect_one(n, "task table", table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_config_becomes_a_postgres_connector() {
        let config = CatalogConfig::new(
            "localhost".to_string(),
            5432,
            "postgres".to_string(),
            String::new(),
            "anycdc".to_string(),
        );
        let connector = config.to_connector();
        assert_eq!(connector.db_type, DbType::Postgres);
        assert_eq!(connector.database, "anycdc");
        assert!(postgres_connection::get_pg_connection_string(&connector)
            .starts_with("postgres://postgres@localhost:5432/anycdc"));
    }

    #[test]
    fn migrations_are_embedded() {
        let runner = embedded::migrations::runner();
        let names: Vec<_> = runner
            .get_migrations()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        assert_eq!(names, vec!["initial"]);
    }
}
