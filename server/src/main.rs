use std::{sync::Arc, time::Duration};

use catalog::{Catalog, CatalogConfig};
use clap::Parser;
use flow::{Runtime, RuntimeConfig};
use peer_connections::PeerConnections;
use peer_core::PluginRegistry;
use peer_elasticsearch::ElasticsearchPlugin;
use peer_mysql::MySqlPlugin;
use peer_postgres::PostgresPlugin;
use pt::DbType;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Arguments for the replication server.
#[derive(Parser, Debug)]
struct Args {
    /// Catalog postgres server host.
    /// Defaults to `localhost`.
    #[clap(long, default_value = "localhost", env = "ANYCDC_CATALOG_HOST")]
    catalog_host: String,

    /// Catalog postgres server port.
    /// Defaults to `5432`.
    #[clap(long, default_value_t = 5432, env = "ANYCDC_CATALOG_PORT")]
    catalog_port: u16,

    /// Catalog postgres server user.
    #[clap(long, default_value = "postgres", env = "ANYCDC_CATALOG_USER")]
    catalog_user: String,

    /// Catalog postgres server password.
    #[clap(long, default_value = "postgres", env = "ANYCDC_CATALOG_PASSWORD")]
    catalog_password: String,

    /// Catalog postgres server database.
    #[clap(long, default_value = "anycdc", env = "ANYCDC_CATALOG_DATABASE")]
    catalog_database: String,

    /// Directory the `anycdc.log` file is written to.
    #[clap(short, long, default_value = "/var/log/anycdc", env = "ANYCDC_LOG_DIR")]
    log_dir: String,

    /// Seconds between two checkpoints of every running task.
    #[clap(long, default_value_t = 5, env = "ANYCDC_SAVE_INTERVAL_SECS")]
    save_interval_secs: u64,

    /// Milliseconds to wait between stopping a task and starting it again.
    #[clap(long, default_value_t = 1000, env = "ANYCDC_RESTART_GRACE_MS")]
    restart_grace_ms: u64,

    /// Snapshot page size for tasks without their own batch size.
    #[clap(long, default_value_t = 1000, env = "ANYCDC_DUMP_BATCH_SIZE")]
    dump_batch_size: usize,
}

fn get_catalog_config(args: &Args) -> CatalogConfig {
    CatalogConfig::new(
        args.catalog_host.clone(),
        args.catalog_port,
        args.catalog_user.clone(),
        args.catalog_password.clone(),
        args.catalog_database.clone(),
    )
}

fn get_runtime_config(args: &Args) -> RuntimeConfig {
    RuntimeConfig {
        save_interval: Duration::from_secs(args.save_interval_secs.max(1)),
        restart_grace: Duration::from_millis(args.restart_grace_ms),
        batch_size: args.dump_batch_size.max(1),
    }
}

struct TracerGuards {
    _rolling_guard: WorkerGuard,
}

fn setup_tracing(log_dir: &str) -> TracerGuards {
    let file_appender = tracing_appender::rolling::never(log_dir, "anycdc.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let fmt_file_layer = fmt::layer().with_target(false).with_writer(non_blocking);

    let fmt_stdout_layer = fmt::layer().with_target(false).with_writer(std::io::stdout);

    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt_stdout_layer)
        .with(fmt_file_layer)
        .with(filter_layer)
        .init();

    // dropping the guard closes the log file
    TracerGuards {
        _rolling_guard: guard,
    }
}

async fn run_migrations(config: &CatalogConfig) -> anyhow::Result<Catalog> {
    for attempt in 1..=3 {
        match Catalog::new(config).await {
            Ok(mut catalog) => {
                catalog.run_migrations().await?;
                return Ok(catalog);
            }
            Err(err) if attempt < 3 => {
                tracing::warn!(
                    "Failed to connect to catalog. Retrying in 30 seconds. {:?}",
                    err
                );
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Err(err) => return Err(err.context("Failed to connect to catalog")),
        }
    }
    Err(anyhow::anyhow!("Failed to connect to catalog"))
}

fn plugin_registry(connections: &Arc<PeerConnections>) -> PluginRegistry {
    let mut plugins = PluginRegistry::new();
    plugins.register(
        DbType::Postgres,
        Arc::new(PostgresPlugin::new(connections.clone())),
    );
    plugins.register(DbType::MySql, Arc::new(MySqlPlugin::new(connections.clone())));
    plugins.register(
        DbType::StarRocks,
        Arc::new(MySqlPlugin::starrocks(connections.clone())),
    );
    plugins.register(DbType::Elasticsearch, Arc::new(ElasticsearchPlugin::new()));
    plugins
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let _guard = setup_tracing(&args.log_dir);

    let catalog = run_migrations(&get_catalog_config(&args)).await?;
    let connections = Arc::new(PeerConnections::new());
    let runtime = Arc::new(Runtime::new(
        Arc::new(catalog),
        Arc::new(plugin_registry(&connections)),
        get_runtime_config(&args),
    ));

    runtime.prepare().await?;

    let shutdown = CancellationToken::new();
    let save_loop = tokio::spawn({
        let runtime = runtime.clone();
        let shutdown = shutdown.clone();
        async move { runtime.run_save_loop(shutdown).await }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    shutdown.cancel();
    if let Err(e) = save_loop.await {
        tracing::warn!("save loop ended abnormally: {}", e);
    }
    runtime.shutdown().await;
    connections.close().await;
    Ok(())
}
