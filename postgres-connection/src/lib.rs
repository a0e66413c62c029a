use std::fmt::Write;

use pt::Connector;

pub const APPLICATION_NAME: &str = "anycdc";

pub fn get_pg_connection_string(config: &Connector) -> String {
    let mut connection_string = String::from("postgres://");

    connection_string.push_str(&urlencoding::encode(&config.username));
    if !config.password.is_empty() {
        connection_string.push(':');
        connection_string.push_str(&urlencoding::encode(&config.password));
    }

    write!(
        connection_string,
        "@{}:{}/{}?connect_timeout=15&application_name={}",
        config.host,
        config.port,
        urlencoding::encode(&config.database),
        APPLICATION_NAME
    )
    .ok();

    connection_string
}

pub fn get_pg_config(config: &Connector) -> anyhow::Result<tokio_postgres::Config> {
    get_pg_connection_string(config)
        .parse::<tokio_postgres::Config>()
        .map_err(|e| anyhow::anyhow!("invalid postgres settings for {}: {}", config.name, e))
}

pub async fn connect_postgres(config: &Connector) -> anyhow::Result<tokio_postgres::Client> {
    let connection_string = get_pg_connection_string(config);
    let (client, connection) = tokio_postgres::connect(&connection_string, tokio_postgres::NoTls)
        .await
        .map_err(|e| anyhow::anyhow!("error encountered while connecting to postgres {:?}", e))?;

    let name = config.name.clone();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::info!("connection error on {}: {}", name, e)
        }
    });

    Ok(client)
}
