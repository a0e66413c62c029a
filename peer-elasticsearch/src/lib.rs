use std::sync::Arc;

use anyhow::Context;
use peer_core::{CdcError, Connector, ConnectorOptions, Plugin, Writer, WriterOptions};
use reqwest::{header, Method, RequestBuilder, StatusCode};
use value::{Type, TypeMap};

mod document;
mod writer;

pub use document::{
    bulk_body, bulk_failure, decode_json_document, document, document_id, index_name,
};
pub use writer::ElasticsearchWriter;

/// Thin REST client over one cluster endpoint.
#[derive(Clone)]
pub struct EsClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl EsClient {
    pub fn new(connector: &pt::Connector) -> anyhow::Result<Self> {
        let http = reqwest::ClientBuilder::new()
            .gzip(true)
            .build()
            .context("can not build http client")?;
        Ok(Self {
            http,
            base_url: format!("http://{}:{}", connector.host, connector.port),
            username: connector.username.clone(),
            password: connector.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}/{}", self.base_url, path));
        if self.username.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.username, Some(&self.password))
        }
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> anyhow::Result<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| CdcError::transient(format!("{} on {}: {}", what, self.base_url, e)))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            let message = format!("{} returned {}: {}", what, status, body);
            return Err(CdcError::transient(message).into());
        }
        Err(anyhow::anyhow!("{} returned {}: {}", what, status, body))
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        self.send(self.request(Method::GET, ""), "ping").await?;
        Ok(())
    }

    /// Creates or replaces the document `id` of `index`.
    pub async fn index(
        &self,
        index: &str,
        id: &str,
        doc: &serde_json::Map<String, serde_json::Value>,
    ) -> anyhow::Result<()> {
        let path = format!("{}/_doc/{}", index, urlencoding::encode(id));
        self.send(self.request(Method::PUT, &path).json(doc), "index")
            .await?;
        Ok(())
    }

    /// Deletes the document `id`; a document that is already gone is fine.
    pub async fn delete(&self, index: &str, id: &str) -> anyhow::Result<()> {
        let path = format!("{}/_doc/{}", index, urlencoding::encode(id));
        let response = self
            .request(Method::DELETE, &path)
            .send()
            .await
            .map_err(|e| CdcError::transient(format!("delete on {}: {}", self.base_url, e)))?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!("document {} of {} already deleted", id, index);
            return Ok(());
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("delete returned {}: {}", status, body));
        }
        Ok(())
    }

    pub async fn bulk(&self, body: String) -> anyhow::Result<()> {
        let response = self
            .send(
                self.request(Method::POST, "_bulk?refresh=true")
                    .header(header::CONTENT_TYPE, "application/x-ndjson")
                    .body(body),
                "bulk",
            )
            .await?;
        let summary: serde_json::Value = response
            .json()
            .await
            .context("can not read bulk response")?;
        if let Some(reason) = bulk_failure(&summary) {
            anyhow::bail!("bulk request failed: {}", reason);
        }
        Ok(())
    }
}

pub struct ElasticsearchConnector {
    connector: pt::Connector,
}

#[async_trait::async_trait]
impl Connector for ElasticsearchConnector {
    #[tracing::instrument(skip(self), fields(connector = %self.connector.name))]
    async fn test(&self) -> anyhow::Result<()> {
        EsClient::new(&self.connector)?
            .ping()
            .await
            .with_context(|| format!("can not reach {}", self.connector.name))
    }
}

/// Search index destination. It only writes: no schema, reader or dumper.
pub struct ElasticsearchPlugin {
    type_map: Arc<TypeMap>,
}

impl ElasticsearchPlugin {
    pub fn new() -> Self {
        let mut type_map = TypeMap::with_defaults();
        type_map.register_decoder(Type::Json, decode_json_document);
        Self {
            type_map: Arc::new(type_map),
        }
    }

    pub fn type_map(&self) -> &TypeMap {
        &self.type_map
    }
}

impl Default for ElasticsearchPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for ElasticsearchPlugin {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    fn connector(&self, opts: ConnectorOptions) -> Option<Box<dyn Connector>> {
        Some(Box::new(ElasticsearchConnector {
            connector: opts.connector,
        }))
    }

    fn writer(&self, opts: WriterOptions) -> Option<Box<dyn Writer>> {
        Some(Box::new(ElasticsearchWriter::new(opts, self.type_map.clone())))
    }
}

#[cfg(test)]
mod tests {
    use pt::DbType;

    use super::*;

    fn connector() -> pt::Connector {
        pt::Connector {
            id: "es".to_string(),
            name: "search".to_string(),
            db_type: DbType::Elasticsearch,
            target_type: pt::TargetType::Writer,
            host: "search.internal".to_string(),
            port: 9200,
            username: String::new(),
            password: String::new(),
            database: String::new(),
        }
    }

    #[test]
    fn endpoint_comes_from_the_connector() {
        let client = EsClient::new(&connector()).unwrap();
        assert_eq!(client.base_url(), "http://search.internal:9200");
    }

    #[test]
    fn json_columns_stay_documents() {
        let plugin = ElasticsearchPlugin::new();
        let typed = plugin
            .type_map()
            .encode(Type::Json, value::Value::text(r#"{"a":1}"#))
            .unwrap();
        assert_eq!(
            plugin.type_map().decode(&typed).unwrap(),
            value::Value::Json(serde_json::json!({"a": 1}))
        );
    }
}
