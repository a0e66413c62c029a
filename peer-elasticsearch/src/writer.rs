use std::sync::Arc;

use anyhow::Context;
use peer_core::{CdcError, Event, EventType, Record, Table, Writer, WriterOptions};
use value::TypeMap;

use crate::{bulk_body, document, document_id, index_name, EsClient};

/// Indexes rows as documents keyed by their primary key.
pub struct ElasticsearchWriter {
    opts: WriterOptions,
    type_map: Arc<TypeMap>,
    client: Option<EsClient>,
}

impl ElasticsearchWriter {
    pub fn new(opts: WriterOptions, type_map: Arc<TypeMap>) -> Self {
        Self {
            opts,
            type_map,
            client: None,
        }
    }

    fn client(&self) -> anyhow::Result<&EsClient> {
        self.client.as_ref().context("writer used before prepare")
    }
}

#[async_trait::async_trait]
impl Writer for ElasticsearchWriter {
    async fn prepare(&mut self) -> anyhow::Result<()> {
        let client = EsClient::new(&self.opts.connector)?;
        client
            .ping()
            .await
            .with_context(|| format!("can not reach {}", self.opts.connector.name))?;
        self.client = Some(client);
        Ok(())
    }

    #[tracing::instrument(skip(self, event), fields(table = %event.source_table))]
    async fn execute(&self, event: &Event) -> anyhow::Result<()> {
        let client = self.client()?;
        let schema = event.source_schema.as_ref().ok_or_else(|| {
            CdcError::data(format!(
                "{} on {} carries no schema to derive a document id",
                event.event_type, event.source_table
            ))
        })?;
        let keys = schema.primary_key_names();
        let index = index_name(&event.source_table);
        let id = document_id(&event.record, &keys, &self.type_map)?;

        match event.event_type {
            EventType::Insert => {
                client
                    .index(&index, &id, &document(&event.record, &self.type_map)?)
                    .await
            }
            EventType::Update => {
                if let Some(old) = &event.old_record {
                    let old_id = document_id(old, &keys, &self.type_map)?;
                    if old_id != id {
                        client.delete(&index, &old_id).await?;
                    }
                }
                client
                    .index(&index, &id, &document(&event.record, &self.type_map)?)
                    .await
            }
            EventType::Delete => client.delete(&index, &id).await,
        }
    }

    #[tracing::instrument(skip(self, table, records), fields(table = %table.name, rows = records.len()))]
    async fn execute_batch(&self, table: &Table, records: &[Record]) -> anyhow::Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let body = bulk_body(table, records, &self.type_map).context("cannot build bulk body")?;
        self.client()?.bulk(body).await
    }
}
