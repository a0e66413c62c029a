use std::sync::Arc;

use anyhow::Context;
use peer_core::{DumperSubscriber, Event, ReaderSubscriber, Record, TableRef, Writer};

use crate::metrics::TaskMetrics;

/// Subscriber side of a task: hands snapshot pages and change events to
/// the writer and counts what was applied.
pub struct TaskSink {
    writer: Arc<dyn Writer>,
    metrics: Arc<TaskMetrics>,
    debug: bool,
}

impl TaskSink {
    pub fn new(writer: Arc<dyn Writer>, metrics: Arc<TaskMetrics>, debug: bool) -> Self {
        Self {
            writer,
            metrics,
            debug,
        }
    }
}

#[async_trait::async_trait]
impl DumperSubscriber for TaskSink {
    async fn dumper_event(&self, table: &TableRef, records: &[Record]) -> anyhow::Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.writer
            .execute_batch(table, records)
            .await
            .with_context(|| format!("can not write snapshot page of {}", table.name))?;
        self.metrics
            .record_dumped(&table.name, records, &table.primary_key_names())
            .await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReaderSubscriber for TaskSink {
    async fn reader_event(&self, event: Event) -> anyhow::Result<()> {
        event.validate()?;
        if self.debug {
            tracing::debug!(
                "{} on {}.{}: {:?}",
                event.event_type,
                event.source_database,
                event.source_table,
                event.record
            );
        }
        self.writer
            .execute(&event)
            .await
            .with_context(|| {
                format!("can not apply {} on {}", event.event_type, event.source_table)
            })?;
        self.metrics.record_event(&event).await;
        Ok(())
    }
}
