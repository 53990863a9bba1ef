use async_trait::async_trait;
use metrics::{counter, histogram};
use tracing::info;

use crate::api::StoreError;
use crate::event::Event;
use crate::key::IdempotencyKey;
use crate::stores::{check_row, AggregateQuery, AggregateRow, EventStore, WriteReport};

/// Dry-run store: logs rows and acknowledges them without keeping anything.
pub struct PrintStore {
    pub max_row_bytes: usize,
}

#[async_trait]
impl EventStore for PrintStore {
    async fn write(&self, rows: &[Event]) -> Result<WriteReport, StoreError> {
        let span = tracing::span!(tracing::Level::INFO, "batch of events");
        let _enter = span.enter();

        histogram!("ingest_print_batch_size").record(rows.len() as f64);
        let mut report = WriteReport::default();
        for row in rows {
            let key = row.idempotency_key().clone();
            match check_row(row, self.max_row_bytes) {
                Ok(()) => {
                    info!("event: {row:?}");
                    report.acknowledged.push(key);
                }
                Err(reason) => report.rejected.push((key, reason)),
            }
        }
        counter!("ingest_print_rows_total").increment(report.acknowledged.len() as u64);

        Ok(report)
    }

    async fn count_by_key(&self, _key: &IdempotencyKey) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("print store keeps no rows".to_string()))
    }

    async fn recent(&self, _limit: usize) -> Result<Vec<Event>, StoreError> {
        Err(StoreError::Unavailable("print store keeps no rows".to_string()))
    }

    async fn aggregate(&self, _query: &AggregateQuery) -> Result<Vec<AggregateRow>, StoreError> {
        Err(StoreError::Unavailable("print store keeps no rows".to_string()))
    }
}
