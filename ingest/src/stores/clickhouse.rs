/*
Expected table shape, provisioned outside of this service:

CREATE TABLE IF NOT EXISTS events_streaming (
    event_id String,
    event_date Date,
    logical_timestamp Int64,
    event_name LowCardinality(String),
    actor_id String,
    user_id Nullable(String),
    attributes String,
    traffic_source_source LowCardinality(String),
    traffic_source_medium LowCardinality(String),
    traffic_source_name Nullable(String),
    device_category LowCardinality(String),
    device_operating_system LowCardinality(String),
    device_browser LowCardinality(String),
    geo_country LowCardinality(String),
    geo_region String,
    geo_city String,
    commerce_transaction_id Nullable(String),
    commerce_revenue Nullable(Float64),
    commerce_quantity Nullable(Int64),
    stream_id Nullable(String),
    platform Nullable(String),
    ingestion_timestamp DateTime64(6, 'UTC')
)
ENGINE = ReplacingMergeTree
PARTITION BY event_date
ORDER BY (event_name, actor_id, event_id)
SETTINGS non_replicated_deduplication_window = 1000;
 */

use std::future::Future;

use anyhow::Context;
use async_trait::async_trait;
use clickhouse::sql::Identifier;
use clickhouse::{Client, Row};
use metrics::counter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Date, OffsetDateTime};
use tracing::{info, instrument, warn};

use crate::api::StoreError;
use crate::config::ClickHouseConfig;
use crate::event::{Attribute, Commerce, Device, Event, Geo, TrafficSource};
use crate::key::IdempotencyKey;
use crate::stores::{check_row, AggregateQuery, AggregateRow, EventStore, GroupBy, WriteReport};

#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub(crate) struct EventRow {
    event_id: String,
    #[serde(with = "clickhouse::serde::time::date")]
    event_date: Date,
    logical_timestamp: i64,
    event_name: String,
    actor_id: String,
    user_id: Option<String>,
    attributes: String,
    traffic_source_source: String,
    traffic_source_medium: String,
    traffic_source_name: Option<String>,
    device_category: String,
    device_operating_system: String,
    device_browser: String,
    geo_country: String,
    geo_region: String,
    geo_city: String,
    commerce_transaction_id: Option<String>,
    commerce_revenue: Option<f64>,
    commerce_quantity: Option<i64>,
    stream_id: Option<String>,
    platform: Option<String>,
    #[serde(with = "clickhouse::serde::time::datetime64::micros")]
    ingestion_timestamp: OffsetDateTime,
}

impl TryFrom<&Event> for EventRow {
    type Error = String;

    fn try_from(event: &Event) -> Result<Self, Self::Error> {
        let attributes = serde_json::to_string(event.attributes())
            .map_err(|e| format!("failed to serialize attributes: {e}"))?;
        let commerce = event.commerce();

        Ok(EventRow {
            event_id: event.idempotency_key().to_string(),
            event_date: event.event_date(),
            logical_timestamp: event.logical_timestamp(),
            event_name: event.event_name().to_string(),
            actor_id: event.actor_id().to_string(),
            user_id: event.user_id().map(str::to_string),
            attributes,
            traffic_source_source: event.traffic_source().source.clone(),
            traffic_source_medium: event.traffic_source().medium.clone(),
            traffic_source_name: event.traffic_source().name.clone(),
            device_category: event.device().category.clone(),
            device_operating_system: event.device().operating_system.clone(),
            device_browser: event.device().browser.clone(),
            geo_country: event.geo().country.clone(),
            geo_region: event.geo().region.clone(),
            geo_city: event.geo().city.clone(),
            commerce_transaction_id: commerce.map(|c| c.transaction_id.clone()),
            commerce_revenue: commerce.map(|c| c.revenue),
            commerce_quantity: commerce.map(|c| c.quantity),
            stream_id: event.stream_id().map(str::to_string),
            platform: event.platform().map(str::to_string),
            ingestion_timestamp: event.ingestion_timestamp(),
        })
    }
}

impl TryFrom<EventRow> for Event {
    type Error = String;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let idempotency_key: IdempotencyKey = row.event_id.parse()?;
        let attributes: Vec<Attribute> = serde_json::from_str(&row.attributes)
            .map_err(|e| format!("failed to parse attributes of {}: {e}", row.event_id))?;
        let commerce = match (
            row.commerce_transaction_id,
            row.commerce_revenue,
            row.commerce_quantity,
        ) {
            (Some(transaction_id), Some(revenue), Some(quantity)) => Some(Commerce {
                transaction_id,
                revenue,
                quantity,
            }),
            _ => None,
        };

        Ok(Event {
            idempotency_key,
            event_date: row.event_date,
            logical_timestamp: row.logical_timestamp,
            event_name: row.event_name,
            actor_id: row.actor_id,
            user_id: row.user_id,
            attributes,
            traffic_source: TrafficSource {
                source: row.traffic_source_source,
                medium: row.traffic_source_medium,
                name: row.traffic_source_name,
            },
            device: Device {
                category: row.device_category,
                operating_system: row.device_operating_system,
                browser: row.device_browser,
            },
            geo: Geo {
                country: row.geo_country,
                region: row.geo_region,
                city: row.geo_city,
            },
            commerce,
            stream_id: row.stream_id,
            platform: row.platform,
            ingestion_timestamp: row.ingestion_timestamp,
        })
    }
}

#[derive(Debug, Row, Deserialize)]
struct AggregateRecord {
    bucket: String,
    events: u64,
    actors: u64,
    revenue: f64,
}

// Server error names that retrying the same request cannot fix
const UNAVAILABLE_CODES: [&str; 6] = [
    "UNKNOWN_TABLE",
    "UNKNOWN_DATABASE",
    "NO_SUCH_COLUMN_IN_TABLE",
    "AUTHENTICATION_FAILED",
    "ACCESS_DENIED",
    "READONLY",
];

// Server error names caused by the content of the inserted rows
const REJECTED_CODES: [&str; 8] = [
    "TYPE_MISMATCH",
    "CANNOT_PARSE_",
    "CANNOT_READ_",
    "CANNOT_CONVERT_TYPE",
    "CANNOT_INSERT_NULL_IN_ORDINARY_COLUMN",
    "TOO_LARGE_STRING_SIZE",
    "VALUE_IS_OUT_OF_RANGE_OF_DATA_TYPE",
    "INCORRECT_DATA",
];

pub(crate) fn classify_error(err: clickhouse::error::Error) -> StoreError {
    use clickhouse::error::Error;

    match err {
        Error::Network(e) => StoreError::Transient(format!("network error: {e}")),
        Error::TimedOut => StoreError::Transient("request timed out".to_string()),
        Error::BadResponse(msg) if UNAVAILABLE_CODES.iter().any(|code| msg.contains(code)) => {
            StoreError::Unavailable(msg)
        }
        Error::BadResponse(msg) if REJECTED_CODES.iter().any(|code| msg.contains(code)) => {
            StoreError::Rejected(msg)
        }
        other => StoreError::Transient(other.to_string()),
    }
}

/// Inserts `rows` as one block. When the server rejects the block for its
/// content, inserts the rows one at a time so that only the offending rows
/// end up rejected.
///
/// Any other failure before the first row is settled is returned as is.
/// Past that point, the remaining rows are left out of the report and will
/// be sent again by the caller.
pub(crate) async fn insert_isolating_rejects<F, Fut>(
    rows: Vec<(IdempotencyKey, EventRow)>,
    mut insert: F,
) -> Result<WriteReport, StoreError>
where
    F: FnMut(Vec<(IdempotencyKey, EventRow)>) -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let mut report = WriteReport::default();
    let block_size = rows.len();

    match insert(rows.clone()).await {
        Ok(()) => {
            report.acknowledged = rows.into_iter().map(|(key, _)| key).collect();
            return Ok(report);
        }
        Err(StoreError::Rejected(reason)) if block_size > 1 => {
            counter!("ingest_clickhouse_rejected_blocks_total").increment(1);
            warn!(
                "block of {} rows rejected, inserting rows one by one: {}",
                block_size, reason
            );
        }
        Err(StoreError::Rejected(reason)) => {
            report.rejected = rows.into_iter().map(|(key, _)| (key, reason.clone())).collect();
            return Ok(report);
        }
        Err(e) => return Err(e),
    }

    for (key, row) in rows {
        match insert(vec![(key.clone(), row)]).await {
            Ok(()) => report.acknowledged.push(key),
            Err(StoreError::Rejected(reason)) => report.rejected.push((key, reason)),
            Err(e) if report.acknowledged.is_empty() && report.rejected.is_empty() => {
                return Err(e)
            }
            Err(e) => {
                warn!("stopped inserting rows one by one: {}", e);
                break;
            }
        }
    }

    Ok(report)
}

/// Token identifying one insert block, so that ClickHouse drops an identical
/// block sent again by a retry.
pub(crate) fn deduplication_token(keys: &[&IdempotencyKey]) -> String {
    let mut hasher = Sha256::new();
    for key in keys {
        hasher.update(key.as_str().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Writes into a ReplacingMergeTree keyed by event_id, and reads with FINAL:
/// whatever the merge state, at most one row per key is visible.
#[derive(Clone)]
pub struct ClickHouseStore {
    client: Client,
    table: String,
    max_row_bytes: usize,
}

impl ClickHouseStore {
    pub async fn new(
        config: &ClickHouseConfig,
        table: String,
        max_row_bytes: usize,
    ) -> anyhow::Result<ClickHouseStore> {
        info!("connecting to ClickHouse at {}...", config.clickhouse_url);
        let client = Client::default()
            .with_url(config.clickhouse_url.clone())
            .with_database(config.clickhouse_database.clone())
            .with_user(config.clickhouse_user.clone())
            .with_password(config.clickhouse_password.clone());

        // Verify connection
        client
            .query("SELECT 1")
            .execute()
            .await
            .context("Failed to connect to ClickHouse")?;
        info!("connected to ClickHouse");

        Ok(ClickHouseStore {
            client,
            table,
            max_row_bytes,
        })
    }

    async fn insert_block(
        &self,
        rows: Vec<(IdempotencyKey, EventRow)>,
    ) -> Result<(), StoreError> {
        let keys: Vec<&IdempotencyKey> = rows.iter().map(|(key, _)| key).collect();
        let client = self
            .client
            .clone()
            .with_option("insert_deduplication_token", deduplication_token(&keys));

        let mut insert = client
            .insert::<EventRow>(&self.table)
            .map_err(classify_error)?;
        for (_, row) in &rows {
            insert.write(row).await.map_err(classify_error)?;
        }
        insert.end().await.map_err(|e| {
            counter!("ingest_clickhouse_insert_errors_total").increment(1);
            warn!("failed to insert into {}: {}", self.table, e);
            classify_error(e)
        })
    }
}

#[async_trait]
impl EventStore for ClickHouseStore {
    #[instrument(skip_all, fields(rows = rows.len()))]
    async fn write(&self, rows: &[Event]) -> Result<WriteReport, StoreError> {
        let mut report = WriteReport::default();
        let mut accepted = Vec::with_capacity(rows.len());
        for event in rows {
            let key = event.idempotency_key().clone();
            match check_row(event, self.max_row_bytes).and_then(|_| EventRow::try_from(event)) {
                Ok(row) => accepted.push((key, row)),
                Err(reason) => report.rejected.push((key, reason)),
            }
        }

        if accepted.is_empty() {
            return Ok(report);
        }

        let inserted = insert_isolating_rejects(accepted, |rows| self.insert_block(rows)).await?;
        report.acknowledged.extend(inserted.acknowledged);
        report.rejected.extend(inserted.rejected);
        Ok(report)
    }

    async fn count_by_key(&self, key: &IdempotencyKey) -> Result<u64, StoreError> {
        self.client
            .query("SELECT count() FROM ? FINAL WHERE event_id = ?")
            .bind(Identifier(&self.table))
            .bind(key.as_str())
            .fetch_one::<u64>()
            .await
            .map_err(classify_error)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT ?fields FROM ? FINAL \
                 ORDER BY ingestion_timestamp DESC, logical_timestamp DESC \
                 LIMIT ?",
            )
            .bind(Identifier(&self.table))
            .bind(limit as u64)
            .fetch_all::<EventRow>()
            .await
            .map_err(classify_error)?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match Event::try_from(row) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("skipping unreadable row: {}", e);
                    None
                }
            })
            .collect())
    }

    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<AggregateRow>, StoreError> {
        let (group, order) = match query.group_by {
            GroupBy::EventName => ("event_name", "events DESC, bucket"),
            GroupBy::Source => ("traffic_source_source", "events DESC, bucket"),
            GroupBy::Medium => ("traffic_source_medium", "events DESC, bucket"),
            GroupBy::Day => ("toString(event_date)", "bucket"),
        };
        let sql = format!(
            "SELECT {group} AS bucket, count() AS events, uniqExact(actor_id) AS actors, \
             sum(ifNull(commerce_revenue, 0)) AS revenue \
             FROM ? FINAL \
             WHERE event_date >= toDate(?) AND event_date <= toDate(?) \
             GROUP BY bucket ORDER BY {order}"
        );

        let records = self
            .client
            .query(&sql)
            .bind(Identifier(&self.table))
            .bind(query.from.to_string())
            .bind(query.to.to_string())
            .fetch_all::<AggregateRecord>()
            .await
            .map_err(classify_error)?;

        Ok(records
            .into_iter()
            .map(|r| AggregateRow {
                group: r.bucket,
                events: r.events,
                actors: r.actors,
                revenue: r.revenue,
            })
            .collect())
    }
}
