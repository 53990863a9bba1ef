use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use moka::notification::RemovalCause;
use moka::sync::Cache;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::api::StoreError;
use crate::event::Event;
use crate::key::IdempotencyKey;
use crate::stores::{check_row, AggregateQuery, AggregateRow, EventStore, GroupBy, WriteReport};

const MAX_TRACKED_KEYS: u64 = 1_000_000;

/// In-process store, used by tests and the demo binary.
///
/// Emulates the dedup window of an analytical store with a TTL cache of the
/// keys written recently: a key seen within the window is acknowledged
/// without appending a second row.
///
/// The cache tracks at most `max_tracked_keys` keys. Past that, keys are
/// evicted before their window ends and a re-delivery of an evicted key
/// lands as a second row. Such evictions are logged, counted in
/// `ingest_store_dedup_evictions_total` and exposed by `evicted_keys`.
pub struct MemoryStore {
    rows: RwLock<Vec<Event>>,
    seen: Cache<IdempotencyKey, OffsetDateTime>,
    evicted: Arc<AtomicU64>,
    max_row_bytes: usize,
}

impl MemoryStore {
    pub fn new(dedup_window: Duration, max_row_bytes: usize) -> Self {
        Self::with_capacity(dedup_window, max_row_bytes, MAX_TRACKED_KEYS)
    }

    pub fn with_capacity(
        dedup_window: Duration,
        max_row_bytes: usize,
        max_tracked_keys: u64,
    ) -> Self {
        let evicted = Arc::new(AtomicU64::new(0));
        let on_evict = evicted.clone();

        Self {
            rows: RwLock::new(Vec::new()),
            seen: Cache::builder()
                .max_capacity(max_tracked_keys)
                .time_to_live(dedup_window)
                .eviction_listener(move |key, _, cause| {
                    if cause == RemovalCause::Size {
                        warn!("dedup window shortened: key {} evicted at capacity", key);
                        counter!("ingest_store_dedup_evictions_total").increment(1);
                        on_evict.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .build(),
            evicted,
            max_row_bytes,
        }
    }

    /// Keys dropped from the dedup window because the cache was full.
    pub fn evicted_keys(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Number of rows held, duplicates included.
    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("poisoned MemoryStore lock".to_string())
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn write(&self, rows: &[Event]) -> Result<WriteReport, StoreError> {
        let mut report = WriteReport::default();
        // Held across the whole batch so that the seen check and the append are atomic
        let mut stored = self.rows.write().map_err(|_| poisoned())?;

        for row in rows {
            let key = row.idempotency_key().clone();
            if let Err(reason) = check_row(row, self.max_row_bytes) {
                report.rejected.push((key, reason));
                continue;
            }

            if self.seen.contains_key(&key) {
                debug!("suppressed duplicate write of {}", key);
                counter!("ingest_store_duplicates_suppressed_total").increment(1);
            } else {
                self.seen.insert(key.clone(), OffsetDateTime::now_utc());
                stored.push(row.clone());
            }
            report.acknowledged.push(key);
        }

        Ok(report)
    }

    async fn count_by_key(&self, key: &IdempotencyKey) -> Result<u64, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows
            .iter()
            .filter(|row| row.idempotency_key() == key)
            .count() as u64)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        let mut rows = self.rows.read().map_err(|_| poisoned())?.clone();
        rows.sort_by(|a, b| {
            b.ingestion_timestamp()
                .cmp(&a.ingestion_timestamp())
                .then(b.logical_timestamp().cmp(&a.logical_timestamp()))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<AggregateRow>, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;

        let mut groups: BTreeMap<String, (u64, HashSet<&str>, f64)> = BTreeMap::new();
        for row in rows
            .iter()
            .filter(|row| row.event_date() >= query.from && row.event_date() <= query.to)
        {
            let group = match query.group_by {
                GroupBy::EventName => row.event_name().to_string(),
                GroupBy::Source => row.traffic_source().source.clone(),
                GroupBy::Medium => row.traffic_source().medium.clone(),
                GroupBy::Day => row.event_date().to_string(),
            };
            let entry = groups.entry(group).or_default();
            entry.0 += 1;
            entry.1.insert(row.actor_id());
            entry.2 += row.commerce().map(|c| c.revenue).unwrap_or(0.0);
        }

        let mut result: Vec<AggregateRow> = groups
            .into_iter()
            .map(|(group, (events, actors, revenue))| AggregateRow {
                group,
                events,
                actors: actors.len() as u64,
                revenue,
            })
            .collect();

        // Days read as a time series, everything else as a breakdown
        if query.group_by != GroupBy::Day {
            result.sort_by(|a, b| b.events.cmp(&a.events).then(a.group.cmp(&b.group)));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{datetime_to_micros, Commerce, EventBuilder, RawEvent, TrafficSource};
    use crate::time::FixedTime;
    use std::sync::Arc;
    use time::macros::{date, datetime};

    const NOW: OffsetDateTime = datetime!(2024-05-01 12:00:00 UTC);

    fn event(actor: &str, name: &str, offset_secs: i64, source: &str) -> Event {
        let builder = EventBuilder::new(
            Arc::new(FixedTime { time: NOW }),
            Duration::from_secs(300),
        );
        let commerce = (name == "purchase").then(|| Commerce {
            transaction_id: "a1b2c3d4".to_string(),
            revenue: 49.99,
            quantity: 1,
        });
        builder
            .build(RawEvent {
                actor_id: Some(actor.to_string()),
                event_name: Some(name.to_string()),
                logical_timestamp: Some(
                    datetime_to_micros(NOW) - 3_600_000_000 + offset_secs * 1_000_000,
                ),
                traffic_source: TrafficSource {
                    source: source.to_string(),
                    medium: "cpc".to_string(),
                    name: None,
                },
                commerce,
                ..Default::default()
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_writes_collapse() {
        let store = MemoryStore::new(Duration::from_secs(60), 1_000_000);
        let row = event("user_1", "page_view", 0, "google");

        let first = store.write(&[row.clone()]).await.unwrap();
        let second = store.write(&[row.clone(), row.clone()]).await.unwrap();

        assert_eq!(first.acknowledged, vec![row.idempotency_key().clone()]);
        assert_eq!(second.acknowledged.len(), 2);
        assert_eq!(store.count_by_key(row.idempotency_key()).await.unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicates_reappear_after_window() {
        let store = MemoryStore::new(Duration::from_millis(50), 1_000_000);
        let row = event("user_1", "page_view", 0, "google");

        store.write(&[row.clone()]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        store.write(&[row.clone()]).await.unwrap();

        assert_eq!(store.count_by_key(row.idempotency_key()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_evictions_at_capacity_are_counted() {
        let store = MemoryStore::with_capacity(Duration::from_secs(60), 1_000_000, 2);
        let rows: Vec<Event> = (0..10)
            .map(|i| event(&format!("user_{i}"), "page_view", 0, "google"))
            .collect();

        store.write(&rows).await.unwrap();
        store.seen.run_pending_tasks();

        assert_eq!(store.len(), 10);
        assert!(store.evicted_keys() > 0);
        assert!(store.seen.entry_count() <= 2);
    }

    #[tokio::test]
    async fn test_no_evictions_below_capacity() {
        let store = MemoryStore::new(Duration::from_secs(60), 1_000_000);
        let rows: Vec<Event> = (0..10)
            .map(|i| event(&format!("user_{i}"), "page_view", 0, "google"))
            .collect();

        store.write(&rows).await.unwrap();
        store.seen.run_pending_tasks();

        assert_eq!(store.evicted_keys(), 0);
    }

    #[tokio::test]
    async fn test_malformed_rows_rejected_individually() {
        let store = MemoryStore::new(Duration::from_secs(60), 1_000_000);
        let good = event("user_1", "page_view", 0, "google");
        let mut bad = event("user_1", "purchase", 30, "google");
        if let Some(commerce) = bad.commerce.as_mut() {
            commerce.revenue = f64::NAN;
        }

        let report = store.write(&[good.clone(), bad.clone()]).await.unwrap();

        assert_eq!(report.acknowledged, vec![good.idempotency_key().clone()]);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(&report.rejected[0].0, bad.idempotency_key());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_recent_orders_newest_first() {
        let store = MemoryStore::new(Duration::from_secs(60), 1_000_000);
        let rows = vec![
            event("user_1", "page_view", 0, "google"),
            event("user_1", "view_item", 30, "google"),
            event("user_1", "add_to_cart", 60, "google"),
        ];
        store.write(&rows).await.unwrap();

        let recent = store.recent(2).await.unwrap();
        let names: Vec<&str> = recent.iter().map(|e| e.event_name()).collect();
        assert_eq!(names, vec!["add_to_cart", "view_item"]);
    }

    #[tokio::test]
    async fn test_aggregate_by_source() {
        let store = MemoryStore::new(Duration::from_secs(60), 1_000_000);
        let rows = vec![
            event("user_1", "page_view", 0, "google"),
            event("user_1", "purchase", 30, "google"),
            event("user_2", "page_view", 0, "google"),
            event("user_3", "page_view", 0, "email"),
        ];
        store.write(&rows).await.unwrap();

        let result = store
            .aggregate(&AggregateQuery {
                from: date!(2024 - 04 - 30),
                to: date!(2024 - 05 - 01),
                group_by: GroupBy::Source,
            })
            .await
            .unwrap();

        assert_eq!(
            result,
            vec![
                AggregateRow {
                    group: "google".to_string(),
                    events: 3,
                    actors: 2,
                    revenue: 49.99,
                },
                AggregateRow {
                    group: "email".to_string(),
                    events: 1,
                    actors: 1,
                    revenue: 0.0,
                },
            ]
        );

        let outside = store
            .aggregate(&AggregateQuery {
                from: date!(2024 - 05 - 02),
                to: date!(2024 - 05 - 03),
                group_by: GroupBy::Day,
            })
            .await
            .unwrap();
        assert!(outside.is_empty());
    }
}
