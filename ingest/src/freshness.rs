use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::warn;

use crate::event::{Commerce, Event};
use crate::key::IdempotencyKey;
use crate::stores::EventStore;
use crate::time::TimeSource;

pub const DEFAULT_FRESHNESS_LIMIT: usize = 20;

const LIVE_BELOW_SECS: i64 = 60;
const DEGRADED_BELOW_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Live,
    Degraded,
    Stale,
    NoData,
}

impl FeedStatus {
    pub fn classify(age_secs: i64) -> FeedStatus {
        if age_secs < LIVE_BELOW_SECS {
            FeedStatus::Live
        } else if age_secs < DEGRADED_BELOW_SECS {
            FeedStatus::Degraded
        } else {
            FeedStatus::Stale
        }
    }
}

/// Lightweight projection of a stored event, as shown in the live feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentEvent {
    pub key: IdempotencyKey,
    pub event_name: String,
    pub actor_id: String,
    pub logical_timestamp: i64,
    pub source: String,
    pub medium: String,
    pub commerce: Option<Commerce>,
    pub age_secs: i64,
}

impl RecentEvent {
    fn project(event: &Event, now: OffsetDateTime) -> RecentEvent {
        let age_secs = (now - event.ingestion_timestamp()).whole_seconds().max(0);
        RecentEvent {
            key: event.idempotency_key().clone(),
            event_name: event.event_name().to_string(),
            actor_id: event.actor_id().to_string(),
            logical_timestamp: event.logical_timestamp(),
            source: event.traffic_source().source.clone(),
            medium: event.traffic_source().medium.clone(),
            commerce: event.commerce().cloned(),
            age_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FreshnessReport {
    pub events: Vec<RecentEvent>,
    pub min_age_secs: Option<i64>,
    pub status: FeedStatus,
}

impl FreshnessReport {
    fn no_data() -> FreshnessReport {
        FreshnessReport {
            events: vec![],
            min_age_secs: None,
            status: FeedStatus::NoData,
        }
    }
}

/// Reads back the newest rows to tell how long ago the feed last moved.
/// Never fails: an unreachable store reads as no data.
pub struct FreshnessMonitor {
    store: Arc<dyn EventStore>,
    time_source: Arc<dyn TimeSource + Send + Sync>,
}

impl FreshnessMonitor {
    pub fn new(
        store: Arc<dyn EventStore>,
        time_source: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        Self { store, time_source }
    }

    pub async fn check(&self, limit: usize) -> FreshnessReport {
        let rows = match self.store.recent(limit).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!("freshness check could not read the store: {}", err);
                return FreshnessReport::no_data();
            }
        };

        let now = self.time_source.now();
        let events: Vec<RecentEvent> = rows
            .iter()
            .map(|event| RecentEvent::project(event, now))
            .collect();
        let min_age_secs = events.iter().map(|e| e.age_secs).min();
        let status = min_age_secs.map_or(FeedStatus::NoData, FeedStatus::classify);

        FreshnessReport {
            events,
            min_age_secs,
            status,
        }
    }
}
