use std::str::FromStr;

use async_trait::async_trait;
use serde::Serialize;
use time::Date;

use crate::api::StoreError;
use crate::event::{AttributeValue, Event};
use crate::key::IdempotencyKey;

pub mod clickhouse;
pub mod memory;
pub mod print;

/// Store answer to a batch write. Rows appearing in neither list were not
/// confirmed and may be sent again.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub acknowledged: Vec<IdempotencyKey>,
    pub rejected: Vec<(IdempotencyKey, String)>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GroupBy {
    EventName,
    Source,
    Medium,
    Day,
}

impl FromStr for GroupBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "event_name" => Ok(GroupBy::EventName),
            "source" => Ok(GroupBy::Source),
            "medium" => Ok(GroupBy::Medium),
            "day" => Ok(GroupBy::Day),
            _ => Err(format!("Unknown grouping: {s}")),
        }
    }
}

/// Date-range filtered grouping, bounds inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateQuery {
    pub from: Date,
    pub to: Date,
    pub group_by: GroupBy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRow {
    pub group: String,
    pub events: u64,
    pub actors: u64,
    pub revenue: f64,
}

/// Append-only analytical store holding one row per ingested event.
///
/// Implementations must be safe to share between concurrent ingest calls,
/// and must not make more than one row visible for a given idempotency key
/// written twice within their dedup window.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn write(&self, rows: &[Event]) -> Result<WriteReport, StoreError>;

    async fn count_by_key(&self, key: &IdempotencyKey) -> Result<u64, StoreError>;

    /// Newest rows first, by ingestion then logical timestamp.
    async fn recent(&self, limit: usize) -> Result<Vec<Event>, StoreError>;

    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<AggregateRow>, StoreError>;
}

/// Row shape checks shared by all stores. A failing row can never be written
/// and must not be retried.
pub fn check_row(event: &Event, max_row_bytes: usize) -> Result<(), String> {
    for attribute in event.attributes() {
        if let AttributeValue::Float(value) = attribute.value {
            if !value.is_finite() {
                return Err(format!("attribute {} is not a finite number", attribute.key));
            }
        }
    }

    if let Some(commerce) = event.commerce() {
        if !commerce.revenue.is_finite() || commerce.revenue < 0.0 {
            return Err(format!("invalid revenue {}", commerce.revenue));
        }
        if commerce.quantity < 0 {
            return Err(format!("invalid quantity {}", commerce.quantity));
        }
    }

    let size = serde_json::to_vec(event)
        .map_err(|e| format!("failed to serialize row: {e}"))?
        .len();
    if size > max_row_bytes {
        return Err(format!(
            "row is {size} bytes, above the {max_row_bytes} bytes limit"
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Attribute, Commerce, EventBuilder, RawEvent};
    use crate::time::FixedTime;
    use std::sync::Arc;
    use std::time::Duration;
    use time::macros::datetime;

    fn event(attributes: Vec<Attribute>, commerce: Option<Commerce>) -> Event {
        let builder = EventBuilder::new(
            Arc::new(FixedTime {
                time: datetime!(2024-05-01 12:00:00 UTC),
            }),
            Duration::from_secs(300),
        );
        builder
            .build(RawEvent {
                actor_id: Some("user_1".to_string()),
                event_name: Some("purchase".to_string()),
                logical_timestamp: Some(1_714_564_000_000_000),
                attributes,
                commerce,
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn test_check_row_accepts_well_formed() {
        let row = event(
            vec![Attribute::new("engagement_time_msec", AttributeValue::Int(1200))],
            Some(Commerce {
                transaction_id: "a1b2c3d4".to_string(),
                revenue: 29.99,
                quantity: 1,
            }),
        );
        assert_eq!(check_row(&row, 1_000_000), Ok(()));
    }

    #[test]
    fn test_check_row_rejects_bad_numbers() {
        let row = event(
            vec![Attribute::new("score", AttributeValue::Float(f64::NAN))],
            None,
        );
        assert!(check_row(&row, 1_000_000).is_err());

        let row = event(
            vec![],
            Some(Commerce {
                transaction_id: "a1b2c3d4".to_string(),
                revenue: f64::INFINITY,
                quantity: 1,
            }),
        );
        assert!(check_row(&row, 1_000_000).is_err());

        let row = event(
            vec![],
            Some(Commerce {
                transaction_id: "a1b2c3d4".to_string(),
                revenue: 10.0,
                quantity: -2,
            }),
        );
        assert!(check_row(&row, 1_000_000).is_err());
    }

    #[test]
    fn test_check_row_rejects_oversized() {
        let row = event(
            vec![Attribute::new(
                "blob",
                AttributeValue::String("x".repeat(2_000)),
            )],
            None,
        );
        assert!(check_row(&row, 1_000).is_err());
        assert!(check_row(&row, 10_000).is_ok());
    }

    #[test]
    fn test_group_by_parsing() {
        assert_eq!("source".parse::<GroupBy>(), Ok(GroupBy::Source));
        assert_eq!(" Event_Name ".parse::<GroupBy>(), Ok(GroupBy::EventName));
        assert!("channel".parse::<GroupBy>().is_err());
    }
}
