use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::api::ValidationError;
use crate::key::{derive_key, IdempotencyKey};
use crate::time::TimeSource;

time::serde::format_description!(event_date_format, Date, "[year]-[month]-[day]");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    #[serde(rename = "string_value")]
    String(String),
    #[serde(rename = "int_value")]
    Int(i64),
    #[serde(rename = "float_value")]
    Float(f64),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub key: String,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn new(key: &str, value: AttributeValue) -> Self {
        Self {
            key: key.to_owned(),
            value,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSource {
    pub source: String,
    pub medium: String,
    pub name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub category: String,
    pub operating_system: String,
    pub browser: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geo {
    pub country: String,
    pub region: String,
    pub city: String,
}

/// Present only on transaction-completing events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Commerce {
    pub transaction_id: String,
    pub revenue: f64,
    pub quantity: i64,
}

/// An event description as handed over by a producer, before validation.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawEvent {
    pub actor_id: Option<String>,
    pub event_name: Option<String>,
    pub logical_timestamp: Option<i64>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub traffic_source: TrafficSource,
    #[serde(default)]
    pub device: Device,
    #[serde(default)]
    pub geo: Geo,
    pub commerce: Option<Commerce>,
    pub stream_id: Option<String>,
    pub platform: Option<String>,
}

/// A validated event, identified by its idempotency key. Only the
/// `EventBuilder` and the stores reading rows back create them.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Event {
    #[serde(rename = "event_id")]
    pub(crate) idempotency_key: IdempotencyKey,
    #[serde(with = "event_date_format")]
    pub(crate) event_date: Date,
    pub(crate) logical_timestamp: i64,
    pub(crate) event_name: String,
    pub(crate) actor_id: String,
    pub(crate) user_id: Option<String>,
    pub(crate) attributes: Vec<Attribute>,
    pub(crate) traffic_source: TrafficSource,
    pub(crate) device: Device,
    pub(crate) geo: Geo,
    pub(crate) commerce: Option<Commerce>,
    pub(crate) stream_id: Option<String>,
    pub(crate) platform: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) ingestion_timestamp: OffsetDateTime,
}

impl Event {
    pub fn idempotency_key(&self) -> &IdempotencyKey {
        &self.idempotency_key
    }

    pub fn event_date(&self) -> Date {
        self.event_date
    }

    pub fn logical_timestamp(&self) -> i64 {
        self.logical_timestamp
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn traffic_source(&self) -> &TrafficSource {
        &self.traffic_source
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn geo(&self) -> &Geo {
        &self.geo
    }

    pub fn commerce(&self) -> Option<&Commerce> {
        self.commerce.as_ref()
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn platform(&self) -> Option<&str> {
        self.platform.as_deref()
    }

    pub fn ingestion_timestamp(&self) -> OffsetDateTime {
        self.ingestion_timestamp
    }
}

pub(crate) fn micros_to_datetime(micros: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000).ok()
}

pub(crate) fn datetime_to_micros(time: OffsetDateTime) -> i64 {
    (time.unix_timestamp_nanos() / 1_000) as i64
}

/// Validates raw producer input and turns it into keyed events.
#[derive(Clone)]
pub struct EventBuilder {
    time_source: Arc<dyn TimeSource + Send + Sync>,
    max_future_skew: Duration,
}

impl EventBuilder {
    pub fn new(time_source: Arc<dyn TimeSource + Send + Sync>, max_future_skew: Duration) -> Self {
        Self {
            time_source,
            max_future_skew,
        }
    }

    pub fn build(&self, raw: RawEvent) -> Result<Event, ValidationError> {
        let actor_id = raw
            .actor_id
            .filter(|id| !id.trim().is_empty())
            .ok_or(ValidationError::MissingField("actor_id"))?;
        let event_name = raw
            .event_name
            .filter(|name| !name.trim().is_empty())
            .ok_or(ValidationError::MissingField("event_name"))?;
        let logical_timestamp = raw
            .logical_timestamp
            .ok_or(ValidationError::MissingField("logical_timestamp"))?;

        let now = self.time_source.now();
        let event_date = self.check_timestamp(logical_timestamp, now)?.date();
        let idempotency_key = derive_key(&actor_id, &event_name, logical_timestamp)?;

        Ok(Event {
            idempotency_key,
            event_date,
            logical_timestamp,
            event_name,
            actor_id,
            user_id: raw.user_id,
            attributes: raw.attributes,
            traffic_source: raw.traffic_source,
            device: raw.device,
            geo: raw.geo,
            commerce: raw.commerce,
            stream_id: raw.stream_id,
            platform: raw.platform,
            ingestion_timestamp: now,
        })
    }

    fn check_timestamp(
        &self,
        logical_timestamp: i64,
        now: OffsetDateTime,
    ) -> Result<OffsetDateTime, ValidationError> {
        if logical_timestamp < 0 {
            return Err(ValidationError::MalformedTimestamp(format!(
                "{logical_timestamp} is before the epoch"
            )));
        }

        let skew_micros = i64::try_from(self.max_future_skew.as_micros()).unwrap_or(i64::MAX);
        let latest = datetime_to_micros(now).saturating_add(skew_micros);
        if logical_timestamp > latest {
            return Err(ValidationError::MalformedTimestamp(format!(
                "{logical_timestamp} is more than {}s in the future",
                self.max_future_skew.as_secs()
            )));
        }

        micros_to_datetime(logical_timestamp).ok_or_else(|| {
            ValidationError::MalformedTimestamp(format!("{logical_timestamp} is out of range"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::FixedTime;
    use time::macros::{date, datetime};

    const NOW: OffsetDateTime = datetime!(2024-05-01 12:00:00 UTC);

    fn builder() -> EventBuilder {
        EventBuilder::new(Arc::new(FixedTime { time: NOW }), Duration::from_secs(300))
    }

    fn raw(actor_id: &str, event_name: &str, logical_timestamp: i64) -> RawEvent {
        RawEvent {
            actor_id: Some(actor_id.to_string()),
            event_name: Some(event_name.to_string()),
            logical_timestamp: Some(logical_timestamp),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_attaches_key_and_timestamps() {
        let ts = datetime_to_micros(NOW) - 60_000_000;
        let event = builder().build(raw("user_1", "page_view", ts)).unwrap();

        assert_eq!(
            event.idempotency_key(),
            &derive_key("user_1", "page_view", ts).unwrap()
        );
        assert_eq!(event.event_date(), date!(2024 - 05 - 01));
        assert_eq!(event.ingestion_timestamp(), NOW);
        assert_eq!(event.logical_timestamp(), ts);
        assert!(event.commerce().is_none());
    }

    #[test]
    fn test_missing_fields_rejected() {
        let ts = datetime_to_micros(NOW);
        let builder = builder();

        assert_eq!(
            builder.build(raw("", "page_view", ts)),
            Err(ValidationError::MissingField("actor_id"))
        );
        assert_eq!(
            builder.build(raw("   ", "page_view", ts)),
            Err(ValidationError::MissingField("actor_id"))
        );
        assert_eq!(
            builder.build(raw("user_1", "", ts)),
            Err(ValidationError::MissingField("event_name"))
        );

        let mut no_timestamp = raw("user_1", "page_view", ts);
        no_timestamp.logical_timestamp = None;
        assert_eq!(
            builder.build(no_timestamp),
            Err(ValidationError::MissingField("logical_timestamp"))
        );
    }

    #[test]
    fn test_malformed_timestamps_rejected() {
        let builder = builder();

        assert!(matches!(
            builder.build(raw("user_1", "page_view", -1)),
            Err(ValidationError::MalformedTimestamp(_))
        ));

        let too_far = datetime_to_micros(NOW) + 301_000_000;
        assert!(matches!(
            builder.build(raw("user_1", "page_view", too_far)),
            Err(ValidationError::MalformedTimestamp(_))
        ));

        // Within tolerance
        let slightly_ahead = datetime_to_micros(NOW) + 299_000_000;
        assert!(builder
            .build(raw("user_1", "page_view", slightly_ahead))
            .is_ok());
    }

    #[test]
    fn test_identity_fields_are_not_normalized() {
        let ts = datetime_to_micros(NOW);
        let builder = builder();
        let padded = builder.build(raw(" user_1", "page_view", ts)).unwrap();
        let plain = builder.build(raw("user_1", "page_view", ts)).unwrap();

        assert_eq!(padded.actor_id(), " user_1");
        assert_ne!(padded.idempotency_key(), plain.idempotency_key());
    }

    #[test]
    fn test_raw_event_from_producer_json() {
        let raw: RawEvent = serde_json::from_str(
            r#"{
                "actor_id": "user_9f8e7d6c",
                "event_name": "purchase",
                "logical_timestamp": 1714564800000000,
                "attributes": [
                    {"key": "ga_session_id", "value": {"int_value": 1234567}},
                    {
                        "key": "page_location",
                        "value": {"string_value": "https://example.com/purchase"}
                    }
                ],
                "traffic_source": {"source": "google", "medium": "cpc", "name": "spring_sale"},
                "commerce": {"transaction_id": "a1b2c3d4", "revenue": 59.98, "quantity": 2}
            }"#,
        )
        .unwrap();

        let event = builder().build(raw).unwrap();
        assert_eq!(event.attributes().len(), 2);
        assert_eq!(event.attributes()[0].value, AttributeValue::Int(1234567));
        assert_eq!(event.traffic_source().medium, "cpc");
        assert_eq!(event.commerce().map(|c| c.quantity), Some(2));
        assert_eq!(event.device(), &Device::default());
    }

    #[test]
    fn test_event_serializes_store_shape() {
        let ts = datetime_to_micros(NOW);
        let event = builder().build(raw("user_1", "page_view", ts)).unwrap();
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event_id"], event.idempotency_key().as_str());
        assert_eq!(json["event_date"], "2024-05-01");
        assert_eq!(json["ingestion_timestamp"], "2024-05-01T12:00:00Z");
    }
}
