use ingest::event::{
    Attribute, AttributeValue, Commerce, Device, Geo, RawEvent, TrafficSource,
};
use rand::seq::SliceRandom;
use rand::Rng;
use time::OffsetDateTime;
use uuid::Uuid;

const JOURNEY: [&str; 5] = [
    "page_view",
    "view_item",
    "add_to_cart",
    "begin_checkout",
    "purchase",
];

const CHANNELS: [(&str, &str, Option<&str>); 5] = [
    ("google", "cpc", Some("spring_sale")),
    ("google", "organic", None),
    ("facebook", "cpc", Some("retargeting")),
    ("(direct)", "(none)", None),
    ("email", "email", Some("newsletter")),
];

const PRODUCTS: [(&str, f64); 3] = [("PROD001", 29.99), ("PROD002", 49.99), ("PROD003", 79.99)];

const DEVICE_CATEGORIES: [&str; 3] = ["mobile", "desktop", "tablet"];
const OPERATING_SYSTEMS: [&str; 4] = ["iOS", "Android", "Windows", "macOS"];
const BROWSERS: [&str; 4] = ["Chrome", "Safari", "Firefox", "Edge"];
const COUNTRIES: [&str; 4] = ["US", "UK", "CA", "AU"];
const REGIONS: [&str; 4] = ["California", "New York", "London", "Ontario"];
const CITIES: [&str; 4] = ["San Francisco", "New York", "London", "Toronto"];

pub const STREAM_ID: &str = "web_stream_001";

pub fn actor_id() -> String {
    format!("user_{}", &Uuid::new_v4().simple().to_string()[..8])
}

fn pick<'a, R: Rng>(rng: &mut R, values: &[&'a str]) -> &'a str {
    values.choose(rng).copied().unwrap_or_default()
}

/// Generates one shopping journey for `actor_id`, at most five steps long,
/// whose last step happened between one and sixty minutes before `now`.
pub fn journey<R: Rng>(
    rng: &mut R,
    actor_id: &str,
    steps: usize,
    now: OffsetDateTime,
) -> Vec<RawEvent> {
    let steps = steps.min(JOURNEY.len());
    let (source, medium, campaign) = CHANNELS[rng.gen_range(0..CHANNELS.len())];
    let session_id: i64 = rng.gen_range(1_000_000..10_000_000);
    let session_number: i64 = rng.gen_range(1..=10);

    let gaps: Vec<i64> = (1..steps).map(|_| rng.gen_range(30..=300)).collect();
    let ends_at = now - time::Duration::minutes(rng.gen_range(1..=60));
    let mut at = ends_at - time::Duration::seconds(gaps.iter().sum());

    let mut events = Vec::with_capacity(steps);
    for (i, event_name) in JOURNEY.iter().take(steps).enumerate() {
        if i > 0 {
            at += time::Duration::seconds(gaps[i - 1]);
        }

        let commerce = (*event_name == "purchase").then(|| {
            let (_, price) = PRODUCTS[rng.gen_range(0..PRODUCTS.len())];
            let quantity: i64 = rng.gen_range(1..=3);
            Commerce {
                transaction_id: Uuid::new_v4().to_string()[..8].to_string(),
                revenue: price * quantity as f64,
                quantity,
            }
        });

        events.push(RawEvent {
            actor_id: Some(actor_id.to_string()),
            event_name: Some(event_name.to_string()),
            logical_timestamp: Some((at.unix_timestamp_nanos() / 1_000) as i64),
            user_id: None,
            attributes: vec![
                Attribute::new("ga_session_id", AttributeValue::Int(session_id)),
                Attribute::new("ga_session_number", AttributeValue::Int(session_number)),
                Attribute::new(
                    "page_location",
                    AttributeValue::String(format!("https://example.com/{event_name}")),
                ),
                Attribute::new(
                    "engagement_time_msec",
                    AttributeValue::Int(rng.gen_range(1_000..=30_000)),
                ),
            ],
            traffic_source: TrafficSource {
                source: source.to_string(),
                medium: medium.to_string(),
                name: campaign.map(str::to_string),
            },
            device: Device {
                category: pick(rng, &DEVICE_CATEGORIES).to_string(),
                operating_system: pick(rng, &OPERATING_SYSTEMS).to_string(),
                browser: pick(rng, &BROWSERS).to_string(),
            },
            geo: Geo {
                country: pick(rng, &COUNTRIES).to_string(),
                region: pick(rng, &REGIONS).to_string(),
                city: pick(rng, &CITIES).to_string(),
            },
            commerce,
            stream_id: Some(STREAM_ID.to_string()),
            platform: Some("WEB".to_string()),
        });
    }

    events
}
