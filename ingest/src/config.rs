use std::time::Duration;

use envconfig::Envconfig;
use tracing::Level;

use crate::retry::RetryPolicy;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StoreKind {
    Memory,
    ClickHouse,
    Print,
}

impl std::str::FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "memory" => Ok(StoreKind::Memory),
            "clickhouse" => Ok(StoreKind::ClickHouse),
            "print" => Ok(StoreKind::Print),
            _ => Err(format!("Unknown Store Type: {s}")),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "memory")]
    pub store: StoreKind,

    #[envconfig(default = "events_streaming")]
    pub table: String,

    #[envconfig(nested = true)]
    pub clickhouse: ClickHouseConfig,

    #[envconfig(nested = true)]
    pub retry: RetryConfig,

    #[envconfig(default = "300")]
    pub max_future_skew_secs: u64, // Clock-skew tolerance for producer timestamps

    #[envconfig(default = "60")]
    pub dedup_window_secs: u64, // Only used by the memory store, others bring their own

    #[envconfig(default = "1000000")]
    pub max_row_bytes: usize,

    #[envconfig(default = "20")]
    pub freshness_limit: usize,

    #[envconfig(default = "2000")]
    pub visibility_delay_ms: u64, // Wait before reading back our own writes

    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "event-ingest")]
    pub otel_service_name: String,

    #[envconfig(default = "info")]
    pub log_level: Level,
}

impl Config {
    pub fn max_future_skew(&self) -> Duration {
        Duration::from_secs(self.max_future_skew_secs)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn visibility_delay(&self) -> Duration {
        Duration::from_millis(self.visibility_delay_ms)
    }
}

#[derive(Envconfig, Clone)]
pub struct ClickHouseConfig {
    #[envconfig(default = "http://localhost:8123")]
    pub clickhouse_url: String,
    #[envconfig(default = "default")]
    pub clickhouse_database: String,
    #[envconfig(default = "default")]
    pub clickhouse_user: String,
    #[envconfig(default = "")]
    pub clickhouse_password: String,
}

#[derive(Envconfig, Clone)]
pub struct RetryConfig {
    #[envconfig(default = "30000")]
    pub ingest_deadline_ms: u64, // Wall-clock budget of a whole batch, retries included
    #[envconfig(default = "200")]
    pub retry_initial_interval_ms: u64,
    #[envconfig(default = "2")]
    pub retry_backoff_coefficient: u32,
    #[envconfig(default = "5000")]
    pub retry_maximum_interval_ms: u64,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::build(
            self.retry_backoff_coefficient,
            Duration::from_millis(self.retry_initial_interval_ms),
        )
        .maximum_interval(Duration::from_millis(self.retry_maximum_interval_ms))
        .deadline(Duration::from_millis(self.ingest_deadline_ms))
        .provide()
    }
}
