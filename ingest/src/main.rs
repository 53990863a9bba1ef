use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use envconfig::Envconfig;
use opentelemetry::{KeyValue, Value};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use ingest::config::{Config, StoreKind};
use ingest::dedup::DedupVerifier;
use ingest::event::{Event, EventBuilder};
use ingest::freshness::{FreshnessMonitor, FreshnessReport};
use ingest::ingestor::{BatchIngestor, IngestReport, RowFailure};
use ingest::stores::clickhouse::ClickHouseStore;
use ingest::stores::memory::MemoryStore;
use ingest::stores::print::PrintStore;
use ingest::stores::{AggregateQuery, AggregateRow, EventStore, GroupBy};
use ingest::time::{SystemTime, TimeSource};

mod generator;

#[derive(Parser, Debug)]
#[command(version, about = "Generate shopping journeys and stream them into an event store")]
struct Args {
    /// Store to write into: memory, clickhouse or print. Overrides STORE.
    #[arg(long)]
    store: Option<StoreKind>,

    /// Destination table. Overrides TABLE.
    #[arg(long)]
    table: Option<String>,

    #[arg(long, default_value_t = 500)]
    batch_size: usize,

    #[arg(long, default_value_t = 3)]
    num_actors: usize,

    #[arg(long, default_value_t = 5)]
    events_per_actor: usize,

    /// Re-send the first event and check that it is stored once.
    #[arg(long)]
    test_dedup: bool,

    /// How many recent events to read back. Defaults to FRESHNESS_LIMIT.
    #[arg(long)]
    recent: Option<usize>,
}

#[derive(Serialize)]
struct RunSummary {
    generated: usize,
    invalid: usize,
    batches: usize,
    submitted: usize,
    acknowledged: usize,
    failures: Vec<RowFailure>,
    max_batch_latency_seconds: f64,
    dedup_verified: Option<bool>,
    freshness: FreshnessReport,
    breakdown: Vec<AggregateRow>,
}

impl RunSummary {
    fn is_success(&self) -> bool {
        self.invalid == 0
            && self.failures.is_empty()
            && self.acknowledged == self.submitted
            && self.dedup_verified != Some(false)
    }
}

fn init_tracer(sink_url: &str, sampling_rate: f64, service_name: &str) -> anyhow::Result<Tracer> {
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                    sampling_rate,
                ))))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    Value::from(service_name.to_string()),
                )])),
        )
        .with_batch_config(BatchConfig::default())
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(sink_url)
                .with_timeout(Duration::from_secs(3)),
        )
        .install_batch(runtime::Tokio)?;
    Ok(tracer)
}

async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn EventStore>> {
    let store: Arc<dyn EventStore> = match config.store {
        StoreKind::Memory => {
            Arc::new(MemoryStore::new(config.dedup_window(), config.max_row_bytes))
        }
        StoreKind::Print => Arc::new(PrintStore {
            max_row_bytes: config.max_row_bytes,
        }),
        StoreKind::ClickHouse => Arc::new(
            ClickHouseStore::new(
                &config.clickhouse,
                config.table.clone(),
                config.max_row_bytes,
            )
            .await?,
        ),
    };
    Ok(store)
}

fn generate(args: &Args, builder: &EventBuilder, now: time::OffsetDateTime) -> (Vec<Event>, usize) {
    let mut rng = rand::thread_rng();
    let mut events = Vec::new();
    let mut invalid = 0;

    for i in 0..args.num_actors {
        let actor_id = generator::actor_id();
        let journey = generator::journey(&mut rng, &actor_id, args.events_per_actor, now);
        info!("actor {}: {} - {} events", i + 1, actor_id, journey.len());

        for raw in journey {
            match builder.build(raw) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!("dropping generated event of {}: {}", actor_id, e);
                    invalid += 1;
                }
            }
        }
    }

    (events, invalid)
}

async fn ingest_all(
    ingestor: &BatchIngestor,
    events: &[Event],
    batch_size: usize,
) -> anyhow::Result<Vec<IngestReport>> {
    let mut tasks = JoinSet::new();
    for batch in events.chunks(batch_size.max(1)) {
        let ingestor = ingestor.clone();
        let batch = batch.to_vec();
        tasks.spawn(async move { ingestor.ingest(batch).await });
    }

    let mut reports = Vec::with_capacity(tasks.len());
    while let Some(result) = tasks.join_next().await {
        reports.push(result??);
    }
    Ok(reports)
}

async fn check_dedup(
    config: &Config,
    ingestor: &BatchIngestor,
    store: Arc<dyn EventStore>,
    event: &Event,
) -> bool {
    info!("re-sending event {}", event.idempotency_key());
    match ingestor.ingest(vec![event.clone()]).await {
        Ok(report) if report.is_complete() => {}
        Ok(report) => warn!("re-send was not acknowledged: {:?}", report.failures),
        Err(e) => warn!("re-send failed: {}", e),
    }

    // Writes take a moment to become readable on analytical stores
    tokio::time::sleep(config.visibility_delay()).await;

    match DedupVerifier::new(store).verify(event.idempotency_key()).await {
        Ok(unique) => unique,
        Err(e) => {
            error!("dedup verification failed: {}", e);
            false
        }
    }
}

async fn run(args: Args, config: Config) -> anyhow::Result<RunSummary> {
    let store = build_store(&config).await?;
    let time_source: Arc<dyn TimeSource + Send + Sync> = Arc::new(SystemTime {});
    let builder = EventBuilder::new(time_source.clone(), config.max_future_skew());
    let ingestor = BatchIngestor::new(store.clone(), config.retry.policy());

    let (events, invalid) = generate(&args, &builder, time_source.now());
    info!(
        "streaming {} events into {:?} store in batches of {}",
        events.len(),
        config.store,
        args.batch_size
    );

    let reports = if events.is_empty() {
        vec![]
    } else {
        ingest_all(&ingestor, &events, args.batch_size).await?
    };

    let dedup_verified = match (args.test_dedup, events.first()) {
        (true, Some(first)) => Some(check_dedup(&config, &ingestor, store.clone(), first).await),
        _ => None,
    };

    let freshness = FreshnessMonitor::new(store.clone(), time_source.clone())
        .check(args.recent.unwrap_or(config.freshness_limit))
        .await;

    let today = time_source.now().date();
    let breakdown = store
        .aggregate(&AggregateQuery {
            from: today.previous_day().unwrap_or(today),
            to: today,
            group_by: GroupBy::Source,
        })
        .await
        .unwrap_or_else(|e| {
            warn!("channel breakdown unavailable: {}", e);
            vec![]
        });

    Ok(RunSummary {
        generated: events.len() + invalid,
        invalid,
        batches: reports.len(),
        submitted: reports.iter().map(|r| r.submitted).sum(),
        acknowledged: reports.iter().map(|r| r.acknowledged).sum(),
        failures: reports.iter().flat_map(|r| r.failures.clone()).collect(),
        max_batch_latency_seconds: reports
            .iter()
            .map(|r| r.latency.as_secs_f64())
            .fold(0.0, f64::max),
        dedup_verified,
        freshness,
        breakdown,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let mut config = Config::init_from_env().expect("Invalid configuration:");
    if let Some(store) = args.store {
        config.store = store;
    }
    if let Some(table) = args.table.clone() {
        config.table = table;
    }

    // Instantiate tracing outputs:
    //   - stderr with a level configured by the RUST_LOG envvar (default=INFO)
    //   - OpenTelemetry if enabled, for levels LOG_LEVEL and higher
    let log_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        );
    let otel_layer = config
        .otel_url
        .clone()
        .map(|url| {
            init_tracer(&url, config.otel_sampling_rate, &config.otel_service_name)
                .map(OpenTelemetryLayer::new)
                .expect("failed to install OpenTelemetry tracer")
        })
        .with_filter(LevelFilter::from_level(config.log_level));
    tracing_subscriber::registry()
        .with(log_layer)
        .with(otel_layer)
        .init();

    let summary = match run(args, config).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("ingest run failed: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("{json}"),
        Err(e) => error!("failed to serialize run summary: {}", e),
    }

    if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
