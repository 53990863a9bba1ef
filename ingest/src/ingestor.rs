use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use serde::{Serialize, Serializer};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{error, info, instrument, warn};

use crate::api::{IngestError, RowError};
use crate::event::Event;
use crate::key::IdempotencyKey;
use crate::retry::RetryPolicy;
use crate::stores::EventStore;

/// Stand-in expiry for deadlines too large to be represented as an instant.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    pub key: IdempotencyKey,
    pub error: RowError,
}

fn as_seconds<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Outcome of one ingest call. Partial failures are reported here, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub submitted: usize,
    pub acknowledged: usize,
    pub failures: Vec<RowFailure>,
    pub attempts: u32,
    #[serde(rename = "latency_seconds", serialize_with = "as_seconds")]
    pub latency: Duration,
}

impl IngestReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.acknowledged == self.submitted
    }

    pub fn permanent_failures(&self) -> impl Iterator<Item = &RowFailure> {
        self.failures
            .iter()
            .filter(|f| matches!(f.error, RowError::Permanent(_)))
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.failures
            .iter()
            .any(|f| f.error == RowError::DeadlineExceeded)
    }
}

/// Delivers batches of events to the store, at least once.
///
/// Each row carries its idempotency key, so re-sending rows whose fate is
/// unknown is always safe: the store collapses duplicates. Rows are tracked
/// by key rather than by position, as stores may acknowledge out of order.
/// The handle is cheap to clone and meant to be shared by concurrent tasks.
#[derive(Clone)]
pub struct BatchIngestor {
    store: Arc<dyn EventStore>,
    policy: RetryPolicy,
}

impl BatchIngestor {
    pub fn new(store: Arc<dyn EventStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn ingest(&self, events: Vec<Event>) -> Result<IngestReport, IngestError> {
        self.ingest_with_deadline(events, self.policy.deadline).await
    }

    #[instrument(skip_all, fields(batch_size = events.len()))]
    pub async fn ingest_with_deadline(
        &self,
        events: Vec<Event>,
        deadline: Duration,
    ) -> Result<IngestReport, IngestError> {
        if events.is_empty() {
            return Err(IngestError::InvalidArgument(
                "batch holds no event".to_string(),
            ));
        }

        let started = Instant::now();
        let expires_at = started
            .checked_add(deadline)
            .unwrap_or_else(|| started + FAR_FUTURE);
        let submitted = events.len();
        histogram!("ingest_batch_size").record(submitted as f64);

        let mut pending = events;
        let mut acknowledged = 0;
        let mut failures = Vec::new();
        let mut attempts = 0;

        loop {
            attempts += 1;
            match timeout_at(expires_at, self.store.write(&pending)).await {
                Err(_) => {
                    warn!("write attempt {} abandoned at deadline", attempts);
                    break;
                }
                Ok(Err(err)) if !err.is_transient() => {
                    counter!("ingest_store_errors_total").increment(1);
                    error!("write attempt {} failed, not retrying: {}", attempts, err);
                    let reason = err.to_string();
                    failures.extend(pending.drain(..).map(|event| RowFailure {
                        key: event.idempotency_key().clone(),
                        error: RowError::Permanent(reason.clone()),
                    }));
                    break;
                }
                Ok(Err(err)) => {
                    counter!("ingest_store_errors_total").increment(1);
                    warn!(
                        "write attempt {} of {} rows failed: {}",
                        attempts,
                        pending.len(),
                        err
                    );
                }
                Ok(Ok(report)) => {
                    let acked: HashSet<IdempotencyKey> =
                        report.acknowledged.into_iter().collect();
                    let rejected: HashMap<IdempotencyKey, String> =
                        report.rejected.into_iter().collect();

                    pending.retain(|event| {
                        let key = event.idempotency_key();
                        if let Some(reason) = rejected.get(key) {
                            error!("row {} rejected by the store: {}", key, reason);
                            failures.push(RowFailure {
                                key: key.clone(),
                                error: RowError::Permanent(reason.clone()),
                            });
                            false
                        } else if acked.contains(key) {
                            acknowledged += 1;
                            false
                        } else {
                            true
                        }
                    });
                }
            }

            if pending.is_empty() {
                break;
            }

            let backoff = self.policy.retry_interval(attempts);
            counter!("ingest_write_retries_total").increment(1);
            if timeout_at(expires_at, sleep(backoff)).await.is_err() {
                break;
            }
        }

        if !pending.is_empty() {
            warn!(
                "deadline of {:?} exceeded with {} rows unacknowledged",
                deadline,
                pending.len()
            );
            failures.extend(pending.into_iter().map(|event| RowFailure {
                key: event.idempotency_key().clone(),
                error: RowError::DeadlineExceeded,
            }));
        }

        let latency = started.elapsed();
        histogram!("ingest_batch_latency_seconds").record(latency.as_secs_f64());
        counter!("ingest_rows_acknowledged_total").increment(acknowledged as u64);
        for failure in &failures {
            counter!("ingest_rows_failed_total", "reason" => failure.error.reason())
                .increment(1);
        }
        info!(
            "ingested {}/{} rows in {} attempts ({:.3}s)",
            acknowledged,
            submitted,
            attempts,
            latency.as_secs_f64()
        );

        Ok(IngestReport {
            submitted,
            acknowledged,
            failures,
            attempts,
            latency,
        })
    }
}
