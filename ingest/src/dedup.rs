use std::sync::Arc;

use tracing::{info, warn};

use crate::api::StoreError;
use crate::key::IdempotencyKey;
use crate::stores::EventStore;

/// Diagnostic check that the store collapsed re-deliveries of a key.
///
/// Callers must allow for the store's visibility latency before verifying a
/// key they just wrote.
pub struct DedupVerifier {
    store: Arc<dyn EventStore>,
}

impl DedupVerifier {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn verify(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
        let count = self.store.count_by_key(key).await?;
        if count == 1 {
            info!("exactly one visible row for key {}", key);
        } else {
            warn!("expected one visible row for key {}, found {}", key, count);
        }
        Ok(count == 1)
    }
}
