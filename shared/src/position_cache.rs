use std::sync::Arc;
use tracing::{debug, warn};

use crate::capabilities::{KeyNamespace, KvError, KvKey, KvStore};
use crate::geo::{BoundingBox, PositionSample};
use crate::model::UnixTimeMs;

const LAST_GOOD_KEY: &str = "last_good";

/// Most recent valid fix, kept across restarts as a fallback source.
///
/// Entries older than `max_age_ms` or outside `bounds` read as absent.
pub struct LastKnownPositionCache {
    store: Arc<dyn KvStore>,
    key: KvKey,
    bounds: BoundingBox,
    max_age_ms: u64,
}

impl LastKnownPositionCache {
    pub fn new(
        store: Arc<dyn KvStore>,
        bounds: BoundingBox,
        max_age_ms: u64,
    ) -> Result<Self, KvError> {
        Ok(Self {
            store,
            key: KvKey::new(KeyNamespace::Position, LAST_GOOD_KEY)?,
            bounds,
            max_age_ms,
        })
    }

    pub fn bounds(&self) -> &BoundingBox {
        &self.bounds
    }

    pub fn is_usable(&self, sample: &PositionSample, now: UnixTimeMs) -> bool {
        sample.is_valid_in(&self.bounds) && now.since(sample.timestamp) <= self.max_age_ms
    }

    /// Unreadable or stale entries are reported as a miss, never as an error.
    pub async fn get(&self, now: UnixTimeMs) -> Option<PositionSample> {
        let bytes = match self.store.get(&self.key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "failed to read cached position");
                return None;
            }
        };

        let sample: PositionSample = match serde_json::from_slice(&bytes) {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "discarding unreadable cached position");
                return None;
            }
        };

        if self.is_usable(&sample, now) {
            Some(sample)
        } else {
            debug!(sampled_at = %sample.timestamp, "cached position is stale or out of bounds");
            None
        }
    }

    /// Stores `sample` if it is valid. Returns whether it was written.
    pub async fn put(&self, sample: &PositionSample) -> Result<bool, KvError> {
        if !sample.is_valid_in(&self.bounds) {
            return Ok(false);
        }
        let bytes = serde_json::to_vec(sample).map_err(|e| KvError::Serialization {
            message: e.to_string(),
            key: Some(self.key.raw()),
        })?;
        self.store.set(&self.key, bytes).await?;
        Ok(true)
    }

    pub async fn clear(&self) -> Result<(), KvError> {
        self.store.remove(&self.key).await
    }
}
