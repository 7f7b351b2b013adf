use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geo::PositionSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoReadOptions {
    pub high_accuracy: bool,
    pub timeout_ms: u64,
    /// Oldest cached OS fix the provider may return; zero forces a new fix.
    pub max_age_ms: u64,
}

impl Default for GeoReadOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout_ms: 15_000,
            max_age_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum GpsError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("location request timed out")]
    Timeout,

    #[error("location unavailable")]
    Unavailable,
}

impl GpsError {
    /// `PermissionDenied` needs the user to act; the others may clear on their own.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, GpsError::Timeout | GpsError::Unavailable)
    }
}

/// Device location sensor.
#[async_trait::async_trait]
pub trait GeoProvider: Send + Sync {
    async fn read(&self, options: GeoReadOptions) -> Result<PositionSample, GpsError>;
}
