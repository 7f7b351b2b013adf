use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::action::{ActionKind, ActionPayload};
use crate::model::{DriverId, TrackingMode, TripId, UnixTimeMs};

/// Failure reported by the remote data service client.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteError {
    #[error("network unreachable: {message}")]
    Network { message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error {status}: {message}")]
    Status { status: u16, message: String },

    #[error("request rejected: {message}")]
    Rejected { message: String },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },
}

impl RemoteError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// The request may never have reached the service.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, RemoteError::Network { .. } | RemoteError::Timeout { .. })
    }

    /// Worth replaying later: connectivity loss, throttling or a server-side fault.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Network { .. } | RemoteError::Timeout { .. } => true,
            RemoteError::Status { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            RemoteError::Rejected { .. } | RemoteError::InvalidResponse { .. } => false,
        }
    }
}

/// Acknowledgement of an action the remote service has applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedRecord {
    pub kind: ActionKind,
    pub idempotency_key: String,
    pub applied_at: UnixTimeMs,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// Applies field actions to the remote store.
///
/// Must be idempotent on `ActionPayload::idempotency_key`: the queue replays
/// actions whose first attempt had an ambiguous outcome.
#[async_trait::async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn apply(&self, action: &ActionPayload) -> Result<AppliedRecord, RemoteError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSource {
    Fresh,
    Cached,
}

/// One telemetry upsert for the live-location table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationReport {
    pub driver_id: DriverId,
    pub trip_id: Option<TripId>,
    pub lat: f64,
    pub lng: f64,
    pub accuracy: Option<f64>,
    pub sampled_at: UnixTimeMs,
    pub source: PositionSource,
    pub mode: TrackingMode,
}

/// Receives best-effort location reports. Failures are never retried.
#[async_trait::async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn report(&self, report: &LocationReport) -> Result<(), RemoteError>;
}
