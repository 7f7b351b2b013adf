//! Offline-first sync core for field operations: a durable action queue that
//! drains when connectivity returns, a geofenced stop lifecycle, and adaptive
//! location reporting with a last-known-position fallback.
//!
//! Platform concerns (storage, remote service, push feed, GPS, network
//! signal) come in through the traits in [`capabilities`].

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod action;
pub mod capabilities;
pub mod config;
pub mod geo;
pub mod model;
pub mod position_cache;
pub mod queue;
pub mod queue_store;
pub mod stops;
pub mod sync;
pub mod telemetry;

#[cfg(test)]
mod test_support;

use thiserror::Error;

pub use action::{ActionKind, ActionPayload};
pub use capabilities::{
    Connectivity, GeoProvider, KvStore, PushChannel, RemoteExecutor, TelemetrySink,
};
pub use config::{ConfigError, CoreConfig};
pub use geo::{haversine_distance, BoundingBox, GeoPoint, PositionSample, SignalQuality};
pub use model::{Clock, ModelError, StopStatus, SystemClock, TrackingMode, TransitionKind};
pub use queue::{ActionQueue, DrainStatus, QueueError, QueueStatus, SyncReport};
pub use queue_store::StoreError;
pub use stops::{RejectionReason, StopError, StopStateMachine, TransitionOutcome};
pub use sync::{SyncCoordinator, SyncError, SyncEvent, SyncHandle};
pub use telemetry::{TelemetryError, TelemetryLoop, TrackingHandle, TrackingStatus};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_GEOFENCE_RADIUS_M: f64 = 50.0;
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_NORMAL_INTERVAL_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_LIVE_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_CACHE_MAX_AGE_MS: u64 = 24 * 60 * 60 * 1000;

/// Any error the core can surface, for shells that want a single type.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] capabilities::KvError),

    #[error(transparent)]
    Snapshot(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Stop(#[from] StopError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    Remote(#[from] capabilities::RemoteError),

    #[error(transparent)]
    Push(#[from] capabilities::PushError),

    #[error(transparent)]
    Gps(#[from] capabilities::GpsError),
}

impl CoreError {
    /// True when retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Remote(e) | Self::Sync(SyncError::Remote(e)) => e.is_retryable(),
            Self::Storage(e)
            | Self::Queue(QueueError::Storage(e))
            | Self::Stop(StopError::Storage(e))
            | Self::Telemetry(TelemetryError::Storage(e)) => e.is_retryable(),
            Self::Gps(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// The business rule that refused an operation, if that is what happened.
    pub fn rejection(&self) -> Option<&RejectionReason> {
        match self {
            Self::Stop(e) => e.rejection(),
            _ => None,
        }
    }
}
