#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use fieldsync::action::ActionPayload;
use fieldsync::capabilities::{
    AppliedRecord, GeoProvider, GeoReadOptions, GpsError, LocationReport, MemoryKvStore,
    RemoteError, RemoteExecutor, TelemetrySink,
};
use fieldsync::geo::PositionSample;
use fieldsync::model::{ManualClock, UnixTimeMs};
use fieldsync::queue::{ActionQueue, QueueConfig};
use fieldsync::stops::{GeofenceConfig, StopStateMachine};
use fieldsync::sync::{SyncConfig, SyncCoordinator};
use fieldsync::Connectivity;

/// Device clock at boot in every scenario.
pub const T0: UnixTimeMs = UnixTimeMs(1_700_000_000_000);

/// Remote service stand-in. Accepts everything unless told to fail.
#[derive(Default)]
pub struct FakeBackend {
    failure: Mutex<Option<RemoteError>>,
    applied: Mutex<Vec<ActionPayload>>,
    attempts: Mutex<usize>,
}

impl FakeBackend {
    pub fn fail_with(&self, error: Option<RemoteError>) {
        *self.failure.lock().unwrap() = error;
    }

    pub fn applied(&self) -> Vec<ActionPayload> {
        self.applied.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl RemoteExecutor for FakeBackend {
    async fn apply(&self, action: &ActionPayload) -> Result<AppliedRecord, RemoteError> {
        *self.attempts.lock().unwrap() += 1;
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        self.applied.lock().unwrap().push(action.clone());
        Ok(AppliedRecord {
            kind: action.kind(),
            idempotency_key: action.idempotency_key(),
            applied_at: action.occurred_at(),
            body: serde_json::Value::Null,
        })
    }
}

/// GPS stand-in answering with whatever was last set.
pub struct FakeGps {
    next: Mutex<Result<PositionSample, GpsError>>,
}

impl FakeGps {
    pub fn at(lat: f64, lng: f64) -> Self {
        Self {
            next: Mutex::new(Ok(PositionSample::new(lat, lng, T0).with_accuracy(12.0))),
        }
    }

    pub fn set(&self, result: Result<PositionSample, GpsError>) {
        *self.next.lock().unwrap() = result;
    }
}

#[async_trait::async_trait]
impl GeoProvider for FakeGps {
    async fn read(&self, _options: GeoReadOptions) -> Result<PositionSample, GpsError> {
        self.next.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct CollectingSink {
    reports: Mutex<Vec<LocationReport>>,
}

impl CollectingSink {
    pub fn reports(&self) -> Vec<LocationReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl TelemetrySink for CollectingSink {
    async fn report(&self, report: &LocationReport) -> Result<(), RemoteError> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

/// One device: a store that outlives restarts plus the wiring on top of it.
pub struct Device {
    pub store: Arc<MemoryKvStore>,
    pub backend: Arc<FakeBackend>,
    pub connectivity: Connectivity,
    pub clock: Arc<ManualClock>,
}

impl Device {
    pub fn new(online: bool) -> Self {
        Self {
            store: Arc::new(MemoryKvStore::new()),
            backend: Arc::new(FakeBackend::default()),
            connectivity: Connectivity::new(online),
            clock: Arc::new(ManualClock::new(T0)),
        }
    }

    /// Builds the queue and coordinator from what is currently in the store,
    /// as a fresh process would.
    pub async fn boot(&self, queue_config: QueueConfig) -> Arc<SyncCoordinator> {
        let queue = ActionQueue::open(
            self.store.clone(),
            self.backend.clone(),
            self.connectivity.clone(),
            self.clock.clone(),
            queue_config,
        )
        .await
        .unwrap();
        Arc::new(
            SyncCoordinator::new(
                Arc::new(queue),
                self.backend.clone(),
                self.connectivity.clone(),
                SyncConfig::default(),
            )
            .unwrap(),
        )
    }

    pub async fn stops(&self, sync: Arc<SyncCoordinator>) -> StopStateMachine {
        StopStateMachine::open(
            self.store.clone(),
            sync,
            self.clock.clone(),
            GeofenceConfig::default(),
        )
        .await
        .unwrap()
    }
}
