//! Scripted collaborators shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::action::ActionPayload;
use crate::capabilities::{
    AppliedRecord, Connectivity, GeoProvider, GeoReadOptions, GpsError, LocationReport,
    RemoteError, RemoteExecutor, TelemetrySink,
};
use crate::geo::PositionSample;
use crate::model::UnixTimeMs;

/// Remote executor that replays queued outcomes, then falls back to a default.
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Result<(), RemoteError>>>,
    fallback: Mutex<Option<RemoteError>>,
    applied: Mutex<Vec<ActionPayload>>,
    attempts: AtomicUsize,
    offline_after: Mutex<Option<(Connectivity, usize)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            offline_after: Mutex::new(None),
        }
    }

    pub fn failing(error: RemoteError) -> Self {
        let executor = Self::new();
        executor.set_fallback(Some(error));
        executor
    }

    pub fn set_fallback(&self, error: Option<RemoteError>) {
        *self.fallback.lock().unwrap() = error;
    }

    pub fn push_result(&self, result: Result<(), RemoteError>) {
        self.script.lock().unwrap().push_back(result);
    }

    /// After `successes` applied actions, flip `connectivity` offline and fail.
    pub fn go_offline_after(&self, connectivity: Connectivity, successes: usize) {
        *self.offline_after.lock().unwrap() = Some((connectivity, successes));
    }

    pub fn applied(&self) -> Vec<ActionPayload> {
        self.applied.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn apply(&self, action: &ActionPayload) -> Result<AppliedRecord, RemoteError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some((connectivity, successes)) = self.offline_after.lock().unwrap().as_ref() {
            if self.applied.lock().unwrap().len() >= *successes {
                connectivity.set_online(false);
                return Err(RemoteError::network("connection dropped"));
            }
        }

        let scripted = self.script.lock().unwrap().pop_front();
        let outcome = match scripted {
            Some(result) => result,
            None => match self.fallback.lock().unwrap().clone() {
                Some(error) => Err(error),
                None => Ok(()),
            },
        };

        outcome.map(|()| {
            self.applied.lock().unwrap().push(action.clone());
            AppliedRecord {
                kind: action.kind(),
                idempotency_key: action.idempotency_key(),
                applied_at: action.occurred_at(),
                body: serde_json::Value::Null,
            }
        })
    }
}

/// Location sensor that answers from a script, then with `fallback`.
pub struct ScriptedGeo {
    script: Mutex<VecDeque<Result<PositionSample, GpsError>>>,
    fallback: Mutex<Result<PositionSample, GpsError>>,
    reads: AtomicUsize,
}

impl ScriptedGeo {
    pub fn new(fallback: Result<PositionSample, GpsError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn fixed(lat: f64, lng: f64) -> Self {
        Self::new(Ok(PositionSample::new(lat, lng, UnixTimeMs(0)).with_accuracy(10.0)))
    }

    pub fn push(&self, result: Result<PositionSample, GpsError>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn set_fallback(&self, result: Result<PositionSample, GpsError>) {
        *self.fallback.lock().unwrap() = result;
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl GeoProvider for ScriptedGeo {
    async fn read(&self, _options: GeoReadOptions) -> Result<PositionSample, GpsError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.fallback.lock().unwrap().clone())
    }
}

/// Telemetry sink that keeps every report it is handed.
#[derive(Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<LocationReport>>,
    fail_with: Mutex<Option<RemoteError>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failure(&self, error: Option<RemoteError>) {
        *self.fail_with.lock().unwrap() = error;
    }

    pub fn reports(&self) -> Vec<LocationReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl TelemetrySink for RecordingSink {
    async fn report(&self, report: &LocationReport) -> Result<(), RemoteError> {
        self.reports.lock().unwrap().push(report.clone());
        match self.fail_with.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
