//! Geofenced job-stop state machine.
//!
//! Transitions are validated against local state and committed optimistically;
//! delivery to the remote service happens afterwards through the sync seam and
//! is reported separately via [`Delivery`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{error, info, instrument, warn};

use crate::action::{ActionPayload, CloseJobRecord, EndTripRecord, ScreeningRecord, StopUpdate};
use crate::capabilities::{AppliedRecord, KeyNamespace, KvError, KvKey, KvStore};
use crate::geo::{haversine_distance, PositionSample};
use crate::model::{
    validate_alcohol_value, validate_odometer, ActionId, Clock, JobReference, ReferenceId, Stop,
    StopEvent, StopId, StopStatus, TransitionKind,
};
use crate::sync::{ExecutionOutcome, SyncCoordinator};
use crate::DEFAULT_GEOFENCE_RADIUS_M;

const JOB_BOOK_KEY: &str = "book";

/// Haversine round-off allowed when comparing against a radius, in meters.
const GEOFENCE_TOLERANCE_M: f64 = 1e-6;

/// Why a request was refused. Never queued or retried; shown to the driver as is.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum RejectionReason {
    #[error("job {reference} is already closed")]
    JobAlreadyClosed { reference: ReferenceId },

    #[error("cannot {kind} a stop that is {from}")]
    IllegalTransition {
        from: StopStatus,
        kind: TransitionKind,
    },

    #[error("an alcohol screening must be recorded before checking in at the origin")]
    SafetyPreconditionUnmet,

    #[error("{distance_m:.0} m from the destination, must be within {radius_m:.0} m")]
    OutOfRadius { distance_m: f64, radius_m: f64 },

    #[error("unknown stop {0}")]
    UnknownStop(StopId),

    #[error("unknown job {0}")]
    UnknownReference(ReferenceId),

    #[error("trip for job {0} has already ended")]
    TripAlreadyEnded(ReferenceId),

    #[error("{0}")]
    InvalidInput(String),
}

#[derive(Debug, Error)]
pub enum StopError {
    #[error(transparent)]
    Rejected(#[from] RejectionReason),

    /// Local state could not be saved; nothing was applied.
    #[error("storage error: {0}")]
    Storage(#[from] KvError),
}

impl StopError {
    pub fn rejection(&self) -> Option<&RejectionReason> {
        match self {
            StopError::Rejected(reason) => Some(reason),
            StopError::Storage(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeofenceConfig {
    pub default_radius_m: f64,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            default_radius_m: DEFAULT_GEOFENCE_RADIUS_M,
        }
    }
}

impl GeofenceConfig {
    pub fn validate(&self) -> Result<(), RejectionReason> {
        if !self.default_radius_m.is_finite() || self.default_radius_m <= 0.0 {
            return Err(RejectionReason::InvalidInput(
                "default_radius_m must be a positive number".into(),
            ));
        }
        Ok(())
    }
}

/// Optional details the driver enters alongside a transition.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionExtra {
    pub odometer: Option<u32>,
    pub receiver_name: Option<String>,
    pub receiver_type: Option<String>,
    pub has_pumping: Option<bool>,
    pub has_transfer: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppliedStop {
    pub stop: Stop,
    /// Measured distance to the destination, when one is on record.
    pub distance_m: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeliveryStatus {
    Persisted(AppliedRecord),
    Queued(ActionId),
    Failed(String),
}

/// Second phase of an applied change: the remote outcome, available later.
#[derive(Debug)]
pub struct Delivery {
    rx: oneshot::Receiver<DeliveryStatus>,
}

impl Delivery {
    pub async fn wait(self) -> DeliveryStatus {
        self.rx
            .await
            .unwrap_or_else(|_| DeliveryStatus::Failed("delivery worker stopped".into()))
    }
}

/// A locally committed change and its pending delivery.
#[derive(Debug)]
pub struct Outcome<T> {
    pub applied: T,
    pub delivery: Delivery,
}

pub type TransitionOutcome = Outcome<AppliedStop>;

/// Jobs and stops as known on this device.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct JobBook {
    jobs: BTreeMap<ReferenceId, JobReference>,
    stops: BTreeMap<StopId, Stop>,
}

type DeliveryRequest = (ActionPayload, oneshot::Sender<DeliveryStatus>);

/// Submits in arrival order so actions on one reference never overtake each other.
fn spawn_delivery_worker(sync: Arc<SyncCoordinator>) -> mpsc::UnboundedSender<DeliveryRequest> {
    let (tx, mut rx) = mpsc::unbounded_channel::<DeliveryRequest>();
    tokio::spawn(async move {
        while let Some((payload, reply)) = rx.recv().await {
            let key = payload.idempotency_key();
            let status = match sync.submit(payload).await {
                Ok(ExecutionOutcome::Persisted(record)) => DeliveryStatus::Persisted(record),
                Ok(ExecutionOutcome::Queued(queued)) => DeliveryStatus::Queued(queued.id),
                Err(e) => {
                    warn!(key = %key, error = %e, "delivery failed after local apply");
                    DeliveryStatus::Failed(e.to_string())
                }
            };
            let _ = reply.send(status);
        }
    });
    tx
}

pub struct StopStateMachine {
    store: Arc<dyn KvStore>,
    book_key: KvKey,
    clock: Arc<dyn Clock>,
    config: GeofenceConfig,
    book: Mutex<JobBook>,
    deliveries: mpsc::UnboundedSender<DeliveryRequest>,
}

impl StopStateMachine {
    /// Builds the machine and reloads any job state saved by a previous run.
    pub async fn open(
        store: Arc<dyn KvStore>,
        sync: Arc<SyncCoordinator>,
        clock: Arc<dyn Clock>,
        config: GeofenceConfig,
    ) -> Result<Self, StopError> {
        config.validate()?;
        let machine = Self {
            store,
            book_key: KvKey::new(KeyNamespace::Jobs, JOB_BOOK_KEY)?,
            clock,
            config,
            book: Mutex::new(JobBook::default()),
            deliveries: spawn_delivery_worker(sync),
        };
        machine.restore().await?;
        Ok(machine)
    }

    /// Replaces in-memory job state with what is saved. Returns the number of jobs.
    /// An unreadable save is discarded with a warning.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<usize, StopError> {
        let loaded = match self.store.get(&self.book_key).await? {
            None => JobBook::default(),
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(error = %e, "discarding unreadable job state");
                JobBook::default()
            }),
        };
        let jobs = loaded.jobs.len();
        info!(jobs, stops = loaded.stops.len(), "job state restored");
        *self.book.lock().await = loaded;
        Ok(jobs)
    }

    async fn save(&self, book: &JobBook) -> Result<(), KvError> {
        let bytes = serde_json::to_vec(book).map_err(|e| KvError::Serialization {
            message: e.to_string(),
            key: Some(self.book_key.raw()),
        })?;
        self.store.set(&self.book_key, bytes).await.map_err(|e| {
            error!(error = %e, "failed to save job state");
            e
        })
    }

    fn dispatch(&self, payload: ActionPayload) -> Delivery {
        let (tx, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError((payload, reply))) = self.deliveries.send((payload, tx)) {
            error!(key = %payload.idempotency_key(), "delivery worker is gone");
            let _ = reply.send(DeliveryStatus::Failed("delivery worker stopped".into()));
        }
        Delivery { rx }
    }

    /// Registers a job and its stops. Progress already recorded for a known
    /// stop is kept; only its master data is refreshed.
    #[instrument(skip_all, fields(reference = %job.reference))]
    pub async fn provision(&self, job: JobReference, stops: Vec<Stop>) -> Result<(), StopError> {
        if let Some(stray) = stops.iter().find(|s| s.reference != job.reference) {
            return Err(RejectionReason::InvalidInput(format!(
                "stop {} belongs to {}, not {}",
                stray.id, stray.reference, job.reference
            ))
            .into());
        }

        let mut book = self.book.lock().await;
        let mut next = book.clone();

        match next.jobs.get_mut(&job.reference) {
            Some(known) => known.driver_names.extend(job.driver_names),
            None => {
                next.jobs.insert(job.reference.clone(), job);
            }
        }
        for stop in stops {
            match next.stops.get_mut(&stop.id) {
                Some(known) => {
                    known.sequence = stop.sequence;
                    known.is_origin = stop.is_origin;
                    known.destination = stop.destination;
                }
                None => {
                    next.stops.insert(stop.id.clone(), stop);
                }
            }
        }

        self.save(&next).await?;
        *book = next;
        Ok(())
    }

    pub async fn stop(&self, id: &StopId) -> Option<Stop> {
        self.book.lock().await.stops.get(id).cloned()
    }

    pub async fn job(&self, reference: &ReferenceId) -> Option<JobReference> {
        self.book.lock().await.jobs.get(reference).cloned()
    }

    /// Stops of one job in route order.
    pub async fn stops_for(&self, reference: &ReferenceId) -> Vec<Stop> {
        let book = self.book.lock().await;
        let mut stops: Vec<Stop> = book
            .stops
            .values()
            .filter(|s| &s.reference == reference)
            .cloned()
            .collect();
        stops.sort_by_key(|s| s.sequence);
        stops
    }

    /// Validates and applies one stop transition.
    ///
    /// Checks run in order and the first failure wins: job closed, forward
    /// legality, origin safety gate, geofence, then entered values.
    #[instrument(skip_all, fields(stop = %stop_id, kind = %kind))]
    pub async fn transition(
        &self,
        stop_id: &StopId,
        kind: TransitionKind,
        sample: PositionSample,
        extra: TransitionExtra,
    ) -> Result<TransitionOutcome, StopError> {
        let mut book = self.book.lock().await;

        let stop = book
            .stops
            .get(stop_id)
            .ok_or_else(|| RejectionReason::UnknownStop(stop_id.clone()))?;
        let job = book
            .jobs
            .get(&stop.reference)
            .ok_or_else(|| RejectionReason::UnknownReference(stop.reference.clone()))?;

        let distance_m = self.check_transition(job, stop, kind, &sample, &extra)?;

        let at = self.clock.now();
        let mut updated = stop.clone();
        updated.status = kind.target_status();
        let event = StopEvent {
            at,
            lat: sample.lat,
            lng: sample.lng,
            odometer: extra.odometer,
        };
        match kind {
            TransitionKind::CheckIn => updated.check_in = Some(event),
            TransitionKind::Fuel => updated.fuel = Some(event),
            TransitionKind::Unload => updated.unload = Some(event),
            TransitionKind::CheckOut => updated.check_out = Some(event),
        }

        let mut next = book.clone();
        next.stops.insert(updated.id.clone(), updated.clone());
        self.save(&next).await?;
        *book = next;

        info!(status = %updated.status, distance_m = ?distance_m, "stop transition applied");

        let payload = ActionPayload::UpdateStop(StopUpdate {
            stop_id: updated.id.clone(),
            reference: updated.reference.clone(),
            transition: kind,
            status: updated.status,
            at,
            lat: sample.lat,
            lng: sample.lng,
            odometer: extra.odometer,
            receiver_name: extra.receiver_name,
            receiver_type: extra.receiver_type,
            has_pumping: extra.has_pumping,
            has_transfer: extra.has_transfer,
        });
        let delivery = self.dispatch(payload);

        Ok(Outcome {
            applied: AppliedStop {
                stop: updated,
                distance_m,
            },
            delivery,
        })
    }

    fn check_transition(
        &self,
        job: &JobReference,
        stop: &Stop,
        kind: TransitionKind,
        sample: &PositionSample,
        extra: &TransitionExtra,
    ) -> Result<Option<f64>, RejectionReason> {
        if job.closed {
            return Err(RejectionReason::JobAlreadyClosed {
                reference: job.reference.clone(),
            });
        }

        if !kind.is_legal_from(stop.status) {
            return Err(RejectionReason::IllegalTransition {
                from: stop.status,
                kind,
            });
        }

        if stop.is_origin && kind == TransitionKind::CheckIn && !job.has_screening() {
            return Err(RejectionReason::SafetyPreconditionUnmet);
        }

        let distance_m = match &stop.destination {
            None => None,
            Some(destination) => {
                if !sample.lat.is_finite() || !sample.lng.is_finite() {
                    return Err(RejectionReason::InvalidInput(
                        "position sample is not a finite coordinate".into(),
                    ));
                }
                let radius_m = destination
                    .radius_m
                    .unwrap_or(self.config.default_radius_m);
                let distance_m = haversine_distance(sample.point(), destination.point);
                if distance_m > radius_m + GEOFENCE_TOLERANCE_M {
                    return Err(RejectionReason::OutOfRadius {
                        distance_m,
                        radius_m,
                    });
                }
                Some(distance_m)
            }
        };

        if let Some(odometer) = extra.odometer {
            validate_odometer(odometer)
                .map_err(|e| RejectionReason::InvalidInput(e.to_string()))?;
        }

        Ok(distance_m)
    }

    /// Records an alcohol screening for one driver. Any recorded screening
    /// opens the origin check-in for the job.
    #[instrument(skip_all, fields(reference = %reference, driver = driver_name))]
    pub async fn record_screening(
        &self,
        reference: &ReferenceId,
        driver_name: &str,
        alcohol_value: f64,
        image_ref: Option<String>,
        sample: Option<PositionSample>,
    ) -> Result<Outcome<JobReference>, StopError> {
        let driver_name = driver_name.trim();
        let mut book = self.book.lock().await;
        let job = Self::open_job(&book, reference)?;

        if driver_name.is_empty() {
            return Err(RejectionReason::InvalidInput("driver name is required".into()).into());
        }
        validate_alcohol_value(alcohol_value)
            .map_err(|e| RejectionReason::InvalidInput(e.to_string()))?;

        let mut updated = job.clone();
        updated.screened_drivers.insert(driver_name.to_string());

        let mut next = book.clone();
        next.jobs.insert(reference.clone(), updated.clone());
        self.save(&next).await?;
        *book = next;

        info!(screened = updated.screened_drivers.len(), "screening recorded");

        let delivery = self.dispatch(ActionPayload::UploadScreening(ScreeningRecord {
            reference: reference.clone(),
            driver_name: driver_name.to_string(),
            alcohol_value,
            image_ref,
            lat: sample.map(|s| s.lat),
            lng: sample.map(|s| s.lng),
            at: self.clock.now(),
        }));

        Ok(Outcome {
            applied: updated,
            delivery,
        })
    }

    /// Closes a job. Terminal: the job's stops accept nothing afterwards.
    #[instrument(skip_all, fields(reference = %reference))]
    pub async fn close_job(
        &self,
        reference: &ReferenceId,
        vehicle_status: &str,
        vehicle_desc: &str,
        fees: JobFees,
    ) -> Result<Outcome<JobReference>, StopError> {
        let mut book = self.book.lock().await;
        let job = Self::open_job(&book, reference)?;

        if vehicle_status.trim().is_empty() {
            return Err(RejectionReason::InvalidInput("vehicle status is required".into()).into());
        }

        let mut updated = job.clone();
        updated.closed = true;

        let mut next = book.clone();
        next.jobs.insert(reference.clone(), updated.clone());
        self.save(&next).await?;
        *book = next;

        info!("job closed");

        let delivery = self.dispatch(ActionPayload::CloseJob(CloseJobRecord {
            reference: reference.clone(),
            vehicle_status: vehicle_status.trim().to_string(),
            vehicle_desc: vehicle_desc.trim().to_string(),
            hill_fee: fees.hill,
            bkk_fee: fees.bkk,
            repair_fee: fees.repair,
            at: self.clock.now(),
        }));

        Ok(Outcome {
            applied: updated,
            delivery,
        })
    }

    #[instrument(skip_all, fields(reference = %reference))]
    pub async fn end_trip(
        &self,
        reference: &ReferenceId,
        end_odometer: Option<u32>,
        end_point_name: &str,
        sample: Option<PositionSample>,
    ) -> Result<Outcome<JobReference>, StopError> {
        let mut book = self.book.lock().await;
        let job = Self::open_job(&book, reference)?;

        if job.trip_ended {
            return Err(RejectionReason::TripAlreadyEnded(reference.clone()).into());
        }
        if end_point_name.trim().is_empty() {
            return Err(RejectionReason::InvalidInput("end point name is required".into()).into());
        }
        if let Some(odometer) = end_odometer {
            validate_odometer(odometer)
                .map_err(|e| RejectionReason::InvalidInput(e.to_string()))?;
        }

        let mut updated = job.clone();
        updated.trip_ended = true;

        let mut next = book.clone();
        next.jobs.insert(reference.clone(), updated.clone());
        self.save(&next).await?;
        *book = next;

        info!("trip ended");

        let delivery = self.dispatch(ActionPayload::EndTrip(EndTripRecord {
            reference: reference.clone(),
            end_odometer,
            end_point_name: end_point_name.trim().to_string(),
            lat: sample.map(|s| s.lat),
            lng: sample.map(|s| s.lng),
            at: self.clock.now(),
        }));

        Ok(Outcome {
            applied: updated,
            delivery,
        })
    }

    fn open_job<'a>(
        book: &'a JobBook,
        reference: &ReferenceId,
    ) -> Result<&'a JobReference, RejectionReason> {
        let job = book
            .jobs
            .get(reference)
            .ok_or_else(|| RejectionReason::UnknownReference(reference.clone()))?;
        if job.closed {
            return Err(RejectionReason::JobAlreadyClosed {
                reference: reference.clone(),
            });
        }
        Ok(job)
    }
}

/// Surcharges claimed when closing a job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFees {
    pub hill: bool,
    pub bkk: bool,
    pub repair: bool,
}
