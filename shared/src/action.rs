//! Field actions that travel from the device to the remote service.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{ReferenceId, StopId, StopStatus, TransitionKind, UnixTimeMs};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActionKind {
    UpdateStop,
    UploadScreening,
    CloseJob,
    EndTrip,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::UpdateStop => "update_stop",
            ActionKind::UploadScreening => "upload_screening",
            ActionKind::CloseJob => "close_job",
            ActionKind::EndTrip => "end_trip",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StopUpdate {
    pub stop_id: StopId,
    pub reference: ReferenceId,
    pub transition: TransitionKind,
    pub status: StopStatus,
    pub at: UnixTimeMs,
    pub lat: f64,
    pub lng: f64,
    pub odometer: Option<u32>,
    pub receiver_name: Option<String>,
    pub receiver_type: Option<String>,
    pub has_pumping: Option<bool>,
    pub has_transfer: Option<bool>,
}

/// Alcohol screening result for one driver on one reference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScreeningRecord {
    pub reference: ReferenceId,
    pub driver_name: String,
    pub alcohol_value: f64,
    /// Storage path of the breathalyser photo, uploaded out of band.
    pub image_ref: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub at: UnixTimeMs,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloseJobRecord {
    pub reference: ReferenceId,
    pub vehicle_status: String,
    pub vehicle_desc: String,
    pub hill_fee: bool,
    pub bkk_fee: bool,
    pub repair_fee: bool,
    pub at: UnixTimeMs,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EndTripRecord {
    pub reference: ReferenceId,
    pub end_odometer: Option<u32>,
    pub end_point_name: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub at: UnixTimeMs,
}

/// Kind-specific record of a field action. Immutable once queued.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum ActionPayload {
    UpdateStop(StopUpdate),
    UploadScreening(ScreeningRecord),
    CloseJob(CloseJobRecord),
    EndTrip(EndTripRecord),
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::UpdateStop(_) => ActionKind::UpdateStop,
            ActionPayload::UploadScreening(_) => ActionKind::UploadScreening,
            ActionPayload::CloseJob(_) => ActionKind::CloseJob,
            ActionPayload::EndTrip(_) => ActionKind::EndTrip,
        }
    }

    /// Actions on the same reference must reach the service in the order performed.
    pub fn reference(&self) -> &ReferenceId {
        match self {
            ActionPayload::UpdateStop(u) => &u.reference,
            ActionPayload::UploadScreening(s) => &s.reference,
            ActionPayload::CloseJob(c) => &c.reference,
            ActionPayload::EndTrip(e) => &e.reference,
        }
    }

    pub fn occurred_at(&self) -> UnixTimeMs {
        match self {
            ActionPayload::UpdateStop(u) => u.at,
            ActionPayload::UploadScreening(s) => s.at,
            ActionPayload::CloseJob(c) => c.at,
            ActionPayload::EndTrip(e) => e.at,
        }
    }

    /// Key the remote service deduplicates replays on: subject, kind and timestamp.
    pub fn idempotency_key(&self) -> String {
        let subject = match self {
            ActionPayload::UpdateStop(u) => format!("{}:{}", u.stop_id, u.transition),
            ActionPayload::UploadScreening(s) => format!("{}:{}", s.reference, s.driver_name),
            ActionPayload::CloseJob(c) => c.reference.to_string(),
            ActionPayload::EndTrip(e) => e.reference.to_string(),
        };
        format!("{}:{}:{}", self.kind(), subject, self.occurred_at().0)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn stop_update(
        stop: &str,
        reference: &str,
        transition: TransitionKind,
        at: u64,
    ) -> ActionPayload {
        ActionPayload::UpdateStop(StopUpdate {
            stop_id: StopId::new(stop).unwrap(),
            reference: ReferenceId::new(reference).unwrap(),
            transition,
            status: transition.target_status(),
            at: UnixTimeMs(at),
            lat: 13.75,
            lng: 100.5,
            odometer: None,
            receiver_name: None,
            receiver_type: None,
            has_pumping: None,
            has_transfer: None,
        })
    }
}
