use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use uuid::Uuid;

use crate::geo::GeoPoint;

pub const MAX_ODOMETER: u32 = 9_999_999;
pub const MIN_ALCOHOL_VALUE: f64 = 0.0;
pub const MAX_ALCOHOL_VALUE: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("validation error: {0}")]
    Validation(String),
}

// ============================================================================
// Time
// ============================================================================

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn saturating_add_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    /// Milliseconds elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for UnixTimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Wall-clock source. Injected so staleness rules can be tested without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start: UnixTimeMs) -> Self {
        Self {
            now_ms: AtomicU64::new(start.0),
        }
    }

    pub fn set(&self, now: UnixTimeMs) {
        self.now_ms.store(now.0, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(self.now_ms.load(Ordering::SeqCst))
    }
}

// ============================================================================
// Identifiers
// ============================================================================

/// Job reference number as printed on the delivery order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReferenceId(String);

impl ReferenceId {
    pub const MIN_LENGTH: usize = 3;
    pub const MAX_LENGTH: usize = 50;

    pub fn new(id: impl Into<String>) -> Result<Self, ModelError> {
        let id = id.into().trim().to_string();
        if id.len() < Self::MIN_LENGTH {
            return Err(ModelError::InvalidId(format!(
                "reference must be at least {} characters",
                Self::MIN_LENGTH
            )));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(ModelError::InvalidId(format!(
                "reference exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ModelError::InvalidId(
                "reference contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Opaque server-assigned identifier (stop rows, driver accounts).
fn validate_opaque(kind: &str, id: &str) -> Result<(), ModelError> {
    const MAX_LENGTH: usize = 128;
    if id.is_empty() {
        return Err(ModelError::InvalidId(format!("{kind} cannot be empty")));
    }
    if id.len() > MAX_LENGTH {
        return Err(ModelError::InvalidId(format!(
            "{kind} exceeds {MAX_LENGTH} characters"
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(ModelError::InvalidId(format!(
            "{kind} contains invalid control characters"
        )));
    }
    Ok(())
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Result<Self, ModelError> {
                let id = id.into().trim().to_string();
                validate_opaque($label, &id)?;
                Ok(Self(id))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ModelError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id!(
    /// Identifier of one stop row within a job.
    StopId,
    "stop id"
);
opaque_id!(DriverId, "driver id");
opaque_id!(TripId, "trip id");

impl TryFrom<String> for ReferenceId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ReferenceId> for String {
    fn from(value: ReferenceId) -> Self {
        value.0
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Locally generated identifier of a queued action.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(String);

impl ActionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Input rules
// ============================================================================

pub fn validate_odometer(odometer: u32) -> Result<u32, ModelError> {
    if odometer > MAX_ODOMETER {
        return Err(ModelError::Validation(format!(
            "odometer must be between 0 and {MAX_ODOMETER}, got {odometer}"
        )));
    }
    Ok(odometer)
}

pub fn validate_alcohol_value(value: f64) -> Result<f64, ModelError> {
    if !value.is_finite() || !(MIN_ALCOHOL_VALUE..=MAX_ALCOHOL_VALUE).contains(&value) {
        return Err(ModelError::Validation(format!(
            "alcohol value must be between {MIN_ALCOHOL_VALUE} and {MAX_ALCOHOL_VALUE}, got {value}"
        )));
    }
    Ok(value)
}

// ============================================================================
// Stops and job references
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopStatus {
    Pending,
    CheckedIn,
    Fueled,
    Unloaded,
    CheckedOut,
}

impl StopStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StopStatus::Pending => "pending",
            StopStatus::CheckedIn => "checked_in",
            StopStatus::Fueled => "fueled",
            StopStatus::Unloaded => "unloaded",
            StopStatus::CheckedOut => "checked_out",
        }
    }

    /// Checked in and not yet checked out.
    pub fn is_on_site(self) -> bool {
        matches!(
            self,
            StopStatus::CheckedIn | StopStatus::Fueled | StopStatus::Unloaded
        )
    }
}

impl fmt::Display for StopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Driver action on a stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitionKind {
    CheckIn,
    Fuel,
    Unload,
    CheckOut,
}

impl TransitionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionKind::CheckIn => "checkin",
            TransitionKind::Fuel => "fuel",
            TransitionKind::Unload => "unload",
            TransitionKind::CheckOut => "checkout",
        }
    }

    pub fn target_status(self) -> StopStatus {
        match self {
            TransitionKind::CheckIn => StopStatus::CheckedIn,
            TransitionKind::Fuel => StopStatus::Fueled,
            TransitionKind::Unload => StopStatus::Unloaded,
            TransitionKind::CheckOut => StopStatus::CheckedOut,
        }
    }

    /// Whether a stop currently in `from` may take this transition.
    pub fn is_legal_from(self, from: StopStatus) -> bool {
        match self {
            TransitionKind::CheckIn => from == StopStatus::Pending,
            TransitionKind::Fuel | TransitionKind::Unload | TransitionKind::CheckOut => {
                from.is_on_site()
            }
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a stop is, and how close a driver must be to act on it.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub point: GeoPoint,
    /// Overrides the configured default geofence radius.
    pub radius_m: Option<f64>,
}

/// Timestamped record of one stop event as observed on the device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StopEvent {
    pub at: UnixTimeMs,
    pub lat: f64,
    pub lng: f64,
    pub odometer: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: StopId,
    pub reference: ReferenceId,
    pub sequence: u32,
    pub is_origin: bool,
    /// `None` when location master data has no coordinates for this stop.
    pub destination: Option<Destination>,
    pub status: StopStatus,
    pub check_in: Option<StopEvent>,
    pub check_out: Option<StopEvent>,
    pub fuel: Option<StopEvent>,
    pub unload: Option<StopEvent>,
}

impl Stop {
    pub fn new(
        id: StopId,
        reference: ReferenceId,
        sequence: u32,
        is_origin: bool,
        destination: Option<Destination>,
    ) -> Self {
        Self {
            id,
            reference,
            sequence,
            is_origin,
            destination,
            status: StopStatus::Pending,
            check_in: None,
            check_out: None,
            fuel: None,
            unload: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobReference {
    pub reference: ReferenceId,
    pub driver_names: BTreeSet<String>,
    pub screened_drivers: BTreeSet<String>,
    pub closed: bool,
    pub trip_ended: bool,
}

impl JobReference {
    pub fn new(reference: ReferenceId, driver_names: impl IntoIterator<Item = String>) -> Self {
        Self {
            reference,
            driver_names: driver_names.into_iter().collect(),
            screened_drivers: BTreeSet::new(),
            closed: false,
            trip_ended: false,
        }
    }

    pub fn has_screening(&self) -> bool {
        !self.screened_drivers.is_empty()
    }
}

// ============================================================================
// Tracking
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackingMode {
    #[default]
    Normal,
    Live,
}

impl TrackingMode {
    pub fn from_live_flag(live: bool) -> Self {
        if live {
            TrackingMode::Live
        } else {
            TrackingMode::Normal
        }
    }
}
