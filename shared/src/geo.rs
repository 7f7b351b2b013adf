use serde::{Deserialize, Serialize};

use crate::model::UnixTimeMs;
use crate::EARTH_RADIUS_M;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Great-circle distance in meters on a spherical earth.
#[must_use]
pub fn haversine_distance(p1: GeoPoint, p2: GeoPoint) -> f64 {
    const EPSILON: f64 = 1e-10;

    if (p1.lat - p2.lat).abs() < EPSILON && (p1.lng - p2.lng).abs() < EPSILON {
        return 0.0;
    }

    let lat1_rad = p1.lat.to_radians();
    let lat2_rad = p2.lat.to_radians();
    let delta_lat = (p2.lat - p1.lat).to_radians();
    let delta_lng = (p2.lng - p1.lng).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lng / 2.0).sin().powi(2);

    let a = a.clamp(0.0, 1.0);

    let c = 2.0 * a.sqrt().asin();

    let result = EARTH_RADIUS_M * c;

    if result.is_finite() {
        result
    } else {
        f64::MAX
    }
}

/// Geographic rectangle outside of which a fix is treated as garbage.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    /// Service area of the fleet: mainland Thailand.
    pub const SERVICE_AREA: Self = Self {
        min_lat: 5.0,
        max_lat: 21.0,
        min_lng: 97.0,
        max_lng: 106.0,
    };

    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lng..=self.max_lng).contains(&lng)
    }

    pub fn is_well_formed(&self) -> bool {
        [self.min_lat, self.max_lat, self.min_lng, self.max_lng]
            .iter()
            .all(|v| v.is_finite())
            && self.min_lat < self.max_lat
            && self.min_lng < self.max_lng
            && (-90.0..=90.0).contains(&self.min_lat)
            && (-90.0..=90.0).contains(&self.max_lat)
            && (-180.0..=180.0).contains(&self.min_lng)
            && (-180.0..=180.0).contains(&self.max_lng)
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::SERVICE_AREA
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalQuality {
    Excellent,
    Good,
    Weak,
    Poor,
    Unknown,
}

impl SignalQuality {
    pub const EXCELLENT_M: f64 = 20.0;
    pub const GOOD_M: f64 = 50.0;
    pub const WEAK_M: f64 = 100.0;

    pub fn from_accuracy(accuracy_m: Option<f64>) -> Self {
        match accuracy_m {
            Some(a) if !a.is_finite() || a < 0.0 => SignalQuality::Unknown,
            Some(a) if a <= Self::EXCELLENT_M => SignalQuality::Excellent,
            Some(a) if a <= Self::GOOD_M => SignalQuality::Good,
            Some(a) if a <= Self::WEAK_M => SignalQuality::Weak,
            Some(_) => SignalQuality::Poor,
            None => SignalQuality::Unknown,
        }
    }
}

/// One fix from the location sensor.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub lat: f64,
    pub lng: f64,
    pub accuracy: Option<f64>,
    pub timestamp: UnixTimeMs,
}

impl PositionSample {
    pub fn new(lat: f64, lng: f64, timestamp: UnixTimeMs) -> Self {
        Self {
            lat,
            lng,
            accuracy: None,
            timestamp,
        }
    }

    pub fn with_accuracy(mut self, accuracy_m: f64) -> Self {
        self.accuracy = Some(accuracy_m);
        self
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }

    /// Finite, non-zero on both axes and inside `bounds`.
    pub fn is_valid_in(&self, bounds: &BoundingBox) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && self.lat != 0.0
            && self.lng != 0.0
            && bounds.contains(self.lat, self.lng)
    }

    pub fn signal_quality(&self) -> SignalQuality {
        SignalQuality::from_accuracy(self.accuracy)
    }
}
