use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::position::Coordinate;

/// Radius values the courier may choose, in kilometers.
pub const RADIUS_RANGE_KM: RangeInclusive<f64> = 1.0..=15.0;
pub const DEFAULT_RADIUS_KM: f64 = 5.0;

/// A delivery job the courier can accept.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOffer {
    pub id: Uuid,
    pub pickup: Coordinate,
    pub dropoff: Coordinate,
    pub pickup_address: String,
    pub dropoff_address: String,
    /// Payout in the smallest currency unit.
    pub payout_cents: i64,
    /// Distance from the courier position at the time the offer was
    /// merged. Recomputed on every merge, never persisted.
    pub distance_from_courier_km: f64,
}

/// Lifecycle states a delivery moves through after acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Accepted,
    PickedUp,
    OnTheWay,
    Delivered,
    Cancelled,
}

/// Courier-tunable discovery settings. Mutated only through the offer
/// board so radius bounds and the online transitions hold everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProximitySettings {
    pub radius_km: f64,
    pub online: bool,
}

impl ProximitySettings {
    /// Rebuilds settings from persisted values, clamping an out-of-range
    /// radius instead of failing startup.
    pub fn restore(radius_km: f64, online: bool) -> Self {
        let radius_km = if radius_km.is_finite() {
            radius_km.clamp(*RADIUS_RANGE_KM.start(), *RADIUS_RANGE_KM.end())
        } else {
            DEFAULT_RADIUS_KM
        };
        Self { radius_km, online }
    }
}

impl Default for ProximitySettings {
    fn default() -> Self {
        Self {
            radius_km: DEFAULT_RADIUS_KM,
            online: false,
        }
    }
}
