use serde::{Deserialize, Serialize};

use crate::geo::{self, haversine_km};
use crate::models::position::Coordinate;

/// A single maneuver along a route, with human-readable texts taken
/// from the directions service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStep {
    pub instruction: String,
    pub distance_text: String,
    pub duration_text: String,
}

/// A drivable path between two points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub origin: Coordinate,
    pub destination: Coordinate,
    /// Decoded path geometry, ordered origin to destination. Never empty.
    pub coordinates: Vec<Coordinate>,
    pub distance_m: f64,
    pub duration_s: f64,
    pub distance_text: String,
    pub duration_text: String,
    pub steps: Vec<RouteStep>,
    /// Set when the directions service was unavailable and the route is
    /// a synthetic straight line between the endpoints.
    pub is_fallback: bool,
}

impl Route {
    /// Straight-line stand-in used when no directions service answer is
    /// available. Distance is the great-circle distance and duration is
    /// estimated from a fixed pace.
    pub fn fallback(origin: Coordinate, destination: Coordinate, pace_min_per_km: f64) -> Self {
        let distance_km = haversine_km(&origin, &destination);
        let distance_m = distance_km * 1000.0;
        let duration_s = distance_km * pace_min_per_km * 60.0;
        Self {
            origin,
            destination,
            coordinates: vec![origin, destination],
            distance_m,
            duration_s,
            distance_text: geo::format_distance_m(distance_m),
            duration_text: geo::format_duration_s(duration_s),
            steps: Vec::new(),
            is_fallback: true,
        }
    }
}

/// Where along a route the courier currently is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RouteProgress {
    /// Index into `Route::coordinates` of the vertex nearest the courier.
    pub nearest_index: usize,
    /// Fraction of the path vertices already passed, in [0, 1].
    pub fraction_complete: f64,
    /// Path distance from the nearest vertex to the destination.
    pub remaining_km: f64,
    /// Straight-line distance from the courier to the nearest vertex.
    pub deviation_km: f64,
}
