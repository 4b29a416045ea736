use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A WGS-84 point. Latitude in degrees north, longitude in degrees east.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Latitude must stay in [-90, 90] and longitude in [-180, 180].
    /// External services occasionally hand back garbage, so points read
    /// off the wire are checked before they reach the engine.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// One reading from the device location sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub coordinate: Coordinate,
    /// Horizontal accuracy radius in meters, as reported by the sensor.
    pub accuracy_m: f64,
    /// Ground speed in meters per second, when the sensor provides it.
    pub speed_mps: Option<f64>,
    /// Course over ground in degrees clockwise from north.
    pub heading_degrees: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

impl PositionSample {
    /// True when the sample was recorded within `max_age` of now.
    pub fn is_within_age(&self, max_age: std::time::Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.recorded_at);
        match chrono::Duration::from_std(max_age) {
            Ok(limit) => age <= limit,
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinate_bounds() {
        assert!(Coordinate::new(-25.9655, 32.5832).is_valid());
        assert!(Coordinate::new(90.0, 180.0).is_valid());
        assert!(!Coordinate::new(90.01, 0.0).is_valid());
        assert!(!Coordinate::new(0.0, -180.5).is_valid());
        assert!(!Coordinate::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn sample_age_window() {
        let fresh = PositionSample {
            coordinate: Coordinate::new(0.0, 0.0),
            accuracy_m: 10.0,
            speed_mps: None,
            heading_degrees: None,
            recorded_at: Utc::now(),
        };
        assert!(fresh.is_within_age(std::time::Duration::from_secs(60)));

        let stale = PositionSample {
            recorded_at: Utc::now() - chrono::Duration::seconds(120),
            ..fresh
        };
        assert!(!stale.is_within_age(std::time::Duration::from_secs(60)));
    }
}
