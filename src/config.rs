use std::env;
use std::time::Duration;

use uuid::Uuid;

use crate::error::EngineError;
use crate::models::position::Coordinate;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub log_level: String,
    pub courier_id: Uuid,
    pub backend_base_url: String,
    pub backend_auth_token: Option<String>,
    pub maps_base_url: String,
    pub maps_api_key: String,
    /// Per-request timeout applied to every outbound HTTP client.
    pub http_timeout: Duration,
    /// Trailing-edge throttle window for backend position sync.
    pub sync_window: Duration,
    /// Cadence of the offer poll loop while online.
    pub poll_interval: Duration,
    /// Bound on single-shot position fixes.
    pub position_timeout: Duration,
    /// How old a cached fix may be before a fresh one is requested.
    pub position_max_age: Duration,
    /// Cadence requested from the device watcher.
    pub tracking_min_interval: Duration,
    pub tracking_min_distance_m: f64,
    /// Answer for failed geocode lookups. Defaults to central Maputo.
    pub fallback_coordinate: Coordinate,
    /// Pace assumed for straight-line fallback routes, minutes per km.
    pub fallback_pace_min_per_km: f64,
    /// Off-route deviation that triggers a replacement route.
    pub reroute_threshold_km: f64,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, EngineError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            courier_id: parse_or_default("COURIER_ID", Uuid::new_v4())?,
            backend_base_url: env::var("BACKEND_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8000/api".to_string()),
            backend_auth_token: env::var("BACKEND_AUTH_TOKEN").ok(),
            maps_base_url: env::var("MAPS_BASE_URL")
                .unwrap_or_else(|_| "https://maps.googleapis.com".to_string()),
            maps_api_key: env::var("MAPS_API_KEY").unwrap_or_default(),
            http_timeout: Duration::from_secs(parse_or_default("HTTP_TIMEOUT_SECS", 10)?),
            sync_window: Duration::from_secs(parse_or_default("SYNC_WINDOW_SECS", 15)?),
            poll_interval: Duration::from_secs(parse_or_default("OFFER_POLL_INTERVAL_SECS", 30)?),
            position_timeout: Duration::from_secs(parse_or_default("POSITION_TIMEOUT_SECS", 10)?),
            position_max_age: Duration::from_secs(parse_or_default("POSITION_MAX_AGE_SECS", 30)?),
            tracking_min_interval: Duration::from_secs(parse_or_default(
                "TRACKING_MIN_INTERVAL_SECS",
                10,
            )?),
            tracking_min_distance_m: parse_or_default("TRACKING_MIN_DISTANCE_M", 50.0)?,
            fallback_coordinate: Coordinate::new(
                parse_or_default("FALLBACK_LATITUDE", -25.9655)?,
                parse_or_default("FALLBACK_LONGITUDE", 32.5832)?,
            ),
            fallback_pace_min_per_km: parse_or_default("FALLBACK_PACE_MIN_PER_KM", 2.5)?,
            reroute_threshold_km: parse_or_default("REROUTE_THRESHOLD_KM", 0.1)?,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, EngineError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| EngineError::Config(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
