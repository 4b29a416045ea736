use thiserror::Error;

use crate::clients::ServiceError;
use crate::models::offer::RADIUS_RANGE_KM;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("no position fix within {timeout_ms} ms")]
    PositionTimeout { timeout_ms: u64 },

    #[error(
        "radius {requested_km} km outside allowed range {}..={} km",
        RADIUS_RANGE_KM.start(),
        RADIUS_RANGE_KM.end()
    )]
    RadiusOutOfBounds { requested_km: f64 },

    #[error("position source failed: {0}")]
    Device(String),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// True for failures worth retrying on the next cycle, as opposed to
    /// ones that need courier action first.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::PositionTimeout { .. } | EngineError::Service(_) => true,
            EngineError::PermissionDenied
            | EngineError::RadiusOutOfBounds { .. }
            | EngineError::Device(_)
            | EngineError::Config(_) => false,
        }
    }
}
