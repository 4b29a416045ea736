pub mod backend;
pub mod directions;
pub mod geocoding;

pub use backend::BackendClient;
pub use directions::DirectionsClient;
pub use geocoding::GeocodingClient;

use thiserror::Error;

/// Failure of a call to an external service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("request failed: {0}")]
    Http(reqwest::Error),

    #[error("response decode failed: {0}")]
    Json(reqwest::Error),

    /// The service answered but reported a non-OK application status
    /// (ZERO_RESULTS, OVER_QUERY_LIMIT, REQUEST_DENIED, ...).
    #[error("{service} answered with status {status}")]
    Api { service: &'static str, status: String },

    /// The service answered with a shape the parser cannot use.
    #[error("{service} response malformed: {detail}")]
    Malformed { service: &'static str, detail: String },

    /// Backend envelope carried an error status or the HTTP status was
    /// not a success.
    #[error("backend error {status_code}: {message}")]
    Backend { status_code: u16, message: String },
}
