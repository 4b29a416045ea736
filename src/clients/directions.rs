use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;
use tracing::warn;

use super::ServiceError;
use crate::geo::polyline;
use crate::models::position::Coordinate;
use crate::models::route::{Route, RouteStep};

/// Client for the directions service. Any failure degrades to a
/// straight-line fallback route instead of surfacing an error.
pub struct DirectionsClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    fallback_pace_min_per_km: f64,
}

impl DirectionsClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        timeout: Duration,
        fallback_pace_min_per_km: f64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build directions http client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            fallback_pace_min_per_km,
        }
    }

    /// Fetches a drivable route through the given waypoints. On any
    /// failure the result is a synthetic straight segment between the
    /// endpoints, marked `is_fallback`.
    pub async fn route(
        &self,
        origin: &Coordinate,
        destination: &Coordinate,
        waypoints: &[Coordinate],
    ) -> Route {
        match self.fetch_route(origin, destination, waypoints).await {
            Ok(route) => route,
            Err(err) => {
                warn!(error = %err, "directions lookup failed, using straight-line fallback");
                Route::fallback(*origin, *destination, self.fallback_pace_min_per_km)
            }
        }
    }

    async fn fetch_route(
        &self,
        origin: &Coordinate,
        destination: &Coordinate,
        waypoints: &[Coordinate],
    ) -> Result<Route, ServiceError> {
        let mut url = Url::parse(&format!("{}/maps/api/directions/json", self.base_url))
            .map_err(|err| ServiceError::Malformed {
                service: "directions",
                detail: format!("bad endpoint url: {err}"),
            })?;

        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("origin", &latlng_param(origin));
            pairs.append_pair("destination", &latlng_param(destination));
            if !waypoints.is_empty() {
                let joined = waypoints
                    .iter()
                    .map(latlng_param)
                    .collect::<Vec<_>>()
                    .join("|");
                pairs.append_pair("waypoints", &joined);
            }
            pairs.append_pair("mode", "driving");
            pairs.append_pair("key", &self.api_key);
        }

        let response = self.client.get(url).send().await.map_err(ServiceError::Http)?;
        let parsed: DirectionsResponse = response.json().await.map_err(ServiceError::Json)?;
        parse_directions_response(parsed, *origin, *destination)
    }
}

fn latlng_param(point: &Coordinate) -> String {
    format!("{},{}", point.latitude, point.longitude)
}

/// Drops `<...>` tags from the instruction markup the service returns.
fn strip_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

#[derive(Deserialize)]
pub(super) struct DirectionsResponse {
    pub(super) status: String,
    #[serde(default)]
    pub(super) routes: Vec<WireRoute>,
}

#[derive(Deserialize)]
pub(super) struct WireRoute {
    pub(super) overview_polyline: WirePolyline,
    #[serde(default)]
    pub(super) legs: Vec<WireLeg>,
}

#[derive(Deserialize)]
pub(super) struct WirePolyline {
    pub(super) points: String,
}

#[derive(Deserialize)]
pub(super) struct WireLeg {
    pub(super) distance: WireQuantity,
    pub(super) duration: WireQuantity,
    #[serde(default)]
    pub(super) steps: Vec<WireStep>,
}

#[derive(Deserialize)]
pub(super) struct WireQuantity {
    pub(super) text: String,
    pub(super) value: f64,
}

#[derive(Deserialize)]
pub(super) struct WireStep {
    #[serde(default)]
    pub(super) html_instructions: String,
    pub(super) distance: WireQuantity,
    pub(super) duration: WireQuantity,
}

pub(super) fn parse_directions_response(
    resp: DirectionsResponse,
    origin: Coordinate,
    destination: Coordinate,
) -> Result<Route, ServiceError> {
    if resp.status != "OK" {
        return Err(ServiceError::Api {
            service: "directions",
            status: resp.status,
        });
    }

    let route = resp.routes.into_iter().next().ok_or(ServiceError::Malformed {
        service: "directions",
        detail: "status OK with no routes".to_string(),
    })?;

    let coordinates =
        polyline::decode(&route.overview_polyline.points).map_err(|err| ServiceError::Malformed {
            service: "directions",
            detail: format!("overview polyline: {err}"),
        })?;
    if coordinates.is_empty() {
        return Err(ServiceError::Malformed {
            service: "directions",
            detail: "overview polyline decoded to an empty path".to_string(),
        });
    }

    let leg = route.legs.into_iter().next().ok_or(ServiceError::Malformed {
        service: "directions",
        detail: "route without legs".to_string(),
    })?;

    let steps = leg
        .steps
        .into_iter()
        .map(|step| RouteStep {
            instruction: strip_html(&step.html_instructions),
            distance_text: step.distance.text,
            duration_text: step.duration.text,
        })
        .collect();

    Ok(Route {
        origin,
        destination,
        coordinates,
        distance_m: leg.distance.value,
        duration_s: leg.duration.value,
        distance_text: leg.distance.text,
        duration_text: leg.duration.text,
        steps,
        is_fallback: false,
    })
}
