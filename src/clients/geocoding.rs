use std::time::{Duration, Instant};

use dashmap::DashMap;
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, warn};

use super::ServiceError;
use crate::models::position::Coordinate;

/// Successful lookups are reused for five minutes; the cache never grows
/// past 100 entries, evicting the oldest first.
const CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const CACHE_CAP: usize = 100;

/// An address resolved to a point. `is_fallback` marks lookups that
/// failed and were answered with the configured fallback coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAddress {
    pub coordinate: Coordinate,
    pub formatted_address: Option<String>,
    pub is_fallback: bool,
}

/// Client for the geocoding service. Lookup failures degrade to the
/// fallback coordinate instead of surfacing errors.
pub struct GeocodingClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    fallback: Coordinate,
    cache: DashMap<String, CachedLookup>,
}

#[derive(Clone)]
struct CachedLookup {
    resolved: ResolvedAddress,
    stored_at: Instant,
}

impl GeocodingClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration, fallback: Coordinate) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build geocoding http client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            fallback,
            cache: DashMap::new(),
        }
    }

    /// Resolves a street address to a coordinate. Any failure (transport,
    /// non-OK status, empty or invalid result) yields the fallback
    /// coordinate with `is_fallback` set.
    pub async fn geocode(&self, address: &str) -> ResolvedAddress {
        let key = format!("geocode:{}", address.trim().to_lowercase());
        if let Some(hit) = self.cache_get(&key) {
            return hit;
        }

        match self.fetch_geocode(address).await {
            Ok(resolved) => {
                self.cache_put(key, resolved.clone());
                resolved
            }
            Err(err) => {
                warn!(error = %err, address, "geocoding failed, using fallback coordinate");
                ResolvedAddress {
                    coordinate: self.fallback,
                    formatted_address: None,
                    is_fallback: true,
                }
            }
        }
    }

    /// Resolves a coordinate to a formatted address. Failures yield None.
    pub async fn reverse_geocode(&self, coordinate: &Coordinate) -> Option<String> {
        let key = format!(
            "reverse:{:.6},{:.6}",
            coordinate.latitude, coordinate.longitude
        );
        if let Some(hit) = self.cache_get(&key) {
            return hit.formatted_address;
        }

        match self.fetch_reverse(coordinate).await {
            Ok(resolved) => {
                let address = resolved.formatted_address.clone();
                self.cache_put(key, resolved);
                address
            }
            Err(err) => {
                warn!(error = %err, "reverse geocoding failed");
                None
            }
        }
    }

    async fn fetch_geocode(&self, address: &str) -> Result<ResolvedAddress, ServiceError> {
        let url = self.endpoint(&[("address", address)])?;
        let response = self.client.get(url).send().await.map_err(ServiceError::Http)?;
        let parsed: GeocodeResponse = response.json().await.map_err(ServiceError::Json)?;
        parse_geocode_response(parsed)
    }

    async fn fetch_reverse(&self, coordinate: &Coordinate) -> Result<ResolvedAddress, ServiceError> {
        let latlng = format!("{},{}", coordinate.latitude, coordinate.longitude);
        let url = self.endpoint(&[("latlng", latlng.as_str())])?;
        let response = self.client.get(url).send().await.map_err(ServiceError::Http)?;
        let parsed: GeocodeResponse = response.json().await.map_err(ServiceError::Json)?;
        parse_geocode_response(parsed)
    }

    fn endpoint(&self, params: &[(&str, &str)]) -> Result<Url, ServiceError> {
        let mut url = Url::parse(&format!("{}/maps/api/geocode/json", self.base_url)).map_err(
            |err| ServiceError::Malformed {
                service: "geocoding",
                detail: format!("bad endpoint url: {err}"),
            },
        )?;
        for (name, value) in params {
            url.query_pairs_mut().append_pair(name, value);
        }
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }

    fn cache_get(&self, key: &str) -> Option<ResolvedAddress> {
        let hit = self.cache.get(key)?;
        if hit.stored_at.elapsed() < CACHE_TTL {
            debug!(key, "geocode cache hit");
            Some(hit.resolved.clone())
        } else {
            drop(hit);
            self.cache.remove(key);
            None
        }
    }

    fn cache_put(&self, key: String, resolved: ResolvedAddress) {
        if self.cache.len() >= CACHE_CAP {
            let oldest = self
                .cache
                .iter()
                .min_by_key(|entry| entry.stored_at)
                .map(|entry| entry.key().clone());
            if let Some(oldest) = oldest {
                self.cache.remove(&oldest);
            }
        }
        self.cache.insert(
            key,
            CachedLookup {
                resolved,
                stored_at: Instant::now(),
            },
        );
    }
}

#[derive(Deserialize)]
pub(super) struct GeocodeResponse {
    pub(super) status: String,
    #[serde(default)]
    pub(super) results: Vec<GeocodeEntry>,
}

#[derive(Deserialize)]
pub(super) struct GeocodeEntry {
    pub(super) formatted_address: Option<String>,
    pub(super) geometry: Geometry,
}

#[derive(Deserialize)]
pub(super) struct Geometry {
    pub(super) location: WireLocation,
}

#[derive(Deserialize)]
pub(super) struct WireLocation {
    pub(super) lat: f64,
    pub(super) lng: f64,
}

pub(super) fn parse_geocode_response(
    resp: GeocodeResponse,
) -> Result<ResolvedAddress, ServiceError> {
    if resp.status != "OK" {
        return Err(ServiceError::Api {
            service: "geocoding",
            status: resp.status,
        });
    }

    let entry = resp
        .results
        .into_iter()
        .next()
        .ok_or(ServiceError::Malformed {
            service: "geocoding",
            detail: "status OK with empty result set".to_string(),
        })?;

    let coordinate = Coordinate::new(entry.geometry.location.lat, entry.geometry.location.lng);
    if !coordinate.is_valid() {
        return Err(ServiceError::Malformed {
            service: "geocoding",
            detail: format!(
                "coordinate out of range: {},{}",
                coordinate.latitude, coordinate.longitude
            ),
        });
    }

    Ok(ResolvedAddress {
        coordinate,
        formatted_address: entry.formatted_address,
        is_fallback: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: serde_json::Value) -> GeocodeResponse {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn parses_first_result() {
        let resp = response(serde_json::json!({
            "status": "OK",
            "results": [
                {
                    "formatted_address": "Av. 24 de Julho, Maputo",
                    "geometry": { "location": { "lat": -25.9655, "lng": 32.5832 } }
                },
                {
                    "formatted_address": "elsewhere",
                    "geometry": { "location": { "lat": 0.0, "lng": 0.0 } }
                }
            ]
        }));

        let resolved = parse_geocode_response(resp).unwrap();
        assert_eq!(resolved.coordinate, Coordinate::new(-25.9655, 32.5832));
        assert_eq!(
            resolved.formatted_address.as_deref(),
            Some("Av. 24 de Julho, Maputo")
        );
        assert!(!resolved.is_fallback);
    }

    #[test]
    fn non_ok_status_is_an_api_error() {
        for status in ["ZERO_RESULTS", "OVER_QUERY_LIMIT", "REQUEST_DENIED"] {
            let resp = response(serde_json::json!({ "status": status, "results": [] }));
            match parse_geocode_response(resp) {
                Err(ServiceError::Api { service, status: s }) => {
                    assert_eq!(service, "geocoding");
                    assert_eq!(s, status);
                }
                other => panic!("expected api error, got {other:?}"),
            }
        }
    }

    #[test]
    fn empty_results_with_ok_status_are_malformed() {
        let resp = response(serde_json::json!({ "status": "OK", "results": [] }));
        assert!(matches!(
            parse_geocode_response(resp),
            Err(ServiceError::Malformed { .. })
        ));
    }

    #[test]
    fn out_of_range_location_is_malformed() {
        let resp = response(serde_json::json!({
            "status": "OK",
            "results": [
                { "geometry": { "location": { "lat": 95.0, "lng": 10.0 } } }
            ]
        }));
        assert!(matches!(
            parse_geocode_response(resp),
            Err(ServiceError::Malformed { .. })
        ));
    }
}
