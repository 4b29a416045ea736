use std::time::Duration;

use reqwest::{RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ServiceError;
use crate::models::offer::DeliveryStatus;
use crate::models::position::Coordinate;

/// Client for the courier backend. Every response uses the JSON
/// envelope `{status, message?, data}` with `status: "success"` on the
/// happy path.
pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    courier_id: Uuid,
}

/// An offer as the backend reports it. Distance from the courier is
/// derived locally after the fetch, so it is absent here.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OfferRecord {
    pub id: Uuid,
    pub pickup: Coordinate,
    pub dropoff: Coordinate,
    #[serde(default)]
    pub pickup_address: String,
    #[serde(default)]
    pub dropoff_address: String,
    #[serde(default)]
    pub payout_cents: i64,
}

/// Coordinates handed back when the backend confirms an acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct AcceptedJob {
    pub pickup: Coordinate,
    pub dropoff: Coordinate,
}

impl BackendClient {
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        courier_id: Uuid,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build backend http client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
            courier_id,
        }
    }

    /// Reports the courier's current position.
    pub async fn sync_position(&self, coordinate: &Coordinate) -> Result<(), ServiceError> {
        let url = self.endpoint("/courier/location")?;
        let body = LocationBody {
            courier_id: self.courier_id,
            latitude: coordinate.latitude,
            longitude: coordinate.longitude,
        };
        let response = self
            .authorized(self.client.post(url))
            .json(&body)
            .send()
            .await
            .map_err(ServiceError::Http)?;
        self.read_ack(response).await
    }

    /// Fetches offers around a position. The backend filters by radius;
    /// callers re-apply the predicate after deriving distances.
    pub async fn fetch_offers(
        &self,
        position: &Coordinate,
        radius_km: f64,
    ) -> Result<Vec<OfferRecord>, ServiceError> {
        let mut url = self.endpoint("/courier/offers")?;
        url.query_pairs_mut()
            .append_pair("latitude", &position.latitude.to_string())
            .append_pair("longitude", &position.longitude.to_string())
            .append_pair("radius_km", &radius_km.to_string());
        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .map_err(ServiceError::Http)?;
        self.read_data(response).await
    }

    /// Accepts an offer, attaching the courier position when known.
    pub async fn accept_offer(
        &self,
        offer_id: Uuid,
        position: Option<&Coordinate>,
    ) -> Result<AcceptedJob, ServiceError> {
        let url = self.endpoint(&format!("/courier/offers/{offer_id}/accept"))?;
        let response = self
            .authorized(self.client.post(url))
            .json(&OptionalPositionBody::from(position))
            .send()
            .await
            .map_err(ServiceError::Http)?;
        self.read_data(response).await
    }

    /// Reports a delivery lifecycle transition.
    pub async fn report_delivery_status(
        &self,
        delivery_id: Uuid,
        status: DeliveryStatus,
        position: Option<&Coordinate>,
    ) -> Result<(), ServiceError> {
        let url = self.endpoint(&format!("/courier/deliveries/{delivery_id}/status"))?;
        let body = StatusBody {
            status,
            position: OptionalPositionBody::from(position),
        };
        let response = self
            .authorized(self.client.patch(url))
            .json(&body)
            .send()
            .await
            .map_err(ServiceError::Http)?;
        self.read_ack(response).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, ServiceError> {
        Url::parse(&format!("{}{}", self.base_url, path)).map_err(|err| {
            ServiceError::Malformed {
                service: "backend",
                detail: format!("bad endpoint url: {err}"),
            }
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_data<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ServiceError> {
        let status_code = response.status();
        if !status_code.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ServiceError::Backend {
                status_code: status_code.as_u16(),
                message,
            });
        }
        let envelope: Envelope<T> = response.json().await.map_err(ServiceError::Json)?;
        unwrap_data(status_code.as_u16(), envelope)
    }

    async fn read_ack(&self, response: reqwest::Response) -> Result<(), ServiceError> {
        let status_code = response.status();
        if !status_code.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ServiceError::Backend {
                status_code: status_code.as_u16(),
                message,
            });
        }
        let envelope: Envelope<serde_json::Value> =
            response.json().await.map_err(ServiceError::Json)?;
        unwrap_ack(status_code.as_u16(), envelope)
    }
}

#[derive(Serialize)]
struct LocationBody {
    courier_id: Uuid,
    latitude: f64,
    longitude: f64,
}

#[derive(Serialize)]
struct OptionalPositionBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    longitude: Option<f64>,
}

impl From<Option<&Coordinate>> for OptionalPositionBody {
    fn from(position: Option<&Coordinate>) -> Self {
        Self {
            latitude: position.map(|p| p.latitude),
            longitude: position.map(|p| p.longitude),
        }
    }
}

#[derive(Serialize)]
struct StatusBody {
    status: DeliveryStatus,
    #[serde(flatten)]
    position: OptionalPositionBody,
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub(super) struct Envelope<T> {
    pub(super) status: String,
    #[serde(default)]
    pub(super) message: Option<String>,
    #[serde(default)]
    pub(super) data: Option<T>,
}

pub(super) fn unwrap_data<T>(status_code: u16, envelope: Envelope<T>) -> Result<T, ServiceError> {
    if envelope.status != "success" {
        return Err(ServiceError::Backend {
            status_code,
            message: envelope.message.unwrap_or(envelope.status),
        });
    }
    envelope.data.ok_or(ServiceError::Malformed {
        service: "backend",
        detail: "success envelope without data".to_string(),
    })
}

pub(super) fn unwrap_ack<T>(status_code: u16, envelope: Envelope<T>) -> Result<(), ServiceError> {
    if envelope.status != "success" {
        return Err(ServiceError::Backend {
            status_code,
            message: envelope.message.unwrap_or(envelope.status),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offers_deserialize_from_envelope() {
        let envelope: Envelope<Vec<OfferRecord>> = serde_json::from_value(serde_json::json!({
            "status": "success",
            "data": [{
                "id": "7bd7d0d4-2c5e-4f52-a8f5-0d8ff15b7a24",
                "pickup": { "latitude": -25.9655, "longitude": 32.5832 },
                "dropoff": { "latitude": -25.9425, "longitude": 32.5886 },
                "pickup_address": "Mercado Central",
                "payout_cents": 45000
            }]
        }))
        .unwrap();

        let offers = unwrap_data(200, envelope).unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].pickup_address, "Mercado Central");
        assert_eq!(offers[0].dropoff_address, "");
        assert_eq!(offers[0].payout_cents, 45000);
    }

    #[test]
    fn error_envelope_carries_message() {
        let envelope: Envelope<Vec<OfferRecord>> = serde_json::from_value(serde_json::json!({
            "status": "error",
            "message": "courier suspended"
        }))
        .unwrap();

        match unwrap_data(200, envelope) {
            Err(ServiceError::Backend {
                status_code,
                message,
            }) => {
                assert_eq!(status_code, 200);
                assert_eq!(message, "courier suspended");
            }
            other => panic!("expected backend error, got {other:?}"),
        }
    }

    #[test]
    fn success_without_data_is_malformed_for_data_calls() {
        let envelope: Envelope<AcceptedJob> =
            serde_json::from_value(serde_json::json!({ "status": "success" })).unwrap();
        assert!(matches!(
            unwrap_data(200, envelope),
            Err(ServiceError::Malformed { .. })
        ));
    }

    #[test]
    fn ack_accepts_success_without_data() {
        let envelope: Envelope<serde_json::Value> =
            serde_json::from_value(serde_json::json!({ "status": "success" })).unwrap();
        assert!(unwrap_ack(200, envelope).is_ok());
    }

    #[test]
    fn status_body_serializes_flat() {
        let body = StatusBody {
            status: DeliveryStatus::PickedUp,
            position: OptionalPositionBody::from(Some(&Coordinate::new(-25.9655, 32.5832))),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "status": "picked_up",
                "latitude": -25.9655,
                "longitude": 32.5832
            })
        );
    }

    #[test]
    fn absent_position_serializes_to_empty_body() {
        let value = serde_json::to_value(OptionalPositionBody::from(None)).unwrap();
        assert_eq!(value, serde_json::json!({}));
    }
}
