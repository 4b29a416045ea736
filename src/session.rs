use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clients::backend::AcceptedJob;
use crate::clients::geocoding::ResolvedAddress;
use crate::clients::{BackendClient, DirectionsClient, GeocodingClient};
use crate::config::EngineConfig;
use crate::engine::offers::OfferBoard;
use crate::engine::permission::{
    PermissionDecision, PermissionGate, PermissionPlatform, PermissionState,
};
use crate::engine::progress::{is_off_route, route_progress};
use crate::engine::provider::{PositionProvider, PositionSource, TrackingHandle, TrackingOptions};
use crate::engine::sync::{LocationSync, SyncPhase};
use crate::error::EngineError;
use crate::models::offer::{DeliveryStatus, JobOffer, ProximitySettings};
use crate::models::position::{Coordinate, PositionSample};
use crate::models::route::{Route, RouteProgress};
use crate::observability::metrics::Metrics;

/// One courier's engine: permission gate, position acquisition, backend
/// sync, offer visibility, and the active navigation leg. Construct one
/// per session; state is never shared across sessions.
pub struct CourierSession {
    config: EngineConfig,
    gate: Arc<PermissionGate>,
    provider: Arc<PositionProvider>,
    geocoding: GeocodingClient,
    directions: Arc<DirectionsClient>,
    backend: Arc<BackendClient>,
    sync: LocationSync,
    board: OfferBoard,
    metrics: Arc<Metrics>,
    position_tx: Arc<watch::Sender<Option<PositionSample>>>,
    route_tx: Arc<watch::Sender<Option<Route>>>,
    progress_tx: Arc<watch::Sender<Option<RouteProgress>>>,
    reroute_tx: mpsc::Sender<Coordinate>,
    tracking: Mutex<Option<TrackingHandle>>,
}

impl CourierSession {
    pub fn new(
        config: EngineConfig,
        settings: ProximitySettings,
        platform: Arc<dyn PermissionPlatform>,
        source: Arc<dyn PositionSource>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let gate = Arc::new(PermissionGate::new(platform));
        let provider = Arc::new(PositionProvider::new(
            gate.clone(),
            source,
            metrics.clone(),
        ));

        let geocoding = GeocodingClient::new(
            &config.maps_base_url,
            &config.maps_api_key,
            config.http_timeout,
            config.fallback_coordinate,
        );
        let directions = Arc::new(DirectionsClient::new(
            &config.maps_base_url,
            &config.maps_api_key,
            config.http_timeout,
            config.fallback_pace_min_per_km,
        ));
        let backend = Arc::new(BackendClient::new(
            &config.backend_base_url,
            config.backend_auth_token.clone(),
            config.courier_id,
            config.http_timeout,
        ));

        let (position_tx, position_rx) = watch::channel(None);
        let position_tx = Arc::new(position_tx);
        let route_tx = Arc::new(watch::channel(None).0);
        let progress_tx = Arc::new(watch::channel(None).0);
        let (reroute_tx, reroute_rx) = mpsc::channel(1);

        let sync = LocationSync::spawn(backend.clone(), config.sync_window, metrics.clone());
        let board = OfferBoard::spawn(
            backend.clone(),
            position_rx,
            settings,
            config.poll_interval,
            metrics.clone(),
        );

        tokio::spawn(run_reroute_worker(
            directions.clone(),
            route_tx.clone(),
            metrics.clone(),
            reroute_rx,
        ));

        Self {
            config,
            gate,
            provider,
            geocoding,
            directions,
            backend,
            sync,
            board,
            metrics,
            position_tx,
            route_tx,
            progress_tx,
            reroute_tx,
            tracking: Mutex::new(None),
        }
    }

    /// Requests the location permission, starts continuous tracking, and
    /// turns offer visibility on. Fails without side effects when the
    /// permission is denied.
    pub async fn go_online(&self) -> Result<(), EngineError> {
        if self.gate.request().await == PermissionDecision::Denied {
            return Err(EngineError::PermissionDenied);
        }

        let options = TrackingOptions {
            min_interval: self.config.tracking_min_interval,
            min_distance_m: self.config.tracking_min_distance_m,
        };
        let handle = self
            .provider
            .start_tracking(options, self.sample_fanout())
            .await?;
        *self
            .tracking
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        self.board.set_online(true).await;
        info!("session online");
        Ok(())
    }

    /// Clears offer visibility and releases the position watch. The last
    /// known position stays available to callers.
    pub async fn go_offline(&self) {
        self.board.set_online(false).await;
        if let Some(handle) = self
            .tracking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.stop();
        }
        info!("session offline");
    }

    /// Fan-out applied to every tracking sample, on the delivery task:
    /// publish, notify the sync throttle, and advance route progress.
    fn sample_fanout(&self) -> impl FnMut(PositionSample) + Send + 'static {
        let position_tx = self.position_tx.clone();
        let progress_tx = self.progress_tx.clone();
        let route_rx = self.route_tx.subscribe();
        let reroute_tx = self.reroute_tx.clone();
        let sync = self.sync.clone();
        let threshold_km = self.config.reroute_threshold_km;

        move |sample: PositionSample| {
            position_tx.send_replace(Some(sample));
            sync.notify(sample);

            let route = route_rx.borrow();
            match route.as_ref() {
                Some(route) => {
                    if let Some(progress) = route_progress(&sample.coordinate, &route.coordinates)
                    {
                        if is_off_route(&progress, threshold_km) {
                            // Worker busy means a reroute is already
                            // underway; dropping the request is fine.
                            let _ = reroute_tx.try_send(sample.coordinate);
                        }
                        progress_tx.send_replace(Some(progress));
                    }
                }
                None => {
                    if progress_tx.borrow().is_some() {
                        progress_tx.send_replace(None);
                    }
                }
            }
        }
    }

    /// Builds the active leg from the current position to `destination`.
    /// The result may be a straight-line fallback when the directions
    /// service is unavailable.
    pub async fn start_leg(&self, destination: Coordinate) -> Result<Route, EngineError> {
        let origin = match *self.position_tx.borrow() {
            Some(sample) => sample.coordinate,
            None => {
                self.provider
                    .current_position(self.config.position_timeout, self.config.position_max_age)
                    .await?
                    .coordinate
            }
        };

        let route = self.directions.route(&origin, &destination, &[]).await;
        if route.is_fallback {
            self.metrics.route_fallbacks_total.inc();
        }
        self.progress_tx.send_replace(None);
        self.route_tx.send_replace(Some(route.clone()));
        info!(
            is_fallback = route.is_fallback,
            distance_m = route.distance_m,
            "leg started"
        );
        Ok(route)
    }

    /// Drops the active leg and its progress.
    pub fn clear_leg(&self) {
        self.route_tx.send_replace(None);
        self.progress_tx.send_replace(None);
    }

    /// Accepts an offer through the board; on success the returned
    /// coordinates are ready for `start_leg`.
    pub async fn accept_offer(&self, offer_id: Uuid) -> Result<AcceptedJob, EngineError> {
        self.board.accept(offer_id).await
    }

    /// Reports a delivery transition with the latest known position.
    /// Terminal transitions end the active leg and refresh offers.
    pub async fn report_delivery(
        &self,
        delivery_id: Uuid,
        status: DeliveryStatus,
    ) -> Result<(), EngineError> {
        let position = (*self.position_tx.borrow()).map(|sample| sample.coordinate);
        self.backend
            .report_delivery_status(delivery_id, status, position.as_ref())
            .await?;

        if matches!(status, DeliveryStatus::Delivered | DeliveryStatus::Cancelled) {
            self.clear_leg();
            self.board.refresh();
        }
        Ok(())
    }

    /// Address lookup with the fallback-coordinate degradation counted.
    pub async fn resolve_address(&self, address: &str) -> ResolvedAddress {
        let resolved = self.geocoding.geocode(address).await;
        if resolved.is_fallback {
            self.metrics.geocode_fallbacks_total.inc();
        }
        resolved
    }

    pub async fn address_of(&self, coordinate: &Coordinate) -> Option<String> {
        self.geocoding.reverse_geocode(coordinate).await
    }

    pub async fn current_position(&self) -> Result<PositionSample, EngineError> {
        self.provider
            .current_position(self.config.position_timeout, self.config.position_max_age)
            .await
    }

    pub async fn set_radius(&self, radius_km: f64) -> Result<(), EngineError> {
        self.board.set_radius(radius_km).await
    }

    pub async fn settings(&self) -> ProximitySettings {
        self.board.settings().await
    }

    pub fn permission_state(&self) -> PermissionState {
        self.gate.state()
    }

    pub fn offers(&self) -> Vec<JobOffer> {
        self.board.snapshot()
    }

    pub fn offers_watch(&self) -> watch::Receiver<Vec<JobOffer>> {
        self.board.offers_watch()
    }

    pub fn offers_stream(&self) -> WatchStream<Vec<JobOffer>> {
        WatchStream::new(self.board.offers_watch())
    }

    pub fn position_watch(&self) -> watch::Receiver<Option<PositionSample>> {
        self.position_tx.subscribe()
    }

    pub fn progress_watch(&self) -> watch::Receiver<Option<RouteProgress>> {
        self.progress_tx.subscribe()
    }

    pub fn progress_stream(&self) -> WatchStream<Option<RouteProgress>> {
        WatchStream::new(self.progress_tx.subscribe())
    }

    pub fn active_route(&self) -> Option<Route> {
        self.route_tx.borrow().clone()
    }

    pub fn sync_phase(&self) -> SyncPhase {
        self.sync.phase()
    }

    pub fn sync_phase_watch(&self) -> watch::Receiver<SyncPhase> {
        self.sync.phase_watch()
    }

    pub fn last_synced(&self) -> Option<Coordinate> {
        self.sync.last_synced()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl Drop for CourierSession {
    fn drop(&mut self) {
        if let Some(handle) = self
            .tracking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.stop();
        }
    }
}

/// Fetches replacement routes off the sample path. The fresh route only
/// replaces the active one when the leg destination is unchanged.
async fn run_reroute_worker(
    directions: Arc<DirectionsClient>,
    route_tx: Arc<watch::Sender<Option<Route>>>,
    metrics: Arc<Metrics>,
    mut requests_rx: mpsc::Receiver<Coordinate>,
) {
    while let Some(position) = requests_rx.recv().await {
        let destination = route_tx.borrow().as_ref().map(|route| route.destination);
        let Some(destination) = destination else {
            continue;
        };

        metrics.reroutes_total.inc();
        let replacement = directions.route(&position, &destination, &[]).await;
        if replacement.is_fallback {
            metrics.route_fallbacks_total.inc();
        }

        let swapped = route_tx.send_if_modified(|current| match current {
            Some(active) if active.destination == destination => {
                *current = Some(replacement);
                true
            }
            _ => false,
        });
        debug!(swapped, "replacement route fetched");
    }
}
