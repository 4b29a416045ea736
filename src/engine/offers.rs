use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clients::BackendClient;
use crate::clients::backend::{AcceptedJob, OfferRecord};
use crate::error::EngineError;
use crate::geo::haversine_km;
use crate::models::offer::{JobOffer, ProximitySettings, RADIUS_RANGE_KM};
use crate::models::position::{Coordinate, PositionSample};
use crate::observability::metrics::Metrics;

/// Online/radius-gated offer visibility. While the courier is online a
/// loop task polls the backend on a fixed cadence; snapshots of the
/// visible set, sorted by distance, are published on a watch channel.
#[derive(Clone)]
pub struct OfferBoard {
    inner: Arc<BoardInner>,
    refresh_tx: mpsc::Sender<()>,
}

struct BoardInner {
    backend: Arc<BackendClient>,
    settings: RwLock<ProximitySettings>,
    visible: DashMap<Uuid, JobOffer>,
    /// Bumped on every transition that invalidates in-flight fetches.
    epoch: AtomicU64,
    snapshot_tx: watch::Sender<Vec<JobOffer>>,
    position_rx: watch::Receiver<Option<PositionSample>>,
    metrics: Arc<Metrics>,
}

impl OfferBoard {
    pub fn spawn(
        backend: Arc<BackendClient>,
        position_rx: watch::Receiver<Option<PositionSample>>,
        initial: ProximitySettings,
        poll_interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(Vec::new());
        let (refresh_tx, refresh_rx) = mpsc::channel(1);

        let inner = Arc::new(BoardInner {
            backend,
            settings: RwLock::new(initial),
            visible: DashMap::new(),
            epoch: AtomicU64::new(0),
            snapshot_tx,
            position_rx,
            metrics,
        });

        tokio::spawn(run_poll_loop(inner.clone(), refresh_rx, poll_interval));

        Self { inner, refresh_tx }
    }

    pub async fn settings(&self) -> ProximitySettings {
        *self.inner.settings.read().await
    }

    /// Going online triggers an immediate fetch and starts the polling
    /// cadence. Going offline clears the visible set before returning
    /// and invalidates any fetch still in flight.
    pub async fn set_online(&self, online: bool) {
        let mut settings = self.inner.settings.write().await;
        if settings.online == online {
            return;
        }
        settings.online = online;
        drop(settings);

        if online {
            info!("courier online, fetching offers");
            let _ = self.refresh_tx.try_send(());
        } else {
            info!("courier offline, clearing visible offers");
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            self.inner.visible.clear();
            publish(&self.inner);
        }
    }

    /// Radius outside the allowed range is rejected and the previous
    /// value kept. Narrowing prunes now-out-of-range offers eagerly;
    /// while online, any change triggers an immediate refetch.
    pub async fn set_radius(&self, radius_km: f64) -> Result<(), EngineError> {
        if !radius_km.is_finite() || !RADIUS_RANGE_KM.contains(&radius_km) {
            return Err(EngineError::RadiusOutOfBounds {
                requested_km: radius_km,
            });
        }

        let mut settings = self.inner.settings.write().await;
        let narrowed = radius_km < settings.radius_km;
        settings.radius_km = radius_km;
        let online = settings.online;
        drop(settings);

        if narrowed {
            self.inner
                .visible
                .retain(|_, offer| offer.distance_from_courier_km <= radius_km);
            publish(&self.inner);
        }
        if online {
            let _ = self.refresh_tx.try_send(());
        }
        Ok(())
    }

    /// Accepts an offer, attaching the latest known position. The offer
    /// leaves the visible set as soon as the backend confirms.
    pub async fn accept(&self, offer_id: Uuid) -> Result<AcceptedJob, EngineError> {
        let position = (*self.inner.position_rx.borrow()).map(|sample| sample.coordinate);
        let accepted = self
            .inner
            .backend
            .accept_offer(offer_id, position.as_ref())
            .await?;

        self.inner.visible.remove(&offer_id);
        publish(&self.inner);
        info!(%offer_id, "offer accepted");
        Ok(accepted)
    }

    /// Asks the poll loop for an immediate refetch.
    pub fn refresh(&self) {
        let _ = self.refresh_tx.try_send(());
    }

    pub fn snapshot(&self) -> Vec<JobOffer> {
        self.inner.snapshot_tx.borrow().clone()
    }

    pub fn offers_watch(&self) -> watch::Receiver<Vec<JobOffer>> {
        self.inner.snapshot_tx.subscribe()
    }
}

fn publish(inner: &BoardInner) {
    let mut offers: Vec<JobOffer> = inner
        .visible
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    offers.sort_by(|a, b| {
        a.distance_from_courier_km
            .total_cmp(&b.distance_from_courier_km)
    });
    inner.metrics.visible_offers.set(offers.len() as i64);
    inner.snapshot_tx.send_replace(offers);
}

async fn run_poll_loop(
    inner: Arc<BoardInner>,
    mut refresh_rx: mpsc::Receiver<()>,
    poll_interval: Duration,
) {
    info!(
        interval_ms = poll_interval.as_millis() as u64,
        "offer polling started"
    );

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut position_rx = inner.position_rx.clone();
    let mut watch_position = true;

    loop {
        // A refresh that raced ahead of the first fix retries as soon as
        // a position lands.
        let awaiting_position =
            inner.settings.read().await.online && inner.position_rx.borrow().is_none();

        tokio::select! {
            _ = ticker.tick() => {}
            request = refresh_rx.recv() => {
                if request.is_none() {
                    break;
                }
                ticker.reset();
            }
            changed = position_rx.changed(), if watch_position && awaiting_position => {
                if changed.is_err() {
                    watch_position = false;
                    continue;
                }
            }
        }
        poll_once(&inner).await;
    }

    warn!("offer polling stopped: board dropped");
}

async fn poll_once(inner: &Arc<BoardInner>) {
    let settings = *inner.settings.read().await;
    if !settings.online {
        return;
    }
    let Some(position) = *inner.position_rx.borrow() else {
        debug!("skipping offer poll: no position yet");
        return;
    };

    let epoch = inner.epoch.load(Ordering::SeqCst);
    match inner
        .backend
        .fetch_offers(&position.coordinate, settings.radius_km)
        .await
    {
        Ok(records) => {
            // Holding the settings lock keeps an offline transition from
            // interleaving with the snapshot swap.
            let settings = inner.settings.read().await;
            if !settings.online || inner.epoch.load(Ordering::SeqCst) != epoch {
                debug!("discarding offer fetch from a stale epoch");
                inner
                    .metrics
                    .offer_polls_total
                    .with_label_values(&["stale"])
                    .inc();
                return;
            }

            let offers = merge_offers(records, &position.coordinate, settings.radius_km);
            inner.visible.clear();
            for offer in &offers {
                inner.visible.insert(offer.id, offer.clone());
            }
            publish(inner);
            inner
                .metrics
                .offer_polls_total
                .with_label_values(&["success"])
                .inc();
            debug!(count = offers.len(), "offer snapshot refreshed");
        }
        Err(err) => {
            warn!(error = %err, "offer poll failed");
            inner
                .metrics
                .offer_polls_total
                .with_label_values(&["error"])
                .inc();
        }
    }
}

/// Turns a fetch result into the visible set: first occurrence of an id
/// wins, offers with invalid coordinates are skipped, the radius
/// predicate is re-applied against the derived pickup distance, and the
/// result is sorted nearest first.
pub(crate) fn merge_offers(
    records: Vec<OfferRecord>,
    courier: &Coordinate,
    radius_km: f64,
) -> Vec<JobOffer> {
    let mut seen = HashSet::new();
    let mut offers = Vec::with_capacity(records.len());

    for record in records {
        if !seen.insert(record.id) {
            continue;
        }
        if !record.pickup.is_valid() || !record.dropoff.is_valid() {
            debug!(offer_id = %record.id, "skipping offer with invalid coordinates");
            continue;
        }

        let distance_km = haversine_km(courier, &record.pickup);
        if distance_km > radius_km {
            continue;
        }

        offers.push(JobOffer {
            id: record.id,
            pickup: record.pickup,
            dropoff: record.dropoff,
            pickup_address: record.pickup_address,
            dropoff_address: record.dropoff_address,
            payout_cents: record.payout_cents,
            distance_from_courier_km: distance_km,
        });
    }

    offers.sort_by(|a, b| {
        a.distance_from_courier_km
            .total_cmp(&b.distance_from_courier_km)
    });
    offers
}
