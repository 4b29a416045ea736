use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clients::BackendClient;
use crate::models::position::{Coordinate, PositionSample};
use crate::observability::metrics::Metrics;

/// Where the throttle stands. At most one backend sync happens per
/// window; the machine is observable so callers can wait on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Scheduled,
    InFlight,
}

/// Trailing-edge throttle for backend position sync. `notify` records
/// the freshest sample; the loop task syncs once per window with
/// whatever is freshest at the window boundary.
#[derive(Clone)]
pub struct LocationSync {
    inner: Arc<SyncShared>,
}

struct SyncShared {
    pending_tx: watch::Sender<Option<PositionSample>>,
    phase_rx: watch::Receiver<SyncPhase>,
    last_synced_rx: watch::Receiver<Option<Coordinate>>,
}

impl LocationSync {
    pub fn spawn(backend: Arc<BackendClient>, window: Duration, metrics: Arc<Metrics>) -> Self {
        let (pending_tx, pending_rx) = watch::channel(None);
        let (phase_tx, phase_rx) = watch::channel(SyncPhase::Idle);
        let (last_synced_tx, last_synced_rx) = watch::channel(None);

        tokio::spawn(run_sync_loop(
            backend,
            window,
            metrics,
            pending_rx,
            phase_tx,
            last_synced_tx,
        ));

        Self {
            inner: Arc::new(SyncShared {
                pending_tx,
                phase_rx,
                last_synced_rx,
            }),
        }
    }

    /// Records the freshest position. Never blocks and never fails; the
    /// loop task picks it up at the next window boundary.
    pub fn notify(&self, sample: PositionSample) {
        self.inner.pending_tx.send_replace(Some(sample));
    }

    pub fn phase(&self) -> SyncPhase {
        *self.inner.phase_rx.borrow()
    }

    pub fn phase_watch(&self) -> watch::Receiver<SyncPhase> {
        self.inner.phase_rx.clone()
    }

    /// Coordinate of the most recent successful sync.
    pub fn last_synced(&self) -> Option<Coordinate> {
        *self.inner.last_synced_rx.borrow()
    }

    pub fn last_synced_watch(&self) -> watch::Receiver<Option<Coordinate>> {
        self.inner.last_synced_rx.clone()
    }
}

async fn run_sync_loop(
    backend: Arc<BackendClient>,
    window: Duration,
    metrics: Arc<Metrics>,
    mut pending_rx: watch::Receiver<Option<PositionSample>>,
    phase_tx: watch::Sender<SyncPhase>,
    last_synced_tx: watch::Sender<Option<Coordinate>>,
) {
    info!(window_ms = window.as_millis() as u64, "location sync started");

    // A sample held over from a failed attempt, retried next window.
    let mut retained: Option<PositionSample> = None;

    loop {
        if retained.is_none() {
            if pending_rx.changed().await.is_err() {
                break;
            }
            retained = *pending_rx.borrow_and_update();
            if retained.is_none() {
                continue;
            }
        }

        phase_tx.send_replace(SyncPhase::Scheduled);
        tokio::time::sleep(window).await;

        // Freshest position wins at the window boundary.
        if matches!(pending_rx.has_changed(), Ok(true)) {
            if let Some(fresh) = *pending_rx.borrow_and_update() {
                retained = Some(fresh);
            }
        }
        let Some(sample) = retained.take() else {
            phase_tx.send_replace(SyncPhase::Idle);
            continue;
        };

        phase_tx.send_replace(SyncPhase::InFlight);
        let start = Instant::now();
        match backend.sync_position(&sample.coordinate).await {
            Ok(()) => {
                let elapsed = start.elapsed().as_secs_f64();
                metrics
                    .sync_latency_seconds
                    .with_label_values(&["success"])
                    .observe(elapsed);
                metrics
                    .sync_attempts_total
                    .with_label_values(&["success"])
                    .inc();
                last_synced_tx.send_replace(Some(sample.coordinate));
                debug!(
                    latitude = sample.coordinate.latitude,
                    longitude = sample.coordinate.longitude,
                    "position synced"
                );
            }
            Err(err) => {
                let elapsed = start.elapsed().as_secs_f64();
                metrics
                    .sync_latency_seconds
                    .with_label_values(&["error"])
                    .observe(elapsed);
                metrics
                    .sync_attempts_total
                    .with_label_values(&["error"])
                    .inc();
                warn!(error = %err, "position sync failed");
                // Retry the same sample next window unless a fresher
                // one already arrived or the input closed.
                if matches!(pending_rx.has_changed(), Ok(false)) {
                    retained = Some(sample);
                }
            }
        }
        phase_tx.send_replace(SyncPhase::Idle);
    }

    let _ = phase_tx.send(SyncPhase::Idle);
    warn!("location sync stopped: input channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Clone, Default)]
    struct StubBackend {
        bodies: Arc<Mutex<Vec<serde_json::Value>>>,
        fail_next: Arc<AtomicBool>,
        delay: Option<Duration>,
    }

    async fn record_location(
        State(stub): State<StubBackend>,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        if let Some(delay) = stub.delay {
            tokio::time::sleep(delay).await;
        }
        stub.bodies.lock().unwrap().push(body);
        if stub.fail_next.swap(false, Ordering::SeqCst) {
            Json(serde_json::json!({ "status": "error", "message": "try later" }))
        } else {
            Json(serde_json::json!({ "status": "success" }))
        }
    }

    async fn start_stub(stub: StubBackend) -> String {
        let app = Router::new()
            .route("/courier/location", post(record_location))
            .with_state(stub);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn sample(latitude: f64, longitude: f64) -> PositionSample {
        PositionSample {
            coordinate: Coordinate::new(latitude, longitude),
            accuracy_m: 5.0,
            speed_mps: None,
            heading_degrees: None,
            recorded_at: Utc::now(),
        }
    }

    fn client(base_url: &str) -> Arc<BackendClient> {
        Arc::new(BackendClient::new(
            base_url,
            None,
            Uuid::new_v4(),
            Duration::from_secs(2),
        ))
    }

    #[tokio::test]
    async fn burst_of_notifies_syncs_once_with_final_position() {
        let stub = StubBackend::default();
        let base_url = start_stub(stub.clone()).await;
        let sync = LocationSync::spawn(
            client(&base_url),
            Duration::from_millis(80),
            Arc::new(Metrics::new()),
        );

        assert_eq!(sync.phase(), SyncPhase::Idle);
        for longitude in [32.570, 32.571, 32.572, 32.573, 32.574] {
            sync.notify(sample(-25.96, longitude));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sync.phase(), SyncPhase::Scheduled);

        tokio::time::sleep(Duration::from_millis(230)).await;
        let bodies = stub.bodies.lock().unwrap().clone();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["longitude"], 32.574);
        assert_eq!(sync.phase(), SyncPhase::Idle);
        assert_eq!(
            sync.last_synced(),
            Some(Coordinate::new(-25.96, 32.574))
        );
    }

    #[tokio::test]
    async fn separate_windows_sync_separately() {
        let stub = StubBackend::default();
        let base_url = start_stub(stub.clone()).await;
        let sync = LocationSync::spawn(
            client(&base_url),
            Duration::from_millis(60),
            Arc::new(Metrics::new()),
        );

        sync.notify(sample(-25.9692, 32.5732));
        tokio::time::sleep(Duration::from_millis(150)).await;
        sync.notify(sample(-25.9425, 32.5886));
        tokio::time::sleep(Duration::from_millis(150)).await;

        let bodies = stub.bodies.lock().unwrap().clone();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0]["latitude"], -25.9692);
        assert_eq!(bodies[1]["latitude"], -25.9425);
    }

    #[tokio::test]
    async fn failed_sync_retries_on_the_next_window() {
        let stub = StubBackend {
            fail_next: Arc::new(AtomicBool::new(true)),
            ..StubBackend::default()
        };
        let base_url = start_stub(stub.clone()).await;
        let metrics = Arc::new(Metrics::new());
        let sync = LocationSync::spawn(client(&base_url), Duration::from_millis(60), metrics.clone());

        sync.notify(sample(-25.9655, 32.5832));
        tokio::time::sleep(Duration::from_millis(300)).await;

        let bodies = stub.bodies.lock().unwrap().clone();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0], bodies[1]);
        assert_eq!(
            metrics.sync_attempts_total.with_label_values(&["error"]).get(),
            1
        );
        assert_eq!(
            metrics
                .sync_attempts_total
                .with_label_values(&["success"])
                .get(),
            1
        );
        assert_eq!(sync.last_synced(), Some(Coordinate::new(-25.9655, 32.5832)));
    }

    #[tokio::test]
    async fn notify_during_flight_rearms_the_throttle() {
        let stub = StubBackend {
            delay: Some(Duration::from_millis(100)),
            ..StubBackend::default()
        };
        let base_url = start_stub(stub.clone()).await;
        let sync = LocationSync::spawn(
            client(&base_url),
            Duration::from_millis(50),
            Arc::new(Metrics::new()),
        );

        sync.notify(sample(-25.9692, 32.5732));
        // Lands inside the first in-flight call.
        tokio::time::sleep(Duration::from_millis(80)).await;
        sync.notify(sample(-25.9425, 32.5886));
        tokio::time::sleep(Duration::from_millis(400)).await;

        let bodies = stub.bodies.lock().unwrap().clone();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0]["latitude"], -25.9692);
        assert_eq!(bodies[1]["latitude"], -25.9425);
    }
}
