use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::engine::permission::PermissionGate;
use crate::error::EngineError;
use crate::models::position::PositionSample;
use crate::observability::metrics::Metrics;

/// Cadence requested from the device watcher.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingOptions {
    pub min_interval: Duration,
    pub min_distance_m: f64,
}

impl Default for TrackingOptions {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(10),
            min_distance_m: 50.0,
        }
    }
}

/// The device location sensor. Implementations wrap the mobile shell's
/// location SDK; tests and the demo binary use scripted sources.
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// One fresh fix. Implementations may take arbitrarily long; the
    /// provider bounds the wait.
    async fn request_fix(&self) -> Result<PositionSample, EngineError>;

    /// Opens a continuous watch at the requested cadence. The stream
    /// ends when the returned receiver is dropped or the sensor stops.
    async fn open_watch(
        &self,
        options: TrackingOptions,
    ) -> Result<mpsc::Receiver<PositionSample>, EngineError>;
}

/// Handle to a live tracking subscription. Cloneable; `stop` is
/// idempotent and callable from any task.
#[derive(Clone)]
pub struct TrackingHandle {
    stop_tx: Arc<watch::Sender<bool>>,
}

impl TrackingHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// True when both handles refer to the same subscription.
    pub fn same_subscription(&self, other: &TrackingHandle) -> bool {
        Arc::ptr_eq(&self.stop_tx, &other.stop_tx)
    }
}

/// Position acquisition for one session: bounded single-shot fixes with
/// a freshness cache, and an idempotent continuous watch that delivers
/// samples in timestamp order on a single task.
pub struct PositionProvider {
    gate: Arc<PermissionGate>,
    source: Arc<dyn PositionSource>,
    metrics: Arc<Metrics>,
    cached: Arc<Mutex<Option<PositionSample>>>,
    active: Mutex<Option<TrackingHandle>>,
}

impl PositionProvider {
    pub fn new(
        gate: Arc<PermissionGate>,
        source: Arc<dyn PositionSource>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            gate,
            source,
            metrics,
            cached: Arc::new(Mutex::new(None)),
            active: Mutex::new(None),
        }
    }

    /// Latest sample seen by either path, if any.
    pub fn last_known(&self) -> Option<PositionSample> {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A position no older than `max_age`: the cached sample when fresh
    /// enough, otherwise a new fix bounded by `timeout`.
    pub async fn current_position(
        &self,
        timeout: Duration,
        max_age: Duration,
    ) -> Result<PositionSample, EngineError> {
        self.gate.ensure_granted()?;

        if let Some(sample) = self.last_known() {
            if sample.is_within_age(max_age) {
                return Ok(sample);
            }
        }

        match tokio::time::timeout(timeout, self.source.request_fix()).await {
            Ok(Ok(sample)) => {
                self.store(sample);
                Ok(sample)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(EngineError::PositionTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Starts continuous tracking, delivering samples to `on_sample` one
    /// at a time in non-decreasing timestamp order. While a subscription
    /// is live, further calls return the existing handle and the new
    /// callback is discarded.
    pub async fn start_tracking<F>(
        &self,
        options: TrackingOptions,
        on_sample: F,
    ) -> Result<TrackingHandle, EngineError>
    where
        F: FnMut(PositionSample) + Send + 'static,
    {
        self.gate.ensure_granted()?;

        if let Some(handle) = self.live_handle() {
            return Ok(handle);
        }

        let source_rx = self.source.open_watch(options).await?;

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = active.as_ref().filter(|handle| !handle.is_stopped()) {
            // Lost the race to a concurrent start; dropping source_rx
            // closes the extra watch.
            return Ok(handle.clone());
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let handle = TrackingHandle {
            stop_tx: stop_tx.clone(),
        };

        tokio::spawn(deliver_samples(
            source_rx,
            stop_rx,
            stop_tx,
            self.cached.clone(),
            self.metrics.clone(),
            on_sample,
        ));

        *active = Some(handle.clone());
        Ok(handle)
    }

    fn live_handle(&self) -> Option<TrackingHandle> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.as_ref().filter(|handle| !handle.is_stopped()).cloned()
    }

    fn store(&self, sample: PositionSample) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(sample);
    }
}

async fn deliver_samples<F>(
    mut source_rx: mpsc::Receiver<PositionSample>,
    mut stop_rx: watch::Receiver<bool>,
    stop_tx: Arc<watch::Sender<bool>>,
    cached: Arc<Mutex<Option<PositionSample>>>,
    metrics: Arc<Metrics>,
    mut on_sample: F,
) where
    F: FnMut(PositionSample) + Send + 'static,
{
    let mut last_seen: Option<DateTime<Utc>> = None;

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            maybe = source_rx.recv() => {
                let Some(sample) = maybe else { break };

                if let Some(last) = last_seen {
                    if sample.recorded_at < last {
                        debug!(
                            recorded_at = %sample.recorded_at,
                            "dropping out-of-order position sample"
                        );
                        metrics
                            .samples_total
                            .with_label_values(&["dropped"])
                            .inc();
                        continue;
                    }
                }
                last_seen = Some(sample.recorded_at);

                *cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(sample);
                metrics
                    .samples_total
                    .with_label_values(&["delivered"])
                    .inc();
                on_sample(sample);
            }
        }
    }

    // Mark the subscription stopped so a later start opens a new watch.
    let _ = stop_tx.send(true);
    debug!("tracking delivery task ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::permission::PermissionDecision;
    use crate::models::position::Coordinate;
    use crate::sim::{FixedPermissionPlatform, ScriptedPositionSource};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_at(seconds: i64) -> PositionSample {
        PositionSample {
            coordinate: Coordinate::new(-25.9655, 32.5832),
            accuracy_m: 8.0,
            speed_mps: None,
            heading_degrees: None,
            recorded_at: chrono::DateTime::from_timestamp(1_700_000_000 + seconds, 0)
                .unwrap_or_else(Utc::now),
        }
    }

    async fn granted_gate() -> Arc<PermissionGate> {
        let gate = Arc::new(PermissionGate::new(Arc::new(FixedPermissionPlatform(
            PermissionDecision::Granted,
        ))));
        gate.request().await;
        gate
    }

    struct PendingSource;

    #[async_trait]
    impl PositionSource for PendingSource {
        async fn request_fix(&self) -> Result<PositionSample, EngineError> {
            std::future::pending().await
        }

        async fn open_watch(
            &self,
            _options: TrackingOptions,
        ) -> Result<mpsc::Receiver<PositionSample>, EngineError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    struct CountingFixSource {
        fixes: AtomicUsize,
    }

    #[async_trait]
    impl PositionSource for CountingFixSource {
        async fn request_fix(&self) -> Result<PositionSample, EngineError> {
            self.fixes.fetch_add(1, Ordering::SeqCst);
            Ok(sample_at(0))
        }

        async fn open_watch(
            &self,
            _options: TrackingOptions,
        ) -> Result<mpsc::Receiver<PositionSample>, EngineError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn unrequested_permission_blocks_position_calls() {
        let gate = Arc::new(PermissionGate::new(Arc::new(FixedPermissionPlatform(
            PermissionDecision::Granted,
        ))));
        let provider = PositionProvider::new(
            gate,
            Arc::new(PendingSource),
            Arc::new(Metrics::new()),
        );

        let result = provider
            .current_position(Duration::from_millis(10), Duration::ZERO)
            .await;
        assert!(matches!(result, Err(EngineError::PermissionDenied)));
    }

    #[tokio::test]
    async fn single_shot_fix_times_out() {
        let provider = PositionProvider::new(
            granted_gate().await,
            Arc::new(PendingSource),
            Arc::new(Metrics::new()),
        );

        let result = provider
            .current_position(Duration::from_millis(30), Duration::ZERO)
            .await;
        match result {
            Err(EngineError::PositionTimeout { timeout_ms }) => assert_eq!(timeout_ms, 30),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fresh_cache_skips_the_sensor() {
        let source = Arc::new(CountingFixSource {
            fixes: AtomicUsize::new(0),
        });
        let provider = PositionProvider::new(
            granted_gate().await,
            source.clone(),
            Arc::new(Metrics::new()),
        );

        let timeout = Duration::from_millis(100);
        provider
            .current_position(timeout, Duration::from_secs(60))
            .await
            .unwrap();
        provider
            .current_position(timeout, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(source.fixes.load(Ordering::SeqCst), 1);

        // A zero freshness budget forces a new fix.
        provider
            .current_position(timeout, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(source.fixes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn tracking_delivers_in_order_and_drops_stale_samples() {
        let script = vec![sample_at(0), sample_at(10), sample_at(5), sample_at(20)];
        let source = Arc::new(ScriptedPositionSource::new(
            script,
            Duration::from_millis(5),
        ));
        let provider = PositionProvider::new(
            granted_gate().await,
            source,
            Arc::new(Metrics::new()),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = provider
            .start_tracking(TrackingOptions::default(), move |sample| {
                let _ = tx.send(sample);
            })
            .await
            .unwrap();

        let mut delivered = Vec::new();
        while let Some(sample) = rx.recv().await {
            delivered.push(sample.recorded_at.timestamp() - 1_700_000_000);
        }
        assert_eq!(delivered, vec![0, 10, 20]);

        // Script drained, so the subscription marked itself stopped.
        assert!(handle.is_stopped());
        assert!(provider.last_known().is_some());
    }

    #[tokio::test]
    async fn start_tracking_is_idempotent_while_live() {
        let source = Arc::new(ScriptedPositionSource::new(
            vec![sample_at(0); 50],
            Duration::from_millis(20),
        ));
        let provider = PositionProvider::new(
            granted_gate().await,
            source.clone(),
            Arc::new(Metrics::new()),
        );

        let first = provider
            .start_tracking(TrackingOptions::default(), |_| {})
            .await
            .unwrap();
        let second = provider
            .start_tracking(TrackingOptions::default(), |_| {})
            .await
            .unwrap();

        assert!(first.same_subscription(&second));
        assert_eq!(source.watches_opened(), 1);

        first.stop();
        first.stop();
        assert!(second.is_stopped());

        // A stopped subscription no longer satisfies new starts.
        let third = provider
            .start_tracking(TrackingOptions::default(), |_| {})
            .await
            .unwrap();
        assert!(!third.same_subscription(&first));
        assert_eq!(source.watches_opened(), 2);
        third.stop();
    }
}
