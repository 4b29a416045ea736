//! Scripted stand-ins for the device seams, used by the demo binary
//! and tests in place of a real mobile shell.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::engine::permission::{PermissionDecision, PermissionPlatform};
use crate::engine::provider::{PositionSource, TrackingOptions};
use crate::error::EngineError;
use crate::geo::bearing_degrees;
use crate::models::position::{Coordinate, PositionSample};

/// Replays a fixed track, one sample per `every`.
pub struct ScriptedPositionSource {
    samples: Vec<PositionSample>,
    every: Duration,
    watches: AtomicUsize,
}

impl ScriptedPositionSource {
    pub fn new(samples: Vec<PositionSample>, every: Duration) -> Self {
        Self {
            samples,
            every,
            watches: AtomicUsize::new(0),
        }
    }

    pub fn watches_opened(&self) -> usize {
        self.watches.load(Ordering::SeqCst)
    }

    /// Builds a track from raw (latitude, longitude) points, `step`
    /// apart in time, with headings pointing at the next point.
    pub fn track(
        points: &[(f64, f64)],
        start: DateTime<Utc>,
        step: chrono::Duration,
    ) -> Vec<PositionSample> {
        points
            .iter()
            .enumerate()
            .map(|(index, &(latitude, longitude))| {
                let coordinate = Coordinate::new(latitude, longitude);
                let heading_degrees = points.get(index + 1).map(|&(lat, lng)| {
                    bearing_degrees(&coordinate, &Coordinate::new(lat, lng))
                });
                PositionSample {
                    coordinate,
                    accuracy_m: 8.0,
                    speed_mps: None,
                    heading_degrees,
                    recorded_at: start + step * index as i32,
                }
            })
            .collect()
    }
}

#[async_trait]
impl PositionSource for ScriptedPositionSource {
    async fn request_fix(&self) -> Result<PositionSample, EngineError> {
        self.samples
            .first()
            .copied()
            .ok_or_else(|| EngineError::Device("position script is empty".to_string()))
    }

    async fn open_watch(
        &self,
        _options: TrackingOptions,
    ) -> Result<mpsc::Receiver<PositionSample>, EngineError> {
        self.watches.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        let samples = self.samples.clone();
        let every = self.every;

        tokio::spawn(async move {
            for sample in samples {
                if tx.send(sample).await.is_err() {
                    break;
                }
                tokio::time::sleep(every).await;
            }
        });

        Ok(rx)
    }
}

/// Permission platform that always answers the same way.
pub struct FixedPermissionPlatform(pub PermissionDecision);

#[async_trait]
impl PermissionPlatform for FixedPermissionPlatform {
    async fn request_location_permission(&self) -> PermissionDecision {
        self.0
    }
}
