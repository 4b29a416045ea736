mod clients;
mod config;
mod engine;
mod error;
mod geo;
mod models;
mod observability;
mod session;
mod sim;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing_subscriber::EnvFilter;

use crate::engine::permission::PermissionDecision;
use crate::models::offer::{ProximitySettings, DEFAULT_RADIUS_KM};
use crate::session::CourierSession;
use crate::sim::{FixedPermissionPlatform, ScriptedPositionSource};

/// Demo shift through central Maputo, northbound on Avenida Julius
/// Nyerere. One point roughly every 200 m.
const DEMO_TRACK: &[(f64, f64)] = &[
    (-25.9762, 32.5875),
    (-25.9744, 32.5872),
    (-25.9726, 32.5869),
    (-25.9708, 32.5866),
    (-25.9690, 32.5863),
    (-25.9672, 32.5860),
    (-25.9655, 32.5857),
];

#[tokio::main]
async fn main() -> Result<(), error::EngineError> {
    let config = config::EngineConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let source = Arc::new(ScriptedPositionSource::new(
        ScriptedPositionSource::track(DEMO_TRACK, Utc::now(), chrono::Duration::seconds(5)),
        Duration::from_secs(5),
    ));
    let platform = Arc::new(FixedPermissionPlatform(PermissionDecision::Granted));
    let settings = ProximitySettings::restore(DEFAULT_RADIUS_KM, false);

    let session = CourierSession::new(config, settings, platform, source);
    session.go_online().await?;

    let dropoff = session
        .resolve_address("Praca da Independencia, Maputo")
        .await;
    tracing::info!(
        latitude = dropoff.coordinate.latitude,
        longitude = dropoff.coordinate.longitude,
        is_fallback = dropoff.is_fallback,
        "dropoff resolved"
    );

    let route = session.start_leg(dropoff.coordinate).await?;
    tracing::info!(
        distance = %route.distance_text,
        duration = %route.duration_text,
        is_fallback = route.is_fallback,
        "demo leg started"
    );

    let mut offers_rx = session.offers_watch();
    let mut progress_rx = session.progress_watch();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = offers_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let offers = offers_rx.borrow_and_update().clone();
                tracing::info!(count = offers.len(), "visible offers updated");
                for offer in &offers {
                    tracing::info!(
                        offer_id = %offer.id,
                        distance_km = offer.distance_from_courier_km,
                        payout_cents = offer.payout_cents,
                        "offer"
                    );
                }
            }
            changed = progress_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(progress) = *progress_rx.borrow_and_update() {
                    tracing::info!(
                        fraction_complete = progress.fraction_complete,
                        remaining_km = progress.remaining_km,
                        deviation_km = progress.deviation_km,
                        "leg progress"
                    );
                }
            }
        }
    }

    session.go_offline().await;
    if let Some(synced) = session.last_synced() {
        tracing::info!(
            latitude = synced.latitude,
            longitude = synced.longitude,
            "last synced position"
        );
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
