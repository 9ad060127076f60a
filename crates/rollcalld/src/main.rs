use anyhow::{Context, Result};
use rollcall_core::{ArcFaceEmbedder, Identifier, ReferenceStore, YoloFaceDetector};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod refresh;
mod source;

use config::{Bus, Config};
use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};
use refresh::Refresher;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("ROLLCALL_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::from_env()?;

    // Missing models are the one startup-fatal condition.
    let detector = YoloFaceDetector::load(
        &config.detector_model_path(),
        config.pipeline.detection.inference_size,
    )
    .context("loading face detector")?;
    let embedder = ArcFaceEmbedder::load(&config.arcface_model_path()).context("loading face embedder")?;
    let identifier = Identifier::from_config(detector, embedder, &config.pipeline);
    let engine = engine::spawn_engine(identifier, config.identify_timeout)?;

    let store = Arc::new(ReferenceStore::new());
    let source = source::from_location(&config.reference, config.refresh_timeout);
    tracing::info!(source = %source.describe(), "reference source configured");
    let refresher = Arc::new(Refresher::new(Arc::clone(&store), source, config.refresh_timeout));

    refresher.load_initial(config.initial_load_timeout).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresh_task = Arc::clone(&refresher).spawn_periodic(config.refresh_interval, shutdown_rx);

    let service = RollcallService::new(engine, store, refresher);
    let builder = match config.bus {
        Bus::Session => zbus::connection::Builder::session()?,
        Bus::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("registering {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(
        bus = ?config.bus,
        refresh_interval = ?config.refresh_interval,
        "rollcalld ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    let _ = shutdown_tx.send(true);
    if let Err(e) = refresh_task.await {
        tracing::warn!(error = %e, "refresh task ended abnormally");
    }

    Ok(())
}
