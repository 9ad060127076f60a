use crate::engine::{EngineError, EngineHandle};
use crate::refresh::Refresher;
use rollcall_core::{PipelineError, ReferenceStore};
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Rollcall1";
pub const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

/// D-Bus interface for the rollcall identification daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
pub struct RollcallService {
    engine: EngineHandle,
    store: Arc<ReferenceStore>,
    refresher: Arc<Refresher>,
}

impl RollcallService {
    pub fn new(engine: EngineHandle, store: Arc<ReferenceStore>, refresher: Arc<Refresher>) -> Self {
        Self { engine, store, refresher }
    }

    async fn run_identify(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        // Pin the roster for the whole request; a refresh mid-way does not affect it.
        let snapshot = self.store.snapshot();
        let identification = self.engine.identify(image, snapshot).await.map_err(to_fdo)?;
        serde_json::to_string(&identification).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::Pipeline(PipelineError::InvalidImage(msg)) => zbus::fdo::Error::InvalidArgs(msg),
        timeout @ EngineError::Timeout(_) => zbus::fdo::Error::TimedOut(timeout.to_string()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Identify every face in an encoded image. Returns the result as JSON.
    async fn identify(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), "identify requested");
        self.run_identify(image).await
    }

    /// Identify every face in an image file readable by the daemon.
    async fn identify_file(&self, path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, "identify_file requested");
        let image = tokio::fs::read(path)
            .await
            .map_err(|e| zbus::fdo::Error::FileNotFound(format!("{path}: {e}")))?;
        self.run_identify(image).await
    }

    /// Reload the roster now. Returns the refresh report as JSON.
    async fn refresh_references(&self) -> zbus::fdo::Result<String> {
        tracing::info!("refresh_references requested");
        let report = self
            .refresher
            .refresh_once()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&report).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(status_json(&self.store).to_string())
    }
}

fn status_json(store: &ReferenceStore) -> serde_json::Value {
    let snapshot = store.snapshot();
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "models_loaded": true,
        "identities": snapshot.set.identity_count(),
        "embeddings": snapshot.set.embedding_count(),
        "dimension": snapshot.set.dimension(),
        "last_refresh": snapshot.refreshed_at.map(|t| t.to_rfc3339()),
    })
}
