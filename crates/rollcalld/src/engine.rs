use rollcall_core::{FaceDetector, FaceEmbedder, Identification, Identifier, PipelineError, ReferenceSnapshot};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("identify timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Identify {
        image: Vec<u8>,
        snapshot: Arc<ReferenceSnapshot>,
        reply: oneshot::Sender<Result<Identification, PipelineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Decode `image`, then detect, embed, and match against `snapshot`.
    ///
    /// A request that does not finish within the configured timeout is
    /// abandoned; the engine finishes it in the background and drops the result.
    pub async fn identify(
        &self,
        image: Vec<u8>,
        snapshot: Arc<ReferenceSnapshot>,
    ) -> Result<Identification, EngineError> {
        let request = async {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.tx
                .send(EngineRequest::Identify {
                    image,
                    snapshot,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            let result = reply_rx.await.map_err(|_| EngineError::ChannelClosed)?;
            Ok::<_, EngineError>(result?)
        };

        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "identify request abandoned");
                Err(EngineError::Timeout(self.timeout))
            }
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The identifier (and with it both models) moves onto the thread; requests
/// are served one at a time in arrival order.
pub fn spawn_engine<D, E>(mut identifier: Identifier<D, E>, timeout: Duration) -> Result<EngineHandle, EngineError>
where
    D: FaceDetector + 'static,
    E: FaceEmbedder + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Identify { image, snapshot, reply } => {
                        let result = rollcall_core::decode_image(&image)
                            .and_then(|decoded| identifier.identify(&decoded, &snapshot.set));
                        if let Err(e) = &result {
                            tracing::warn!(error = %e, "identify failed");
                        }
                        if reply.send(result).is_err() {
                            tracing::debug!("identify caller went away; result dropped");
                        }
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, timeout })
}
