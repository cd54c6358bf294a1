use std::future::Future;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::messaging::{IpcChannel, IpcError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use super::handle::ControllerHandle;
use super::messages::ControllerMessage;
use crate::error::Result;

/// Answer to one frame on the controller socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ServerReply {
    /// The handler ran; carries its result
    Ok {
        #[serde(default)]
        result: Value,
    },
    /// The message was queued for the controller
    Queued,
    Error {
        error: String,
    },
}

/// Unix socket front end of the state controller
pub struct ControllerServer {
    listener: UnixListener,
    path: PathBuf,
    controller: ControllerHandle,
}

impl ControllerServer {
    pub async fn bind(path: &Path, controller: ControllerHandle) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(socket = %path.display(), "Removed stale controller socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(path)?;
        info!(socket = %path.display(), "Controller socket listening");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            controller,
        })
    }

    /// Accept clients until `shutdown` completes
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let controller = self.controller.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, controller).await {
                                debug!(error = %e, "Controller client disconnected");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept on controller socket failed"),
                },
            }
        }

        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            debug!(error = %e, "Controller socket already gone");
        }
        info!("Controller socket closed");
    }
}

/// Serve one client: one reply per frame, malformed frames included
pub async fn serve_connection<S>(stream: S, controller: ControllerHandle) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut reader, mut writer) = IpcChannel::new(stream).into_split();

    loop {
        let frame = match reader.recv_frame().await {
            Ok(frame) => frame,
            Err(IpcError::PeerClosed) => return Ok(()),
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "Controller frame dropped");
                writer
                    .send(&ServerReply::Error {
                        error: e.to_string(),
                    })
                    .await?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let reply = match ControllerMessage::decode(&frame) {
            Err(e) => {
                warn!(error = %e, "Controller frame dropped");
                ServerReply::Error {
                    error: e.to_string(),
                }
            }
            Ok(message @ (ControllerMessage::Submit(_) | ControllerMessage::GetAnalysis { .. })) => {
                match controller.call(message).await {
                    Ok(result) => ServerReply::Ok { result },
                    Err(e) => ServerReply::Error {
                        error: e.to_string(),
                    },
                }
            }
            Ok(message) => match controller.handle_message(message) {
                Ok(()) => ServerReply::Queued,
                Err(e) => ServerReply::Error {
                    error: e.to_string(),
                },
            },
        };
        writer.send(&reply).await?;
    }
}
