//! Stage worker side of the processing protocol
//!
//! A worker loads its stage plugins once, reports `READY` (or `SETUP_FAIL`)
//! and then handles one work item at a time until the handler hangs up.

pub mod plugins;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use shared::messaging::{HandlerMessage, IpcChannel, IpcError, WorkerMessage};
use shared::observability::worker_span;
use shared::types::{Stage, WorkItem};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{error, info, warn, Instrument};

use crate::error::Result;

pub use plugins::BuiltinPlugins;

/// One step of a stage pipeline
#[async_trait]
pub trait StagePlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Process one work item. The returned value ends up in the
    /// `FINISHED` payload under the plugin's name.
    async fn run(&self, item: &WorkItem) -> anyhow::Result<Value>;
}

#[async_trait]
pub trait PluginLoader: Send + Sync {
    async fn load(&self, stage: Stage) -> anyhow::Result<Vec<Arc<dyn StagePlugin>>>;
}

pub struct StageWorker {
    stage: Stage,
    name: String,
    loader: Arc<dyn PluginLoader>,
}

impl StageWorker {
    pub fn new(stage: Stage, name: impl Into<String>, loader: Arc<dyn PluginLoader>) -> Self {
        Self {
            stage,
            name: name.into(),
            loader,
        }
    }

    /// Serve the handler on `stream` until it disconnects
    pub async fn run<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let span = worker_span(self.stage, &self.name);
        self.serve(stream).instrument(span).await
    }

    async fn serve<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (mut reader, mut writer) = IpcChannel::new(stream).into_split();

        let plugins = match self.loader.load(self.stage).await {
            Ok(plugins) if !plugins.is_empty() => plugins,
            Ok(_) => {
                error!("No plugins for this stage");
                let error = format!("no plugins configured for stage {}", self.stage);
                writer.send(&WorkerMessage::SetupFail { error }).await?;
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "Plugin loading failed");
                let error = format!("{:#}", e);
                writer.send(&WorkerMessage::SetupFail { error }).await?;
                return Ok(());
            }
        };

        info!(plugins = plugins.len(), "Stage worker ready");
        writer.send(&WorkerMessage::Ready).await?;

        loop {
            let item = match reader.recv::<HandlerMessage>().await {
                Ok(HandlerMessage::Work(item)) => item,
                Err(IpcError::PeerClosed) => {
                    info!("Handler closed the connection");
                    return Ok(());
                }
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, "Ignoring malformed frame from handler");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let reply = match run_plugins(&plugins, &item).await {
                Ok(result) => WorkerMessage::Finished { result },
                Err(error) => {
                    warn!(analysis_id = %item.analysis_id, error = %error, "Work item failed");
                    WorkerMessage::WorkFail { error }
                }
            };
            writer.send(&reply).await?;
            writer.send(&WorkerMessage::Ready).await?;
        }
    }
}

/// Run every plugin in order. The first error or panic fails the item.
async fn run_plugins(
    plugins: &[Arc<dyn StagePlugin>],
    item: &WorkItem,
) -> std::result::Result<Value, String> {
    let mut merged = serde_json::Map::new();
    for plugin in plugins {
        match AssertUnwindSafe(plugin.run(item)).catch_unwind().await {
            Ok(Ok(value)) => {
                merged.insert(plugin.name().to_string(), value);
            }
            Ok(Err(e)) => return Err(format!("{}: {:#}", plugin.name(), e)),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                return Err(format!("{}: panicked: {}", plugin.name(), message));
            }
        }
    }
    Ok(Value::Object(merged))
}
