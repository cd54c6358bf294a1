//! Stage worker process, launched by the orchestrator once per worker slot

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use nexus_orchestrator::config::LoggingConfig;
use nexus_orchestrator::worker::{BuiltinPlugins, StageWorker};
use shared::observability::init_logging;
use shared::types::Stage;
use tokio::net::UnixStream;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let stage: Stage = env::var("NEXUS_WORKER_STAGE")
        .context("NEXUS_WORKER_STAGE is not set")?
        .parse()
        .context("Invalid NEXUS_WORKER_STAGE")?;
    let socket = env::var("NEXUS_WORKER_SOCKET").context("NEXUS_WORKER_SOCKET is not set")?;
    let name = env::var("NEXUS_WORKER_NAME").unwrap_or_else(|_| format!("{}-worker", stage));

    let logging = LoggingConfig::from_env()?;
    init_logging(logging.to_log_config(&name)?).context("Failed to initialise logging")?;

    let stream = UnixStream::connect(&socket)
        .await
        .with_context(|| format!("Failed to connect to {}", socket))?;

    StageWorker::new(stage, name, Arc::new(BuiltinPlugins))
        .run(stream)
        .await
        .context("Stage worker failed")?;
    Ok(())
}
