use std::sync::Arc;

use anyhow::{Context, Result};
use nexus_orchestrator::config::Config;
use nexus_orchestrator::controller::{self, ControllerServer, StateController};
use nexus_orchestrator::machinery::{load_machines, MachineryBackend, MachineryManager, VirshBackend};
use nexus_orchestrator::processing::{ProcessLauncher, WorkerHandler};
use nexus_orchestrator::runner::{CommandTaskRunner, ImmediateTaskRunner, TaskRunner};
use nexus_orchestrator::storage::AnalysisStore;
use shared::observability::init_logging;
use shared::types::Stage;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    init_logging(config.logging.to_log_config("nexus-orchestrator")?)
        .context("Failed to initialise logging")?;

    info!("Starting Nexus sandbox orchestrator");

    let store = AnalysisStore::new(&config.storage);
    store.init().await.context("Failed to prepare storage")?;

    // Machinery
    let machines = load_machines(&config.machinery.machines_file)
        .await
        .with_context(|| {
            format!(
                "Failed to load machines from {}",
                config.machinery.machines_file.display()
            )
        })?;
    info!(machines = machines.len(), "Machine definitions loaded");
    let virsh: Arc<dyn MachineryBackend> = Arc::new(VirshBackend::new(
        config.machinery.libvirt_uri.clone(),
        store.root().join("memory"),
    ));
    let machinery = MachineryManager::start(machines, vec![virsh], &config.machinery)
        .await
        .context("Failed to start machinery manager")?;

    // Processing
    let (controller, inbox) = controller::channel();
    let launcher = Arc::new(ProcessLauncher::new(
        config.processing.worker_binary.clone(),
        config.processing.socket_dir.clone(),
    ));
    let (processing, processing_task) =
        WorkerHandler::spawn(&config.processing, launcher, Arc::new(controller.clone()));
    for stage in Stage::ALL {
        processing
            .start_stage(stage, config.processing.workers_for(stage))
            .await
            .with_context(|| format!("Failed to start {} workers", stage))?;
    }

    // Controller
    let runner: Arc<dyn TaskRunner> = match &config.runner.command {
        Some(command) => Arc::new(CommandTaskRunner::new(command, controller.clone())?),
        None => {
            warn!("TASK_RUNNER_COMMAND not set, tasks complete as soon as their machine is up");
            Arc::new(ImmediateTaskRunner::new(controller.clone()))
        }
    };
    let controller_task = StateController::new(
        &config,
        store,
        machinery.clone(),
        processing.clone(),
        runner,
        controller.clone(),
    )
    .spawn(inbox);

    let server = ControllerServer::bind(&config.controller.socket_path, controller.clone())
        .await
        .context("Failed to bind controller socket")?;
    info!("Orchestrator ready");

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Could not listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("Shutting down");
    controller.shutdown();
    let _ = controller_task.await;
    processing.shutdown();
    let _ = processing_task.await;
    machinery.shutdown();

    Ok(())
}
