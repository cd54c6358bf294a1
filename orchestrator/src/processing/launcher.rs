//! Starting stage worker processes and connecting to them

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use shared::types::Stage;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::worker::{PluginLoader, StageWorker};

pub trait WorkerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> WorkerStream for T {}

pub type BoxedStream = Box<dyn WorkerStream>;

/// Handle used to stop a worker
pub trait WorkerProcess: Send {
    fn kill(&mut self);
}

/// A started worker with its connection established
pub struct LaunchedWorker {
    pub stream: BoxedStream,
    pub process: Box<dyn WorkerProcess>,
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start one worker for `stage` and return once it has connected
    async fn launch(&self, stage: Stage, name: &str) -> Result<LaunchedWorker>;
}

struct ChildProcess(Child);

impl WorkerProcess for ChildProcess {
    fn kill(&mut self) {
        if let Err(e) = self.0.start_kill() {
            debug!(error = %e, "Worker process already gone");
        }
    }
}

/// Runs every worker as a separate `nexus-stage-worker` process talking
/// over its own Unix socket
pub struct ProcessLauncher {
    binary: PathBuf,
    socket_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(binary: PathBuf, socket_dir: PathBuf) -> Self {
        Self { binary, socket_dir }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, stage: Stage, name: &str) -> Result<LaunchedWorker> {
        tokio::fs::create_dir_all(&self.socket_dir).await?;
        let socket = self.socket_dir.join(format!("{}.sock", name));
        match tokio::fs::remove_file(&socket).await {
            Ok(()) => debug!(socket = %socket.display(), "Removed stale worker socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&socket)?;

        let child = Command::new(&self.binary)
            .env("NEXUS_WORKER_STAGE", stage.as_str())
            .env("NEXUS_WORKER_SOCKET", &socket)
            .env("NEXUS_WORKER_NAME", name)
            .kill_on_drop(true)
            .spawn()?;
        info!(worker = %name, stage = %stage, pid = ?child.id(), "Worker process spawned");

        let (stream, _) = listener.accept().await?;
        if let Err(e) = tokio::fs::remove_file(&socket).await {
            warn!(socket = %socket.display(), error = %e, "Could not remove worker socket");
        }

        Ok(LaunchedWorker {
            stream: Box::new(stream),
            process: Box::new(ChildProcess(child)),
        })
    }
}

struct WorkerTask(JoinHandle<()>);

impl WorkerProcess for WorkerTask {
    fn kill(&mut self) {
        self.0.abort();
    }
}

/// Runs every worker as a task inside this process, connected through an
/// in-memory pipe. Used for single-binary setups and pipeline tests.
pub struct InProcessLauncher {
    loader: Arc<dyn PluginLoader>,
}

impl InProcessLauncher {
    pub fn new(loader: Arc<dyn PluginLoader>) -> Self {
        Self { loader }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, stage: Stage, name: &str) -> Result<LaunchedWorker> {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let worker = StageWorker::new(stage, name, self.loader.clone());
        let task = tokio::spawn(async move {
            if let Err(e) = worker.run(theirs).await {
                debug!(error = %e, "In-process worker stopped");
            }
        });

        Ok(LaunchedWorker {
            stream: Box::new(ours),
            process: Box::new(WorkerTask(task)),
        })
    }
}
