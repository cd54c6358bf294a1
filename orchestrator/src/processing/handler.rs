use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use shared::messaging::{HandlerMessage, IpcChannel, WorkerMessage};
use shared::observability::worker_span;
use shared::types::{Stage, WorkItem};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

use super::launcher::{LaunchedWorker, WorkerLauncher};
use super::queue::StageQueues;
use super::slot::{SlotState, SlotStatus, WorkerSlot};
use crate::config::ProcessingConfig;
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Finished(serde_json::Value),
    Failed(String),
}

/// Result of one popped work item. Every popped item produces exactly one.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub stage: Stage,
    pub item: WorkItem,
    pub outcome: StageOutcome,
}

/// Receiver of stage completions. Must not block.
pub trait StageListener: Send + Sync {
    fn stage_done(&self, report: StageReport);
}

impl StageListener for mpsc::UnboundedSender<StageReport> {
    fn stage_done(&self, report: StageReport) {
        let _ = self.send(report);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HandlerStatus {
    pub queues: BTreeMap<Stage, usize>,
    pub workers: Vec<SlotStatus>,
}

impl HandlerStatus {
    /// Setup failures of retired workers, for the operator
    pub fn setup_failures(&self) -> Vec<&str> {
        self.workers
            .iter()
            .filter(|w| w.state == SlotState::Unusable)
            .filter_map(|w| w.last_error.as_deref())
            .collect()
    }

    pub fn count(&self, stage: Stage, state: SlotState) -> usize {
        self.workers
            .iter()
            .filter(|w| w.stage == stage && w.state == state)
            .count()
    }
}

enum HandlerCommand {
    Start {
        stage: Stage,
        count: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    Enqueue {
        stage: Stage,
        item: WorkItem,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<HandlerStatus>,
    },
    Shutdown,
}

enum SlotEvent {
    Launched {
        slot: usize,
        generation: u64,
        result: Result<LaunchedWorker>,
    },
    Message {
        slot: usize,
        generation: u64,
        message: WorkerMessage,
    },
    Disconnected {
        slot: usize,
        generation: u64,
        reason: String,
    },
}

/// Cheap handle to the worker handler task
#[derive(Clone)]
pub struct WorkerHandlerHandle {
    commands: mpsc::UnboundedSender<HandlerCommand>,
}

impl WorkerHandlerHandle {
    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> HandlerCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| OrchestratorError::ChannelClosed("worker handler"))?;
        rx.await
            .map_err(|_| OrchestratorError::ChannelClosed("worker handler"))
    }

    /// Launch `count` more workers for `stage`
    pub async fn start_stage(&self, stage: Stage, count: usize) -> Result<()> {
        self.call(|reply| HandlerCommand::Start {
            stage,
            count,
            reply,
        })
        .await?
    }

    pub async fn enqueue(&self, stage: Stage, item: WorkItem) -> Result<()> {
        self.call(|reply| HandlerCommand::Enqueue { stage, item, reply })
            .await?
    }

    pub async fn status(&self) -> Result<HandlerStatus> {
        self.call(|reply| HandlerCommand::Status { reply }).await
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(HandlerCommand::Shutdown);
    }
}

/// Processing worker handler.
///
/// Owns the stage queues and the worker slots on a single task. Slot
/// state changes only on worker messages, assignment, deadlines and
/// lost connections.
pub struct WorkerHandler {
    launcher: Arc<dyn WorkerLauncher>,
    listener: Arc<dyn StageListener>,
    setup_timeout: Duration,
    work_timeout: Option<Duration>,
    max_restarts: u32,
    queues: StageQueues,
    slots: Vec<WorkerSlot>,
    events: mpsc::UnboundedSender<SlotEvent>,
}

impl WorkerHandler {
    pub fn spawn(
        config: &ProcessingConfig,
        launcher: Arc<dyn WorkerLauncher>,
        listener: Arc<dyn StageListener>,
    ) -> (WorkerHandlerHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let handler = Self {
            launcher,
            listener,
            setup_timeout: config.setup_timeout(),
            work_timeout: config.work_timeout(),
            max_restarts: config.max_restarts,
            queues: StageQueues::default(),
            slots: Vec::new(),
            events: events_tx,
        };
        let tick = config.dispatch_tick();
        let task = tokio::spawn(handler.run(commands_rx, events_rx, tick));

        (
            WorkerHandlerHandle {
                commands: commands_tx,
            },
            task,
        )
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<HandlerCommand>,
        mut events: mpsc::UnboundedReceiver<SlotEvent>,
        tick: Duration,
    ) {
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Worker handler started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(HandlerCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = ticker.tick() => {}
            }

            self.check_deadlines();
            self.dispatch().await;
        }

        for slot in &mut self.slots {
            slot.kill();
        }
        info!("Worker handler stopped");
    }

    fn handle_command(&mut self, command: HandlerCommand) {
        match command {
            HandlerCommand::Start {
                stage,
                count,
                reply,
            } => {
                for _ in 0..count {
                    let n = self.slots.iter().filter(|s| s.stage == stage).count() + 1;
                    let id = self.slots.len();
                    self.slots
                        .push(WorkerSlot::new(format!("{}-{}", stage, n), stage));
                    self.launch(id);
                }
                info!(stage = %stage, count, "Stage workers starting");
                let _ = reply.send(Ok(()));
            }
            HandlerCommand::Enqueue { stage, item, reply } => {
                let result = if self.slots.iter().any(|s| s.stage == stage) {
                    debug!(stage = %stage, analysis_id = %item.analysis_id, task_id = ?item.task_id, "Work queued");
                    self.queues.push(stage, item);
                    Ok(())
                } else {
                    Err(OrchestratorError::unknown_stage(stage))
                };
                let _ = reply.send(result);
            }
            HandlerCommand::Status { reply } => {
                let _ = reply.send(HandlerStatus {
                    queues: self.queues.lengths(),
                    workers: self.slots.iter().map(WorkerSlot::status).collect(),
                });
            }
            HandlerCommand::Shutdown => {}
        }
    }

    fn launch(&mut self, id: usize) {
        let setup_timeout = self.setup_timeout;
        let slot = &mut self.slots[id];
        slot.kill();
        slot.generation += 1;
        slot.state = SlotState::Setup;
        slot.deadline = Some(Instant::now() + setup_timeout);

        let generation = slot.generation;
        let stage = slot.stage;
        let name = slot.name.clone();
        let launcher = self.launcher.clone();
        let events = self.events.clone();
        let span = worker_span(stage, &name);

        slot.launch_task = Some(tokio::spawn(
            async move {
                let result = launcher.launch(stage, &name).await;
                let _ = events.send(SlotEvent::Launched {
                    slot: id,
                    generation,
                    result,
                });
            }
            .instrument(span),
        ));
    }

    fn is_current(&self, id: usize, generation: u64) -> bool {
        self.slots
            .get(id)
            .map_or(false, |s| s.generation == generation && s.state != SlotState::Unusable)
    }

    fn handle_event(&mut self, event: SlotEvent) {
        match event {
            SlotEvent::Launched {
                slot: id,
                generation,
                result,
            } => {
                let current = self.is_current(id, generation)
                    && self.slots[id].state == SlotState::Setup
                    && self.slots[id].writer.is_none();
                if !current {
                    if let Ok(mut worker) = result {
                        worker.process.kill();
                    }
                    return;
                }
                match result {
                    Ok(worker) => self.connect(id, generation, worker),
                    Err(e) => {
                        warn!(worker = %self.slots[id].name, error = %e, "Worker launch failed");
                        self.restart(id, "launch failed");
                    }
                }
            }
            SlotEvent::Message {
                slot: id,
                generation,
                message,
            } => {
                if self.is_current(id, generation) {
                    self.on_worker_message(id, message);
                }
            }
            SlotEvent::Disconnected {
                slot: id,
                generation,
                reason,
            } => {
                if self.is_current(id, generation) {
                    self.on_crash(id, &reason);
                }
            }
        }
    }

    fn connect(&mut self, id: usize, generation: u64, worker: LaunchedWorker) {
        let slot = &mut self.slots[id];
        let (mut reader, writer) = IpcChannel::new(worker.stream).into_split();
        slot.writer = Some(writer);
        slot.process = Some(worker.process);
        slot.launch_task = None;

        let events = self.events.clone();
        let span = worker_span(slot.stage, &slot.name);
        slot.reader_task = Some(tokio::spawn(
            async move {
                loop {
                    match reader.recv::<WorkerMessage>().await {
                        Ok(message) => {
                            let event = SlotEvent::Message {
                                slot: id,
                                generation,
                                message,
                            };
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.is_recoverable() => {
                            warn!(error = %e, "Discarding malformed worker frame");
                        }
                        Err(e) => {
                            let _ = events.send(SlotEvent::Disconnected {
                                slot: id,
                                generation,
                                reason: e.to_string(),
                            });
                            break;
                        }
                    }
                }
            }
            .instrument(span),
        ));
        debug!(worker = %slot.name, "Worker connected, waiting for READY");
    }

    fn on_worker_message(&mut self, id: usize, message: WorkerMessage) {
        let setup_timeout = self.setup_timeout;
        let slot = &mut self.slots[id];
        let outcome = match (slot.state, message) {
            (SlotState::Setup, WorkerMessage::Ready) => {
                info!(worker = %slot.name, stage = %slot.stage, "Worker ready");
                slot.state = SlotState::Idle;
                slot.deadline = None;
                slot.restarts = 0;
                slot.last_error = None;
                None
            }
            (SlotState::Returning, WorkerMessage::Ready) => {
                slot.state = SlotState::Idle;
                slot.deadline = None;
                None
            }
            (SlotState::Idle, WorkerMessage::Ready) => None,
            (SlotState::Working, WorkerMessage::Finished { result }) => {
                Some(StageOutcome::Finished(result))
            }
            (SlotState::Working, WorkerMessage::WorkFail { error }) => {
                Some(StageOutcome::Failed(error))
            }
            (SlotState::Setup, WorkerMessage::SetupFail { error }) => {
                let failure = OrchestratorError::SetupFailed {
                    target: slot.name.clone(),
                    reason: error,
                };
                error!(worker = %slot.name, stage = %slot.stage, error = %failure, "Worker setup failed, slot retired");
                slot.kill();
                slot.state = SlotState::Unusable;
                slot.last_error = Some(failure.to_string());
                None
            }
            (state, message) => {
                warn!(worker = %slot.name, state = ?state, subject = message.subject(), "Unexpected worker message");
                None
            }
        };

        if let Some(outcome) = outcome {
            // Not dispatchable again until the worker's READY
            slot.state = SlotState::Returning;
            slot.deadline = Some(Instant::now() + setup_timeout);
            if let Some(item) = slot.current.take() {
                debug!(worker = %slot.name, analysis_id = %item.analysis_id, "Work item resolved");
                self.listener.stage_done(StageReport {
                    stage: slot.stage,
                    item,
                    outcome,
                });
            }
        }
    }

    /// Connection lost or deadline missed: fail the outstanding item, relaunch
    fn on_crash(&mut self, id: usize, reason: &str) {
        let slot = &mut self.slots[id];
        warn!(worker = %slot.name, reason = %reason, "Worker lost");
        if let Some(item) = slot.current.take() {
            self.listener.stage_done(StageReport {
                stage: slot.stage,
                item,
                outcome: StageOutcome::Failed(format!("worker lost: {}", reason)),
            });
        }
        self.restart(id, reason);
    }

    fn restart(&mut self, id: usize, reason: &str) {
        let max_restarts = self.max_restarts;
        let slot = &mut self.slots[id];
        slot.kill();
        if slot.restarts >= max_restarts {
            let failure = OrchestratorError::SetupFailed {
                target: slot.name.clone(),
                reason: format!("{} after {} restarts", reason, slot.restarts),
            };
            error!(worker = %slot.name, restarts = slot.restarts, error = %failure, "Worker out of restarts, slot retired");
            slot.state = SlotState::Unusable;
            slot.last_error = Some(failure.to_string());
            return;
        }
        slot.restarts += 1;
        info!(worker = %slot.name, attempt = slot.restarts, "Relaunching worker");
        self.launch(id);
    }

    fn check_deadlines(&mut self) {
        let now = Instant::now();
        for id in 0..self.slots.len() {
            let slot = &self.slots[id];
            match (slot.state, slot.deadline) {
                (SlotState::Setup, Some(deadline)) if now >= deadline => {
                    warn!(worker = %slot.name, "Worker did not become ready in time");
                    self.restart(id, "setup timeout");
                }
                (SlotState::Working, Some(deadline)) if now >= deadline => {
                    self.on_crash(id, "work deadline exceeded");
                }
                (SlotState::Returning, Some(deadline)) if now >= deadline => {
                    warn!(worker = %slot.name, "Worker did not return to READY in time");
                    self.restart(id, "ready timeout");
                }
                _ => {}
            }
        }
    }

    /// Hand queued items to idle workers of the same stage, oldest first
    async fn dispatch(&mut self) {
        for stage in Stage::ALL {
            while !self.queues.is_empty(stage) {
                let Some(id) = self.slots.iter().position(|s| s.is_idle_for(stage)) else {
                    break;
                };
                let Some(item) = self.queues.pop(stage) else {
                    break;
                };

                let sent = match self.slots[id].writer.as_mut() {
                    Some(writer) => writer.send(&HandlerMessage::Work(item.clone())).await,
                    None => {
                        self.queues.push_front(stage, item);
                        break;
                    }
                };

                match sent {
                    Ok(()) => {
                        let work_timeout = self.work_timeout;
                        let slot = &mut self.slots[id];
                        debug!(worker = %slot.name, analysis_id = %item.analysis_id, "Work assigned");
                        slot.state = SlotState::Working;
                        slot.current = Some(item);
                        slot.deadline = work_timeout.map(|t| Instant::now() + t);
                    }
                    Err(e) => {
                        // Never delivered, so it goes back to the head of the queue
                        self.queues.push_front(stage, item);
                        self.on_crash(id, &e.to_string());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::launcher::{BoxedStream, WorkerProcess};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Script {
        Healthy,
        SetupFail,
        Silent,
        CrashOnWork,
        HangOnWork,
        /// Reports the result, then takes a while to send `READY`
        SlowReady,
        /// Reports one result and never sends `READY` again
        StallAfterWork,
    }

    struct Task(JoinHandle<()>);

    impl WorkerProcess for Task {
        fn kill(&mut self) {
            self.0.abort();
        }
    }

    /// Launches scripted in-memory workers. Scripts are consumed per worker
    /// name; the last one repeats.
    #[derive(Default)]
    struct ScriptedLauncher {
        scripts: Mutex<HashMap<String, Vec<Script>>>,
        launches: Mutex<Vec<String>>,
    }

    impl ScriptedLauncher {
        fn script(&self, name: &str, scripts: Vec<Script>) {
            self.scripts.lock().unwrap().insert(name.to_string(), scripts);
        }

        fn launches_of(&self, name: &str) -> usize {
            self.launches
                .lock()
                .unwrap()
                .iter()
                .filter(|n| *n == name)
                .count()
        }
    }

    async fn scripted_worker(stream: tokio::io::DuplexStream, script: Script) {
        let (mut reader, mut writer) = IpcChannel::new(stream).into_split();
        match script {
            Script::SetupFail => {
                let _ = writer
                    .send(&WorkerMessage::SetupFail {
                        error: "no plugins".to_string(),
                    })
                    .await;
                let _ = reader.recv::<HandlerMessage>().await;
                panic!("a worker that failed setup received work");
            }
            Script::Silent => std::future::pending::<()>().await,
            _ => {
                let _ = writer.send(&WorkerMessage::Ready).await;
                while let Ok(HandlerMessage::Work(item)) = reader.recv().await {
                    match script {
                        Script::CrashOnWork => return,
                        Script::HangOnWork => std::future::pending::<()>().await,
                        Script::SlowReady => {
                            let result = json!({"analysis_id": item.analysis_id});
                            let _ = writer.send(&WorkerMessage::Finished { result }).await;
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            let _ = writer.send(&WorkerMessage::Ready).await;
                        }
                        Script::StallAfterWork => {
                            let result = json!({"analysis_id": item.analysis_id});
                            let _ = writer.send(&WorkerMessage::Finished { result }).await;
                            std::future::pending::<()>().await;
                        }
                        _ => {
                            let result = json!({"analysis_id": item.analysis_id});
                            let _ = writer.send(&WorkerMessage::Finished { result }).await;
                            let _ = writer.send(&WorkerMessage::Ready).await;
                        }
                    }
                }
            }
        }
    }

    #[async_trait]
    impl WorkerLauncher for ScriptedLauncher {
        async fn launch(&self, _stage: Stage, name: &str) -> Result<LaunchedWorker> {
            let script = {
                let mut scripts = self.scripts.lock().unwrap();
                let queue = scripts.entry(name.to_string()).or_default();
                match queue.len() {
                    0 => Script::Healthy,
                    1 => queue[0],
                    _ => queue.remove(0),
                }
            };
            self.launches.lock().unwrap().push(name.to_string());

            let (ours, theirs) = tokio::io::duplex(8 * 1024);
            let task = tokio::spawn(scripted_worker(theirs, script));
            let stream: BoxedStream = Box::new(ours);
            Ok(LaunchedWorker {
                stream,
                process: Box::new(Task(task)),
            })
        }
    }

    fn config(workers: usize) -> ProcessingConfig {
        ProcessingConfig {
            identification_workers: workers,
            pre_workers: workers,
            post_workers: workers,
            setup_timeout_seconds: 10,
            work_timeout_seconds: 0,
            max_restarts: 2,
            dispatch_tick_ms: 100,
            ..ProcessingConfig::default()
        }
    }

    fn spawn(
        config: &ProcessingConfig,
        launcher: Arc<ScriptedLauncher>,
    ) -> (WorkerHandlerHandle, mpsc::UnboundedReceiver<StageReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (handle, _task) = WorkerHandler::spawn(config, launcher, Arc::new(tx));
        (handle, rx)
    }

    fn item(n: usize) -> WorkItem {
        WorkItem::for_analysis(format!("20240101-00000{}", n), format!("/tmp/{}", n))
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_worker_preserves_fifo() {
        let launcher = Arc::new(ScriptedLauncher::default());
        let (handle, mut reports) = spawn(&config(1), launcher);
        handle.start_stage(Stage::Identification, 1).await.unwrap();

        for n in 0..3 {
            handle.enqueue(Stage::Identification, item(n)).await.unwrap();
        }
        for n in 0..3 {
            let report = reports.recv().await.unwrap();
            assert_eq!(report.item, item(n));
            assert_eq!(
                report.outcome,
                StageOutcome::Finished(json!({"analysis_id": item(n).analysis_id}))
            );
        }
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_item_dispatched_twice() {
        let launcher = Arc::new(ScriptedLauncher::default());
        let (handle, mut reports) = spawn(&config(3), launcher);
        handle.start_stage(Stage::Pre, 3).await.unwrap();

        for n in 0..9 {
            handle.enqueue(Stage::Pre, item(n)).await.unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..9 {
            seen.push(reports.recv().await.unwrap().item.analysis_id);
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 9);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(reports.try_recv().is_err());
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_ready_does_not_misattribute_results() {
        let launcher = Arc::new(ScriptedLauncher::default());
        launcher.script("identification-1", vec![Script::SlowReady]);
        let (handle, mut reports) = spawn(&config(1), launcher);
        handle.start_stage(Stage::Identification, 1).await.unwrap();

        for n in 0..3 {
            handle.enqueue(Stage::Identification, item(n)).await.unwrap();
        }
        for n in 0..3 {
            let report = reports.recv().await.unwrap();
            assert_eq!(report.item, item(n));
            assert_eq!(
                report.outcome,
                StageOutcome::Finished(json!({"analysis_id": item(n).analysis_id}))
            );
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(reports.try_recv().is_err());
        let status = handle.status().await.unwrap();
        assert_eq!(status.count(Stage::Identification, SlotState::Idle), 1);
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_stuck_after_result_is_relaunched() {
        let launcher = Arc::new(ScriptedLauncher::default());
        launcher.script("post-1", vec![Script::StallAfterWork, Script::Healthy]);
        let (handle, mut reports) = spawn(&config(1), launcher.clone());
        handle.start_stage(Stage::Post, 1).await.unwrap();

        handle.enqueue(Stage::Post, item(1)).await.unwrap();
        handle.enqueue(Stage::Post, item(2)).await.unwrap();

        for n in 1..=2 {
            let report = reports.recv().await.unwrap();
            assert_eq!(report.item, item(n));
            assert!(matches!(report.outcome, StageOutcome::Finished(_)));
        }
        assert_eq!(launcher.launches_of("post-1"), 2);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_stage_rejected() {
        let launcher = Arc::new(ScriptedLauncher::default());
        let (handle, _reports) = spawn(&config(1), launcher);
        handle.start_stage(Stage::Identification, 1).await.unwrap();

        assert!(matches!(
            handle.enqueue(Stage::Post, item(0)).await,
            Err(OrchestratorError::UnknownStage(_))
        ));
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_fail_worker_never_gets_work() {
        let launcher = Arc::new(ScriptedLauncher::default());
        launcher.script("pre-1", vec![Script::SetupFail]);
        let (handle, mut reports) = spawn(&config(1), launcher.clone());
        handle.start_stage(Stage::Pre, 1).await.unwrap();
        handle.enqueue(Stage::Pre, item(0)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(reports.try_recv().is_err());
        let status = handle.status().await.unwrap();
        assert_eq!(status.count(Stage::Pre, SlotState::Unusable), 1);
        assert_eq!(status.queues[&Stage::Pre], 1);
        assert_eq!(launcher.launches_of("pre-1"), 1);
        assert_eq!(
            status.setup_failures(),
            vec!["Setup failed for pre-1: no plugins"]
        );

        // The queued item waits for the next idle worker of its stage
        handle.start_stage(Stage::Pre, 1).await.unwrap();
        let report = reports.recv().await.unwrap();
        assert_eq!(report.item, item(0));
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_timeout_relaunches_then_retires() {
        let launcher = Arc::new(ScriptedLauncher::default());
        launcher.script("identification-1", vec![Script::Silent]);
        let (handle, _reports) = spawn(&config(1), launcher.clone());
        handle.start_stage(Stage::Identification, 1).await.unwrap();

        tokio::time::sleep(Duration::from_secs(45)).await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.count(Stage::Identification, SlotState::Unusable), 1);
        assert_eq!(launcher.launches_of("identification-1"), 3);
        let failures = status.setup_failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].starts_with("Setup failed for identification-1: setup timeout"));
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_timeout_recovers_on_healthy_relaunch() {
        let launcher = Arc::new(ScriptedLauncher::default());
        launcher.script("identification-1", vec![Script::Silent, Script::Healthy]);
        let (handle, mut reports) = spawn(&config(1), launcher.clone());
        handle.start_stage(Stage::Identification, 1).await.unwrap();
        handle.enqueue(Stage::Identification, item(1)).await.unwrap();

        let report = reports.recv().await.unwrap();
        assert!(matches!(report.outcome, StageOutcome::Finished(_)));
        assert_eq!(launcher.launches_of("identification-1"), 2);
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_fails_item_and_relaunches() {
        let launcher = Arc::new(ScriptedLauncher::default());
        launcher.script("post-1", vec![Script::CrashOnWork, Script::Healthy]);
        let (handle, mut reports) = spawn(&config(1), launcher.clone());
        handle.start_stage(Stage::Post, 1).await.unwrap();

        handle.enqueue(Stage::Post, item(1)).await.unwrap();
        handle.enqueue(Stage::Post, item(2)).await.unwrap();

        let first = reports.recv().await.unwrap();
        assert_eq!(first.item, item(1));
        assert!(matches!(first.outcome, StageOutcome::Failed(_)));

        let second = reports.recv().await.unwrap();
        assert_eq!(second.item, item(2));
        assert!(matches!(second.outcome, StageOutcome::Finished(_)));
        assert_eq!(launcher.launches_of("post-1"), 2);
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_deadline_counts_as_crash() {
        let launcher = Arc::new(ScriptedLauncher::default());
        launcher.script("pre-1", vec![Script::HangOnWork, Script::Healthy]);
        let mut config = config(1);
        config.work_timeout_seconds = 5;
        let (handle, mut reports) = spawn(&config, launcher);
        handle.start_stage(Stage::Pre, 1).await.unwrap();

        let began = Instant::now();
        handle.enqueue(Stage::Pre, item(3)).await.unwrap();
        let report = reports.recv().await.unwrap();
        assert!(matches!(report.outcome, StageOutcome::Failed(_)));
        assert!(began.elapsed() >= Duration::from_secs(5));
        handle.shutdown();
    }
}
