use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::{json, Value};
use shared::types::{
    analysis_id_of_task, new_analysis_id, AnalysisId, Stage, SubmittedTarget, TaskId, WorkItem,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::handle::{ControllerCommand, ControllerHandle, ControllerInbox};
use super::messages::ControllerMessage;
use super::policy;
use crate::config::{AnalysisConfig, Config};
use crate::error::{OrchestratorError, Result};
use crate::machinery::{
    ActionReply, ActionRequest, Fallback, FailureReason, MachineAction, MachineryManager,
};
use crate::models::{Analysis, AnalysisState, Machine, Submission, Task, TaskState};
use crate::processing::WorkerHandlerHandle;
use crate::runner::{TaskAssignment, TaskRunner};
use crate::storage::AnalysisStore;

/// Scheduling order: higher priority first, then creation order
type PendingKey = (Reverse<u32>, u64);

/// The single writer of analysis and task state.
///
/// Every mutation happens inside [`StateController::run`], one command at
/// a time. Other components only talk to it through a [`ControllerHandle`].
pub struct StateController {
    config: AnalysisConfig,
    start_timeout: Duration,
    stop_timeout: Duration,
    store: AnalysisStore,
    machinery: MachineryManager,
    processing: WorkerHandlerHandle,
    runner: Arc<dyn TaskRunner>,
    handle: ControllerHandle,
    /// Non-terminal records; terminal ones are read back from storage
    analyses: HashMap<AnalysisId, Analysis>,
    tasks: HashMap<TaskId, Task>,
    pending: BTreeMap<PendingKey, TaskId>,
    sequence: u64,
}

fn advance(analysis: &mut Analysis, next: AnalysisState) -> Result<()> {
    let from = analysis.state;
    analysis.set_state(next)?;
    info!(analysis_id = %analysis.id, from = %from, to = %next, "Analysis state changed");
    Ok(())
}

fn advance_task(task: &mut Task, next: TaskState) -> Result<()> {
    let from = task.state;
    task.set_state(next)?;
    info!(task_id = %task.id, from = %from, to = %next, "Task state changed");
    Ok(())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl StateController {
    pub fn new(
        config: &Config,
        store: AnalysisStore,
        machinery: MachineryManager,
        processing: WorkerHandlerHandle,
        runner: Arc<dyn TaskRunner>,
        handle: ControllerHandle,
    ) -> Self {
        Self {
            config: config.analysis.clone(),
            start_timeout: config.machinery.start_timeout(),
            stop_timeout: config.machinery.stop_timeout(),
            store,
            machinery,
            processing,
            runner,
            handle,
            analyses: HashMap::new(),
            tasks: HashMap::new(),
            pending: BTreeMap::new(),
            sequence: 0,
        }
    }

    pub fn spawn(self, inbox: ControllerInbox) -> JoinHandle<()> {
        tokio::spawn(self.run(inbox))
    }

    async fn run(mut self, mut inbox: ControllerInbox) {
        info!("State controller started");

        while let Some(command) = inbox.commands.recv().await {
            let subject = match &command {
                ControllerCommand::Shutdown => break,
                ControllerCommand::Message { message, .. } => message.subject(),
                ControllerCommand::MachineReply { .. } => "machine_reply",
            };

            let span = tracing::info_span!("controller", subject = subject);
            let outcome = AssertUnwindSafe(self.handle_command(command))
                .catch_unwind()
                .instrument(span)
                .await;
            if let Err(panic) = outcome {
                error!(subject, panic = %panic_message(&*panic), "Controller handler panicked");
            }
        }

        info!("State controller stopped");
    }

    async fn handle_command(&mut self, command: ControllerCommand) {
        match command {
            ControllerCommand::Message { message, reply } => {
                let subject = message.subject();
                let result = self.handle_message(message).await;
                match &result {
                    Err(e @ OrchestratorError::InvalidSubmission(_)) => {
                        warn!(subject, error = %e, "Submission rejected")
                    }
                    Err(e) => error!(subject, error = %e, "Controller handler failed"),
                    Ok(_) => {}
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            ControllerCommand::MachineReply {
                task_id,
                machine,
                action,
                reply,
            } => {
                let result = match action {
                    MachineAction::Start => self.on_machine_started(&task_id, machine, reply).await,
                    _ => self.on_machine_stopped(&task_id, &machine, reply).await,
                };
                if let Err(e) = result {
                    error!(task_id = %task_id, error = %e, "Machine reply handling failed");
                }
            }
            ControllerCommand::Shutdown => {}
        }
    }

    async fn handle_message(&mut self, message: ControllerMessage) -> Result<Value> {
        match message {
            ControllerMessage::Submit(submission) => {
                let analysis_id = self.submit(submission).await?;
                Ok(json!({ "analysis_id": analysis_id }))
            }
            ControllerMessage::IdentificationDone {
                analysis_id,
                result,
            } => {
                debug!(analysis_id = %analysis_id, result = %result, "Identification result");
                self.on_identification_done(&analysis_id).await?;
                Ok(Value::Null)
            }
            ControllerMessage::PreDone {
                analysis_id,
                result,
            } => {
                debug!(analysis_id = %analysis_id, result = %result, "Pre-processing result");
                self.on_pre_done(&analysis_id).await?;
                Ok(Value::Null)
            }
            ControllerMessage::TaskDone { task_id, error } => {
                self.on_task_done(&task_id, error).await?;
                Ok(Value::Null)
            }
            ControllerMessage::PostDone { task_id, result } => {
                debug!(task_id = %task_id, result = %result, "Post-processing result");
                self.on_post_done(&task_id).await?;
                Ok(Value::Null)
            }
            ControllerMessage::StageFailed {
                stage,
                analysis_id,
                task_id,
                error,
            } => {
                self.on_stage_failed(stage, &analysis_id, task_id.as_deref(), error)
                    .await?;
                Ok(Value::Null)
            }
            ControllerMessage::DisableMachine { machine } => {
                self.machinery.disable(&machine).await?;
                Ok(Value::Null)
            }
            ControllerMessage::GetAnalysis { analysis_id } => {
                let analysis = self.analysis(&analysis_id).await?;
                Ok(serde_json::to_value(analysis)?)
            }
        }
    }

    // Records

    async fn analysis(&self, analysis_id: &str) -> Result<Analysis> {
        match self.analyses.get(analysis_id) {
            Some(analysis) => Ok(analysis.clone()),
            None => self.store.load_analysis(analysis_id).await,
        }
    }

    async fn commit_analysis(&mut self, analysis: Analysis) -> Result<()> {
        self.store.save_analysis(&analysis).await?;
        if analysis.state.is_terminal() {
            self.analyses.remove(&analysis.id);
        } else {
            self.analyses.insert(analysis.id.clone(), analysis);
        }
        Ok(())
    }

    async fn task(&self, task_id: &str) -> Result<Task> {
        if let Some(task) = self.tasks.get(task_id) {
            return Ok(task.clone());
        }
        let analysis_id = analysis_id_of_task(task_id)
            .ok_or_else(|| OrchestratorError::NotFound(task_id.to_string()))?;
        self.store.load_task(analysis_id, task_id).await
    }

    async fn commit_task(&mut self, task: Task) -> Result<()> {
        self.store.save_task(&task).await?;
        if task.state.is_terminal() {
            self.tasks.remove(&task.id);
        } else {
            self.tasks.insert(task.id.clone(), task);
        }
        Ok(())
    }

    // Analysis pipeline

    async fn submit(&mut self, submission: Submission) -> Result<AnalysisId> {
        let settings = policy::resolve_settings(&self.config, &submission.settings)?;
        let submitted = self.store.stage(&submission.target).await?;

        let mut analysis_id = new_analysis_id();
        while self.analyses.contains_key(&analysis_id)
            || tokio::fs::try_exists(self.store.analysis_path(&analysis_id)).await?
        {
            analysis_id = new_analysis_id();
        }

        let analysis = Analysis::new(analysis_id.clone(), submitted, settings);
        let path = self.store.create_analysis(&analysis).await?;
        self.analyses.insert(analysis_id.clone(), analysis);
        info!(analysis_id = %analysis_id, "Analysis created");

        let item = WorkItem::for_analysis(analysis_id.clone(), path);
        if let Err(e) = self.processing.enqueue(Stage::Identification, item).await {
            self.fail_analysis(&analysis_id, format!("identification not queued: {}", e))
                .await?;
        }
        Ok(analysis_id)
    }

    async fn on_identification_done(&mut self, analysis_id: &str) -> Result<()> {
        let mut analysis = self.analysis(analysis_id).await?;
        if analysis.state != AnalysisState::Pending {
            return Err(OrchestratorError::InvalidTransition {
                id: analysis.id,
                from: analysis.state.to_string(),
                to: AnalysisState::Identified.to_string(),
            });
        }

        let identification = match self.store.read_identification(analysis_id).await {
            Ok(identification) => identification,
            Err(e) => {
                return self
                    .fail_analysis(analysis_id, format!("identification result unusable: {}", e))
                    .await
            }
        };

        if identification.selected {
            analysis.category = Some(identification.category);
        } else if self.config.cancel_unidentified {
            analysis.category = Some(identification.category);
            analysis
                .errors
                .push("identification selected no target".to_string());
            advance(&mut analysis, AnalysisState::Cancelled)?;
            return self.commit_analysis(analysis).await;
        } else {
            analysis.category = Some("unidentified".to_string());
        }
        if let Some(parent) = &identification.parent {
            debug!(analysis_id = %analysis_id, parent = %parent, "Target selected from archive");
        }
        analysis.target = Some(identification.target);
        advance(&mut analysis, AnalysisState::Identified)?;
        self.commit_analysis(analysis).await?;

        let item = WorkItem::for_analysis(analysis_id, self.store.analysis_path(analysis_id));
        if let Err(e) = self.processing.enqueue(Stage::Pre, item).await {
            self.fail_analysis(analysis_id, format!("pre stage not queued: {}", e))
                .await?;
        }
        Ok(())
    }

    async fn on_pre_done(&mut self, analysis_id: &str) -> Result<()> {
        let mut analysis = self.analysis(analysis_id).await?;
        if analysis.state != AnalysisState::Identified {
            return Err(OrchestratorError::InvalidTransition {
                id: analysis.id,
                from: analysis.state.to_string(),
                to: AnalysisState::PreDone.to_string(),
            });
        }

        let pre = match self.store.read_pre(analysis_id).await {
            Ok(pre) => pre,
            Err(e) => {
                return self
                    .fail_analysis(analysis_id, format!("pre result unusable: {}", e))
                    .await
            }
        };

        let available = self.machinery.available_platforms().await;
        let platforms = policy::resolve_platforms(
            &analysis.settings.platforms,
            &pre.platforms,
            &self.config.default_platform,
            &available,
            self.config.max_platforms,
        );
        if platforms.is_empty() {
            return self
                .fail_analysis(analysis_id, "no machines for the requested platforms".to_string())
                .await;
        }

        advance(&mut analysis, AnalysisState::PreDone)?;
        let mut tasks = Vec::with_capacity(platforms.len());
        for (n, platform) in platforms.into_iter().enumerate() {
            let task = Task::new(
                &analysis.id,
                n + 1,
                platform,
                analysis.settings.timeout,
                analysis.settings.priority,
                analysis.settings.tags.clone(),
            );
            self.store.save_task(&task).await?;
            analysis.tasks.push(task.id.clone());
            tasks.push(task);
        }
        self.commit_analysis(analysis).await?;

        for task in tasks {
            info!(task_id = %task.id, platform = %task.platform, priority = task.priority, "Task created");
            self.pending
                .insert((Reverse(task.priority), self.sequence), task.id.clone());
            self.sequence += 1;
            self.tasks.insert(task.id.clone(), task);
        }
        self.schedule().await;
        Ok(())
    }

    async fn fail_analysis(&mut self, analysis_id: &str, reason: String) -> Result<()> {
        let mut analysis = self.analysis(analysis_id).await?;
        if analysis.state.is_terminal() {
            return Ok(());
        }
        error!(analysis_id = %analysis_id, reason = %reason, "Analysis failed");
        analysis.errors.push(reason);
        advance(&mut analysis, AnalysisState::FatalError)?;
        self.commit_analysis(analysis).await
    }

    /// Close the analysis once every task is terminal
    async fn check_analysis(&mut self, analysis_id: &str) -> Result<()> {
        let mut analysis = self.analysis(analysis_id).await?;
        if analysis.state != AnalysisState::PreDone {
            return Ok(());
        }

        let mut any_reported = false;
        for task_id in &analysis.tasks {
            let task = self.task(task_id).await?;
            if !task.state.is_terminal() {
                return Ok(());
            }
            any_reported |= task.state == TaskState::Reported;
        }

        let next = if any_reported {
            AnalysisState::Reported
        } else {
            AnalysisState::FatalError
        };
        advance(&mut analysis, next)?;
        self.commit_analysis(analysis).await
    }

    // Tasks and machines

    /// Bind idle machines to pending tasks and start them
    async fn schedule(&mut self) {
        let queued: Vec<(PendingKey, TaskId)> = self
            .pending
            .iter()
            .map(|(key, id)| (*key, id.clone()))
            .collect();

        for (key, task_id) in queued {
            let task = match self.tasks.get(&task_id) {
                Some(task) if task.state == TaskState::Pending && task.machine.is_none() => {
                    task.clone()
                }
                _ => {
                    self.pending.remove(&key);
                    continue;
                }
            };

            match self
                .machinery
                .acquire(&task.platform, &task.tags, &task.id)
                .await
            {
                Some(machine) => {
                    self.pending.remove(&key);
                    if let Err(e) = self.start_task(task, machine).await {
                        error!(task_id = %task_id, error = %e, "Task could not be started");
                    }
                }
                None if !self.machinery.can_serve(&task.platform, &task.tags).await => {
                    self.pending.remove(&key);
                    let reason = format!("no enabled machine left for {}", task.platform);
                    if let Err(e) = self.fail_pending_task(&task_id, reason).await {
                        error!(task_id = %task_id, error = %e, "Task could not be failed");
                    }
                }
                None => {}
            }
        }
    }

    async fn start_task(&mut self, mut task: Task, machine: Machine) -> Result<()> {
        task.machine = Some(machine.name.clone());
        if let Err(e) = self.commit_task(task.clone()).await {
            self.release_machine(&machine.name).await;
            if let Some(stored) = self.tasks.get_mut(&task.id) {
                stored.machine = None;
            }
            self.pending
                .insert((Reverse(task.priority), self.sequence), task.id.clone());
            self.sequence += 1;
            return Err(e);
        }

        let request = ActionRequest::new(&machine.name, MachineAction::Start, self.start_timeout)
            .with_fallback(Fallback::new(MachineAction::Stop, self.stop_timeout));
        match self.machinery.request_action(request).await {
            Ok(reply) => {
                info!(task_id = %task.id, machine = %machine.name, "Starting machine for task");
                self.forward_reply(task.id, machine.name, MachineAction::Start, reply);
                Ok(())
            }
            Err(e) => {
                warn!(task_id = %task.id, machine = %machine.name, error = %e, "Machine start refused");
                self.handle.machine_reply(
                    task.id,
                    machine.name,
                    MachineAction::Start,
                    ActionReply::failure(FailureReason::Exception),
                )
            }
        }
    }

    /// Hand the machinery reply back to the controller inbox
    fn forward_reply(
        &self,
        task_id: TaskId,
        machine: String,
        action: MachineAction,
        reply: oneshot::Receiver<ActionReply>,
    ) {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let reply = reply
                .await
                .unwrap_or_else(|_| ActionReply::failure(FailureReason::Exception));
            if let Err(e) = handle.machine_reply(task_id, machine, action, reply) {
                debug!(error = %e, "Machine reply dropped");
            }
        });
    }

    async fn on_machine_started(
        &mut self,
        task_id: &str,
        machine: String,
        reply: ActionReply,
    ) -> Result<()> {
        let mut task = self.task(task_id).await?;
        if task.state != TaskState::Pending || task.machine.as_deref() != Some(machine.as_str()) {
            warn!(task_id = %task_id, machine = %machine, "Start reply for a task that is not waiting on it");
            return Ok(());
        }

        if !reply.is_success() {
            let failure = OrchestratorError::MachineActionFailed {
                machine: machine.clone(),
                action: MachineAction::Start.to_string(),
                reason: reply.reason.unwrap_or(FailureReason::Exception),
            };
            error!(task_id = %task_id, error = %failure, "Task machine did not start");
            task.errors.push(failure.to_string());
            task.machine = None;
            advance_task(&mut task, TaskState::FatalError)?;
            let analysis_id = task.analysis_id.clone();
            self.commit_task(task).await?;
            self.release_machine(&machine).await;
            self.check_analysis(&analysis_id).await?;
            self.schedule().await;
            return Ok(());
        }

        advance_task(&mut task, TaskState::Running)?;
        let assignment = self.assignment(&task, &machine).await?;
        self.commit_task(task).await?;

        if let Err(e) = self.runner.start(assignment).await {
            self.on_task_done(task_id, Some(format!("task runner did not start: {}", e)))
                .await?;
        }
        Ok(())
    }

    async fn assignment(&self, task: &Task, machine: &str) -> Result<TaskAssignment> {
        let analysis = self.analysis(&task.analysis_id).await?;
        let target = match &analysis.submitted {
            SubmittedTarget::Url { url } => url.clone(),
            SubmittedTarget::File { path, .. } => match self.store.target_zip(&analysis.id).await {
                Some(zip) => zip.display().to_string(),
                None => path.display().to_string(),
            },
        };
        let machine_ip = self.machinery.machine(machine).await.and_then(|m| m.ip);

        Ok(TaskAssignment {
            task_id: task.id.clone(),
            analysis_id: task.analysis_id.clone(),
            machine: machine.to_string(),
            machine_ip,
            platform: task.platform.clone(),
            timeout: task.timeout,
            target,
            task_path: self.store.task_path(&task.analysis_id, &task.id),
        })
    }

    async fn on_task_done(&mut self, task_id: &str, error: Option<String>) -> Result<()> {
        let mut task = self.task(task_id).await?;
        if task.state != TaskState::Running {
            return Err(OrchestratorError::InvalidTransition {
                id: task.id,
                from: task.state.to_string(),
                to: "done".to_string(),
            });
        }

        let machine = task.machine.take();
        match error {
            None => advance_task(&mut task, TaskState::PendingPost)?,
            Some(error) => {
                warn!(task_id = %task_id, error = %error, "Task run failed");
                task.errors.push(error);
                advance_task(&mut task, TaskState::FatalError)?;
            }
        }
        let analysis_id = task.analysis_id.clone();
        let state = task.state;
        self.commit_task(task).await?;

        if let Some(machine) = machine {
            self.stop_machine(task_id, machine).await;
        }

        if state == TaskState::PendingPost {
            let item = WorkItem::for_task(
                analysis_id.clone(),
                task_id,
                self.store.analysis_path(&analysis_id),
            );
            if let Err(e) = self.processing.enqueue(Stage::Post, item).await {
                return self
                    .fail_post(task_id, format!("post stage not queued: {}", e))
                    .await;
            }
            Ok(())
        } else {
            self.check_analysis(&analysis_id).await
        }
    }

    async fn stop_machine(&mut self, task_id: &str, machine: String) {
        let request = ActionRequest::new(&machine, MachineAction::Stop, self.stop_timeout);
        match self.machinery.request_action(request).await {
            Ok(reply) => self.forward_reply(task_id.to_string(), machine, MachineAction::Stop, reply),
            Err(e) => {
                debug!(machine = %machine, error = %e, "Stop not requested, releasing directly");
                self.release_machine(&machine).await;
                self.schedule().await;
            }
        }
    }

    async fn on_machine_stopped(
        &mut self,
        task_id: &str,
        machine: &str,
        reply: ActionReply,
    ) -> Result<()> {
        if !reply.is_success() {
            warn!(task_id = %task_id, machine = %machine, reason = ?reply.reason, "Machine did not stop cleanly");
        }
        self.release_machine(machine).await;
        self.schedule().await;
        Ok(())
    }

    async fn release_machine(&self, machine: &str) {
        if let Err(e) = self.machinery.release(machine).await {
            warn!(machine = %machine, error = %e, "Machine release failed");
        }
    }

    async fn fail_pending_task(&mut self, task_id: &str, reason: String) -> Result<()> {
        let mut task = self.task(task_id).await?;
        error!(task_id = %task_id, reason = %reason, "Task failed before start");
        task.errors.push(reason);
        advance_task(&mut task, TaskState::FatalError)?;
        let analysis_id = task.analysis_id.clone();
        self.commit_task(task).await?;
        self.check_analysis(&analysis_id).await
    }

    async fn on_post_done(&mut self, task_id: &str) -> Result<()> {
        let mut task = self.task(task_id).await?;
        advance_task(&mut task, TaskState::Reported)?;
        let analysis_id = task.analysis_id.clone();
        self.commit_task(task).await?;
        self.check_analysis(&analysis_id).await
    }

    async fn fail_post(&mut self, task_id: &str, reason: String) -> Result<()> {
        let mut task = self.task(task_id).await?;
        if task.state != TaskState::PendingPost {
            return Err(OrchestratorError::InvalidTransition {
                id: task.id,
                from: task.state.to_string(),
                to: TaskState::FatalError.to_string(),
            });
        }
        task.errors.push(reason);
        advance_task(&mut task, TaskState::FatalError)?;
        let analysis_id = task.analysis_id.clone();
        self.commit_task(task).await?;
        self.check_analysis(&analysis_id).await
    }

    async fn on_stage_failed(
        &mut self,
        stage: Stage,
        analysis_id: &str,
        task_id: Option<&str>,
        error: String,
    ) -> Result<()> {
        let failure = OrchestratorError::WorkFailed {
            analysis_id: analysis_id.to_string(),
            reason: format!("{} stage: {}", stage, error),
        };
        match (stage, task_id) {
            (Stage::Identification | Stage::Pre, _) => {
                self.fail_analysis(analysis_id, failure.to_string()).await
            }
            (Stage::Post, Some(task_id)) => self.fail_post(task_id, failure.to_string()).await,
            (Stage::Post, None) => Err(OrchestratorError::Protocol(
                "post stage failure without a task id".to_string(),
            )),
        }
    }
}
