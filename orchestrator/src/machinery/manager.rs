use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use shared::observability::machine_span;
use shared::types::{Platform, TaskId};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::action::{ActionReply, ActionRequest, FailureReason, MachineAction};
use super::backend::{BackendError, BackendResult, MachineState, MachineryBackend};
use super::pool::MachinePool;
use super::waiter::Waiter;
use crate::config::MachineryConfig;
use crate::error::{OrchestratorError, Result};
use crate::models::Machine;

struct Job {
    id: Uuid,
    request: ActionRequest,
    reply: oneshot::Sender<ActionReply>,
}

enum InFlight {
    /// Picked up by a worker, backend call in progress
    Dispatching(Uuid),
    Waiting(Waiter),
}

#[derive(Default)]
struct Dispatch {
    queue: VecDeque<Job>,
    in_flight: HashMap<String, InFlight>,
    deferred: HashMap<String, VecDeque<Job>>,
}

enum Outcome {
    Reached,
    Failed(FailureReason, String),
    Expired,
}

struct Inner {
    pool: MachinePool,
    backends: HashMap<String, Arc<dyn MachineryBackend>>,
    dispatch: Mutex<Dispatch>,
    notify: Notify,
    poll_interval: Duration,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Dispatches machine lifecycle actions to backends.
///
/// At most one action is in flight per machine; further requests for the
/// same machine wait in a per-machine queue. Every accepted request gets
/// exactly one [`ActionReply`].
#[derive(Clone)]
pub struct MachineryManager {
    inner: Arc<Inner>,
}

impl MachineryManager {
    /// Build the pool, check it against the backends and spawn the workers
    pub async fn start(
        machines: Vec<Machine>,
        backends: Vec<Arc<dyn MachineryBackend>>,
        config: &MachineryConfig,
    ) -> Result<Self> {
        let backends: HashMap<String, Arc<dyn MachineryBackend>> = backends
            .into_iter()
            .map(|b| (b.name().to_string(), b))
            .collect();

        for machine in &machines {
            if !backends.contains_key(&machine.backend) {
                return Err(OrchestratorError::UnknownMachine(format!(
                    "{} (backend '{}' is not configured)",
                    machine.name, machine.backend
                )));
            }
        }

        let manager = Self {
            inner: Arc::new(Inner {
                pool: MachinePool::new(machines),
                backends,
                dispatch: Mutex::new(Dispatch::default()),
                notify: Notify::new(),
                poll_interval: config.poll_interval(),
                workers: std::sync::Mutex::new(Vec::new()),
            }),
        };

        manager.verify_machines().await;

        let handles: Vec<JoinHandle<()>> = (0..config.workers)
            .map(|n| {
                let worker = manager.clone();
                tokio::spawn(async move { worker.worker_loop(n).await })
            })
            .collect();
        if let Ok(mut workers) = manager.inner.workers.lock() {
            workers.extend(handles);
        }

        info!(workers = config.workers, "Machinery manager started");
        Ok(manager)
    }

    /// Disable configured machines their backend does not know about
    async fn verify_machines(&self) {
        for (name, backend) in &self.inner.backends {
            let known = match backend.list_machines().await {
                Ok(known) => known,
                Err(e) => {
                    warn!(backend = %name, error = %e, "Could not list backend machines");
                    continue;
                }
            };
            for machine in self.inner.pool.list().await {
                if &machine.backend == name && !known.contains(&machine.name) {
                    self.disable_after_failure(&machine.name, "not found on backend")
                        .await;
                }
            }
        }
    }

    /// Queue an action. If the machine is busy the request waits its turn.
    pub async fn request_action(
        &self,
        request: ActionRequest,
    ) -> Result<oneshot::Receiver<ActionReply>> {
        self.submit(request, false).await
    }

    /// Like [`request_action`](Self::request_action) but refuses busy machines
    pub async fn try_request_action(
        &self,
        request: ActionRequest,
    ) -> Result<oneshot::Receiver<ActionReply>> {
        self.submit(request, true).await
    }

    async fn submit(
        &self,
        request: ActionRequest,
        reject_busy: bool,
    ) -> Result<oneshot::Receiver<ActionReply>> {
        let machine = self
            .inner
            .pool
            .get(&request.machine)
            .await
            .ok_or_else(|| OrchestratorError::UnknownMachine(request.machine.clone()))?;
        if request.action == MachineAction::Start && machine.is_disabled() {
            return Err(OrchestratorError::MachineDisabled(machine.name));
        }

        let (tx, rx) = oneshot::channel();
        let job = Job {
            id: Uuid::new_v4(),
            request,
            reply: tx,
        };

        let mut dispatch = self.inner.dispatch.lock().await;
        if dispatch.in_flight.contains_key(&job.request.machine) {
            if reject_busy {
                return Err(OrchestratorError::MachineBusy(job.request.machine));
            }
            debug!(machine = %job.request.machine, action = %job.request.action, "Machine busy, request deferred");
            dispatch
                .deferred
                .entry(job.request.machine.clone())
                .or_default()
                .push_back(job);
        } else {
            dispatch
                .in_flight
                .insert(job.request.machine.clone(), InFlight::Dispatching(job.id));
            dispatch.queue.push_back(job);
            self.inner.notify.notify_one();
        }
        Ok(rx)
    }

    /// Bind an enabled, idle machine to a task
    pub async fn acquire(
        &self,
        platform: &Platform,
        tags: &[String],
        task_id: &TaskId,
    ) -> Option<Machine> {
        self.inner.pool.acquire(platform, tags, task_id).await
    }

    pub async fn can_serve(&self, platform: &Platform, tags: &[String]) -> bool {
        self.inner.pool.can_serve(platform, tags).await
    }

    pub async fn release(&self, machine: &str) -> Result<bool> {
        self.inner.pool.release(machine).await
    }

    /// Remove a machine from the pool. Disabling twice is not an error.
    pub async fn disable(&self, machine: &str) -> Result<()> {
        self.inner
            .pool
            .disable(machine, "disabled by request")
            .await
            .map(|_| ())
    }

    pub async fn machine(&self, name: &str) -> Option<Machine> {
        self.inner.pool.get(name).await
    }

    pub async fn list_machines(&self) -> Vec<Machine> {
        self.inner.pool.list().await
    }

    pub async fn available_platforms(&self) -> Vec<Platform> {
        self.inner.pool.available_platforms().await
    }

    pub fn shutdown(&self) {
        if let Ok(mut workers) = self.inner.workers.lock() {
            for handle in workers.drain(..) {
                handle.abort();
            }
        }
    }

    async fn worker_loop(self, n: usize) {
        debug!(worker = n, "Machinery worker started");
        loop {
            self.check_waiters().await;

            let job = self.inner.dispatch.lock().await.queue.pop_front();
            match job {
                Some(job) => {
                    let span = machine_span(&job.request.machine, job.request.action.as_str());
                    self.dispatch(job).instrument(span).await;
                }
                None => {
                    tokio::select! {
                        _ = self.inner.notify.notified() => {}
                        _ = sleep(self.inner.poll_interval) => {}
                    }
                }
            }
        }
    }

    fn backend_for(&self, machine: &Machine) -> BackendResult<Arc<dyn MachineryBackend>> {
        self.inner
            .backends
            .get(&machine.backend)
            .cloned()
            .ok_or_else(|| BackendError::Other(format!("no backend named {}", machine.backend)))
    }

    async fn call(&self, action: MachineAction, machine: &Machine) -> BackendResult<()> {
        let backend = self.backend_for(machine)?;
        match action {
            MachineAction::Start => backend.start(machine).await,
            MachineAction::Stop => backend.stop(machine).await,
            MachineAction::Restore => backend.restore(machine).await,
            MachineAction::AcquireOutput => backend.acquire_output(machine).await,
            MachineAction::Release => backend.release(machine).await,
        }
    }

    async fn dispatch(&self, job: Job) {
        let Job { id, request, reply } = job;
        let deadline = Instant::now() + request.timeout;
        let mut waiter = Waiter::new(id, &request, deadline, reply);

        let Some(machine) = self.inner.pool.get(&request.machine).await else {
            waiter.resolve(ActionReply::failure(FailureReason::Exception));
            self.finish(&request.machine).await;
            return;
        };

        info!(expected = %request.expected_state, timeout = ?request.timeout, "Dispatching machine action");
        match timeout(request.timeout, self.call(request.action, &machine)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.disable_after_failure(&machine.name, &e.to_string()).await;
                waiter.resolve(ActionReply::failure(FailureReason::Exception));
                self.finish(&machine.name).await;
                return;
            }
            Err(_) => warn!("Backend call did not return before the action deadline"),
        }

        let mut dispatch = self.inner.dispatch.lock().await;
        dispatch
            .in_flight
            .insert(machine.name.clone(), InFlight::Waiting(waiter));
    }

    /// Resolve every waiter whose machine reached its state, failed, or ran out of time
    async fn check_waiters(&self) {
        let now = Instant::now();
        let pending: Vec<(String, Uuid, MachineState, bool)> = {
            let dispatch = self.inner.dispatch.lock().await;
            dispatch
                .in_flight
                .values()
                .filter_map(|f| match f {
                    InFlight::Waiting(w) => {
                        Some((w.machine.clone(), w.id, w.expected_state, w.is_expired(now)))
                    }
                    InFlight::Dispatching(_) => None,
                })
                .collect()
        };

        for (name, id, expected, expired) in pending {
            let Some(machine) = self.inner.pool.get(&name).await else {
                continue;
            };

            let observed = match self.backend_for(&machine) {
                Ok(backend) => timeout(self.inner.poll_interval, backend.state(&machine))
                    .await
                    .ok(),
                Err(e) => Some(Err(e)),
            };

            let outcome = match observed {
                Some(Ok(state)) if state == expected => Outcome::Reached,
                Some(Ok(MachineState::Error)) => Outcome::Failed(
                    FailureReason::UnexpectedState,
                    "machine entered error state".to_string(),
                ),
                Some(Err(e)) => Outcome::Failed(FailureReason::Exception, e.to_string()),
                _ if expired => Outcome::Expired,
                _ => continue,
            };

            // Only the worker that takes the waiter answers it
            let Some(waiter) = self.take_waiter(&name, id).await else {
                continue;
            };
            let span = machine_span(&machine.name, waiter.action.as_str());
            self.resolve(machine, waiter, outcome).instrument(span).await;
        }
    }

    async fn take_waiter(&self, machine: &str, id: Uuid) -> Option<Waiter> {
        let mut dispatch = self.inner.dispatch.lock().await;
        let current = matches!(
            dispatch.in_flight.get(machine),
            Some(InFlight::Waiting(w)) if w.id == id
        );
        if !current {
            return None;
        }
        // The machine stays marked in flight until `finish`
        match dispatch
            .in_flight
            .insert(machine.to_string(), InFlight::Dispatching(id))
        {
            Some(InFlight::Waiting(w)) => Some(w),
            _ => None,
        }
    }

    async fn resolve(&self, machine: Machine, mut waiter: Waiter, outcome: Outcome) {
        match outcome {
            Outcome::Reached => {
                info!(state = %waiter.expected_state, "Machine reached expected state");
                waiter.resolve(ActionReply::success());
            }
            Outcome::Failed(reason, detail) => {
                self.disable_after_failure(&machine.name, &detail).await;
                waiter.resolve(ActionReply::failure(reason));
            }
            Outcome::Expired => match waiter.fallback.take() {
                Some(fallback) => {
                    warn!(fallback = %fallback.action, "Machine action timed out, running fallback");
                    waiter.resolve(ActionReply::failure(FailureReason::Timeout));

                    let next = Waiter::for_fallback(&machine.name, fallback, Instant::now());
                    match timeout(fallback.timeout, self.call(fallback.action, &machine)).await {
                        Ok(Err(e)) => {
                            self.disable_after_failure(&machine.name, &e.to_string()).await;
                        }
                        _ => {
                            let mut dispatch = self.inner.dispatch.lock().await;
                            dispatch
                                .in_flight
                                .insert(machine.name.clone(), InFlight::Waiting(next));
                            return;
                        }
                    }
                }
                None => {
                    self.disable_after_failure(&machine.name, "timeout").await;
                    waiter.resolve(ActionReply::failure(FailureReason::Timeout));
                }
            },
        }

        self.finish(&machine.name).await;
    }

    async fn disable_after_failure(&self, machine: &str, reason: &str) {
        if let Err(e) = self.inner.pool.disable(machine, reason).await {
            warn!(machine = %machine, error = %e, "Could not disable machine");
        }
    }

    /// Clear the in-flight slot and hand the next deferred request to the workers
    async fn finish(&self, machine: &str) {
        let mut dispatch = self.inner.dispatch.lock().await;
        dispatch.in_flight.remove(machine);

        let next = dispatch
            .deferred
            .get_mut(machine)
            .and_then(|queue| queue.pop_front());
        if let Some(job) = next {
            dispatch
                .in_flight
                .insert(machine.to_string(), InFlight::Dispatching(job.id));
            dispatch.queue.push_back(job);
            self.inner.notify.notify_one();
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Behaviour {
        Normal,
        /// Call returns but the state never changes
        Hang,
        Fail,
        Crash,
        Slow(Duration),
    }

    /// In-memory hypervisor for tests
    #[derive(Default)]
    pub struct FakeBackend {
        states: StdMutex<HashMap<String, MachineState>>,
        behaviours: StdMutex<HashMap<(String, MachineAction), Behaviour>>,
        pub calls: StdMutex<Vec<(String, MachineAction)>>,
        active: StdMutex<HashMap<String, usize>>,
        pub max_concurrent: StdMutex<usize>,
    }

    impl FakeBackend {
        pub fn with_machines(names: &[&str]) -> Arc<Self> {
            let backend = Self::default();
            if let Ok(mut states) = backend.states.lock() {
                for name in names {
                    states.insert(name.to_string(), MachineState::Poweroff);
                }
            }
            Arc::new(backend)
        }

        pub fn set_behaviour(&self, machine: &str, action: MachineAction, behaviour: Behaviour) {
            self.behaviours
                .lock()
                .unwrap()
                .insert((machine.to_string(), action), behaviour);
        }

        pub fn calls_for(&self, machine: &str) -> Vec<MachineAction> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| m == machine)
                .map(|(_, a)| *a)
                .collect()
        }

        async fn act(&self, machine: &Machine, action: MachineAction) -> BackendResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push((machine.name.clone(), action));
            let behaviour = self
                .behaviours
                .lock()
                .unwrap()
                .get(&(machine.name.clone(), action))
                .copied()
                .unwrap_or(Behaviour::Normal);

            {
                let mut active = self.active.lock().unwrap();
                let count = active.entry(machine.name.clone()).or_default();
                *count += 1;
                let mut max = self.max_concurrent.lock().unwrap();
                *max = (*max).max(*count);
            }

            let result = match behaviour {
                Behaviour::Normal => {
                    self.set_state(&machine.name, action.default_expected_state());
                    Ok(())
                }
                Behaviour::Slow(delay) => {
                    sleep(delay).await;
                    self.set_state(&machine.name, action.default_expected_state());
                    Ok(())
                }
                Behaviour::Hang => Ok(()),
                Behaviour::Fail => Err(BackendError::Other("hypervisor exploded".to_string())),
                Behaviour::Crash => {
                    self.set_state(&machine.name, MachineState::Error);
                    Ok(())
                }
            };

            if let Some(count) = self.active.lock().unwrap().get_mut(&machine.name) {
                *count -= 1;
            }
            result
        }

        fn set_state(&self, machine: &str, state: MachineState) {
            self.states
                .lock()
                .unwrap()
                .insert(machine.to_string(), state);
        }
    }

    #[async_trait]
    impl MachineryBackend for FakeBackend {
        fn name(&self) -> &str {
            "fake"
        }

        async fn list_machines(&self) -> BackendResult<Vec<String>> {
            Ok(self.states.lock().unwrap().keys().cloned().collect())
        }

        async fn start(&self, machine: &Machine) -> BackendResult<()> {
            self.act(machine, MachineAction::Start).await
        }

        async fn stop(&self, machine: &Machine) -> BackendResult<()> {
            self.act(machine, MachineAction::Stop).await
        }

        async fn restore(&self, machine: &Machine) -> BackendResult<()> {
            self.act(machine, MachineAction::Restore).await
        }

        async fn state(&self, machine: &Machine) -> BackendResult<MachineState> {
            self.states
                .lock()
                .unwrap()
                .get(&machine.name)
                .copied()
                .ok_or_else(|| BackendError::MachineNotFound(machine.name.clone()))
        }

        async fn acquire_output(&self, machine: &Machine) -> BackendResult<()> {
            self.act(machine, MachineAction::AcquireOutput).await
        }

        async fn release(&self, machine: &Machine) -> BackendResult<()> {
            self.act(machine, MachineAction::Release).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{Behaviour, FakeBackend};
    use super::*;
    use crate::machinery::action::Fallback;
    use crate::machinery::pool::test_machine;
    use crate::models::Availability;

    fn config() -> MachineryConfig {
        MachineryConfig {
            workers: 2,
            poll_interval_ms: 100,
            ..MachineryConfig::default()
        }
    }

    async fn manager(backend: Arc<FakeBackend>) -> MachineryManager {
        MachineryManager::start(
            vec![
                test_machine("win10-1", "windows", "10"),
                test_machine("win7-1", "windows", "7"),
            ],
            vec![backend as Arc<dyn MachineryBackend>],
            &config(),
        )
        .await
        .unwrap()
    }

    fn start(machine: &str, secs: u64) -> ActionRequest {
        ActionRequest::new(machine, MachineAction::Start, Duration::from_secs(secs))
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_reaches_expected_state() {
        let backend = FakeBackend::with_machines(&["win10-1", "win7-1"]);
        let manager = manager(backend.clone()).await;

        let reply = manager.request_action(start("win10-1", 5)).await.unwrap();
        assert_eq!(reply.await.unwrap(), ActionReply::success());
        assert_eq!(backend.calls_for("win10-1"), vec![MachineAction::Start]);
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_fallback_disables_machine() {
        let backend = FakeBackend::with_machines(&["win10-1", "win7-1"]);
        backend.set_behaviour("win10-1", MachineAction::Start, Behaviour::Hang);
        let manager = manager(backend).await;

        let began = Instant::now();
        let reply = manager.request_action(start("win10-1", 5)).await.unwrap();
        assert_eq!(
            reply.await.unwrap(),
            ActionReply::failure(FailureReason::Timeout)
        );
        assert!(began.elapsed() >= Duration::from_secs(5));

        let win10 = Platform::new("windows", "10");
        assert!(manager
            .acquire(&win10, &[], &"t_1".to_string())
            .await
            .is_none());
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_with_successful_fallback_keeps_machine() {
        let backend = FakeBackend::with_machines(&["win10-1", "win7-1"]);
        backend.set_behaviour("win10-1", MachineAction::Start, Behaviour::Hang);
        let manager = manager(backend.clone()).await;

        let request = start("win10-1", 5)
            .with_fallback(Fallback::new(MachineAction::Stop, Duration::from_secs(5)));
        let reply = manager.request_action(request).await.unwrap();
        assert_eq!(
            reply.await.unwrap(),
            ActionReply::failure(FailureReason::Timeout)
        );

        // A later request is served only after the fallback resolved
        let stop = ActionRequest::new("win10-1", MachineAction::Stop, Duration::from_secs(5));
        let reply = manager.request_action(stop).await.unwrap();
        assert!(reply.await.unwrap().is_success());

        assert_eq!(
            backend.calls_for("win10-1"),
            vec![MachineAction::Start, MachineAction::Stop, MachineAction::Stop]
        );
        let machine = manager
            .list_machines()
            .await
            .into_iter()
            .find(|m| m.name == "win10-1")
            .unwrap();
        assert_eq!(machine.availability, Availability::Available);
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fallback_disables_machine() {
        let backend = FakeBackend::with_machines(&["win10-1", "win7-1"]);
        backend.set_behaviour("win10-1", MachineAction::Start, Behaviour::Hang);
        backend.set_behaviour("win10-1", MachineAction::Stop, Behaviour::Fail);
        let manager = manager(backend).await;

        let request = start("win10-1", 5)
            .with_fallback(Fallback::new(MachineAction::Stop, Duration::from_secs(5)));
        let reply = manager.request_action(request).await.unwrap();
        assert_eq!(
            reply.await.unwrap(),
            ActionReply::failure(FailureReason::Timeout)
        );

        sleep(Duration::from_secs(7)).await;
        let machine = manager
            .list_machines()
            .await
            .into_iter()
            .find(|m| m.name == "win10-1")
            .unwrap();
        assert!(machine.is_disabled());
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_error_is_exception() {
        let backend = FakeBackend::with_machines(&["win10-1", "win7-1"]);
        backend.set_behaviour("win7-1", MachineAction::Start, Behaviour::Fail);
        let manager = manager(backend).await;

        let reply = manager.request_action(start("win7-1", 5)).await.unwrap();
        assert_eq!(
            reply.await.unwrap(),
            ActionReply::failure(FailureReason::Exception)
        );
        assert!(matches!(
            manager.request_action(start("win7-1", 5)).await,
            Err(OrchestratorError::MachineDisabled(_))
        ));
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_state_is_unexpected() {
        let backend = FakeBackend::with_machines(&["win10-1", "win7-1"]);
        backend.set_behaviour("win10-1", MachineAction::Start, Behaviour::Crash);
        let manager = manager(backend).await;

        let reply = manager.request_action(start("win10-1", 5)).await.unwrap();
        assert_eq!(
            reply.await.unwrap(),
            ActionReply::failure(FailureReason::UnexpectedState)
        );
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_actions_on_one_machine_never_overlap() {
        let backend = FakeBackend::with_machines(&["win10-1", "win7-1"]);
        backend.set_behaviour(
            "win10-1",
            MachineAction::Start,
            Behaviour::Slow(Duration::from_secs(2)),
        );
        backend.set_behaviour(
            "win10-1",
            MachineAction::Stop,
            Behaviour::Slow(Duration::from_secs(2)),
        );
        let manager = manager(backend.clone()).await;

        let first = manager.request_action(start("win10-1", 10)).await.unwrap();
        let stop = ActionRequest::new("win10-1", MachineAction::Stop, Duration::from_secs(10));
        assert!(matches!(
            manager.try_request_action(stop.clone()).await,
            Err(OrchestratorError::MachineBusy(_))
        ));
        let second = manager.request_action(stop).await.unwrap();

        assert!(first.await.unwrap().is_success());
        assert!(second.await.unwrap().is_success());
        assert_eq!(*backend.max_concurrent.lock().unwrap(), 1);
        assert_eq!(
            backend.calls_for("win10-1"),
            vec![MachineAction::Start, MachineAction::Stop]
        );
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_twice() {
        let backend = FakeBackend::with_machines(&["win10-1", "win7-1"]);
        let manager = manager(backend).await;

        manager.disable("win7-1").await.unwrap();
        manager.disable("win7-1").await.unwrap();

        let disabled: Vec<_> = manager
            .list_machines()
            .await
            .into_iter()
            .filter(|m| m.is_disabled())
            .collect();
        assert_eq!(disabled.len(), 1);
        assert_eq!(
            manager.available_platforms().await,
            vec![Platform::new("windows", "10")]
        );
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_machines_missing_on_backend_start_disabled() {
        let backend = FakeBackend::with_machines(&["win10-1"]);
        let manager = manager(backend).await;

        let win7 = manager
            .list_machines()
            .await
            .into_iter()
            .find(|m| m.name == "win7-1")
            .unwrap();
        assert!(win7.is_disabled());
        manager.shutdown();
    }
}
