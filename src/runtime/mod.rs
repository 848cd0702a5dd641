//! Supervision of the pipeline's long-running tasks.
//!
//! The runtime owns every task's lifecycle: registration, startup, a
//! background liveness monitor with restart-on-crash, health snapshots,
//! and ordered shutdown. Tasks are registered in shutdown order (sources
//! first, the delay scheduler last) and observe cancellation through a
//! child token of the runtime's root token.
//!
//! Shutdown is cooperative then forceful: the root token is cancelled,
//! tasks get `shutdown_timeout` to drain, and whatever is still running
//! after that is aborted. The stop sequence is latched, so repeated
//! termination signals collapse into a single ordered stop.

mod health;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;

pub use health::{TaskHealth, TaskState};

/// Error surfaced by a task's entrypoint on abnormal exit.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TaskFailure(pub String);

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> TaskFailure {
        TaskFailure(message.into())
    }
}

/// A task body. Completing with `Ok` is terminal; completing with `Err`
/// (or panicking) makes the task eligible for restart.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), TaskFailure>> + Send>>;

/// Factory invoked for the initial start and every restart.
pub type TaskFactory = Box<dyn Fn(CancellationToken) -> TaskFuture + Send + Sync>;

struct TaskEntry {
    name: String,
    factory: TaskFactory,
    state: TaskState,
    handle: Option<JoinHandle<Result<(), TaskFailure>>>,
    cancel: CancellationToken,
    restart_count: u32,
    started_at: Option<DateTime<Utc>>,
}

impl TaskEntry {
    fn spawn(&mut self) {
        let future = (self.factory)(self.cancel.clone());
        self.handle = Some(tokio::spawn(future));
        self.state = TaskState::Running;
        self.started_at = Some(Utc::now());
    }
}

/// Supervises the registered tasks.
pub struct TaskRuntime {
    config: RuntimeConfig,
    root: CancellationToken,
    tasks: Arc<Mutex<Vec<TaskEntry>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
}

impl TaskRuntime {
    pub fn new(config: RuntimeConfig) -> TaskRuntime {
        TaskRuntime {
            config,
            root: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
            monitor: Mutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The runtime's root cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Registers a task. Registration order is shutdown order.
    pub async fn register(
        &self,
        name: impl Into<String>,
        factory: impl Fn(CancellationToken) -> TaskFuture + Send + Sync + 'static,
    ) {
        let name = name.into();
        let mut tasks = self.tasks.lock().await;
        debug!(task = %name, "task registered");
        tasks.push(TaskEntry {
            name,
            factory: Box::new(factory),
            state: TaskState::Registered,
            handle: None,
            cancel: self.root.child_token(),
            restart_count: 0,
            started_at: None,
        });
    }

    /// Starts every registered task, plus the monitor when enabled.
    pub async fn start_all(&self) {
        {
            let mut tasks = self.tasks.lock().await;
            for entry in tasks.iter_mut() {
                if entry.state == TaskState::Registered {
                    entry.state = TaskState::Starting;
                    entry.spawn();
                    info!(task = %entry.name, "task started");
                }
            }
        }

        if self.config.enable_monitoring {
            let mut monitor = self.monitor.lock().await;
            if monitor.is_none() {
                *monitor = Some(self.spawn_monitor());
            }
        }
    }

    fn spawn_monitor(&self) -> JoinHandle<()> {
        let tasks = Arc::clone(&self.tasks);
        let root = self.root.clone();
        let stopping = Arc::clone(&self.stopping);
        let interval = self.config.health_check_interval_duration();
        let auto_restart = self.config.auto_restart;
        let max_restarts = self.config.max_restart_attempts;
        let restart_delay = self.config.restart_delay_duration();

        tokio::spawn(async move {
            debug!("task monitor started");
            loop {
                tokio::select! {
                    _ = root.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                Self::sweep(&tasks, auto_restart, max_restarts, restart_delay).await;
            }
            debug!("task monitor stopped");
        })
    }

    /// One liveness sweep: reap finished tasks, restart crashed ones.
    async fn sweep(
        tasks: &Mutex<Vec<TaskEntry>>,
        auto_restart: bool,
        max_restarts: u32,
        restart_delay: std::time::Duration,
    ) {
        let mut restart_pending = false;
        {
            let mut guard = tasks.lock().await;
            for entry in guard.iter_mut() {
                if entry.state != TaskState::Running {
                    continue;
                }
                let finished = entry.handle.as_ref().is_some_and(JoinHandle::is_finished);
                if !finished {
                    continue;
                }

                let handle = entry.handle.take().expect("finished handle present");
                match handle.await {
                    Ok(Ok(())) => {
                        info!(task = %entry.name, "task completed");
                        entry.state = TaskState::Stopped;
                    }
                    Ok(Err(failure)) => {
                        error!(task = %entry.name, error = %failure, "task failed");
                        Self::mark_for_restart(entry, auto_restart, max_restarts);
                        restart_pending |= entry.state == TaskState::Restarting;
                    }
                    Err(join_error) => {
                        error!(task = %entry.name, error = %join_error, "task panicked");
                        Self::mark_for_restart(entry, auto_restart, max_restarts);
                        restart_pending |= entry.state == TaskState::Restarting;
                    }
                }
            }
        }

        if restart_pending {
            tokio::time::sleep(restart_delay).await;
            let mut guard = tasks.lock().await;
            for entry in guard.iter_mut() {
                if entry.state == TaskState::Restarting {
                    entry.restart_count += 1;
                    info!(
                        task = %entry.name,
                        attempt = entry.restart_count,
                        "restarting task"
                    );
                    entry.spawn();
                }
            }
        }
    }

    fn mark_for_restart(entry: &mut TaskEntry, auto_restart: bool, max_restarts: u32) {
        if auto_restart && entry.restart_count < max_restarts {
            entry.state = TaskState::Restarting;
        } else {
            warn!(task = %entry.name, "restart budget exhausted, task is down");
            entry.state = TaskState::Crashed;
        }
    }

    /// Stops one task by name: cancel, wait up to the shutdown timeout,
    /// then abort.
    pub async fn stop(&self, name: &str) -> bool {
        let timeout = self.config.shutdown_timeout_duration();
        let deadline = Instant::now() + timeout;
        let mut tasks = self.tasks.lock().await;
        let Some(entry) = tasks.iter_mut().find(|e| e.name == name) else {
            return false;
        };
        Self::stop_entry(entry, deadline).await;
        true
    }

    async fn stop_entry(entry: &mut TaskEntry, deadline: Instant) {
        if entry.state == TaskState::Stopped || entry.state == TaskState::Crashed {
            return;
        }
        entry.state = TaskState::Stopping;
        entry.cancel.cancel();

        if let Some(handle) = entry.handle.take() {
            let abort = handle.abort_handle();
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(()))) => debug!(task = %entry.name, "task stopped cleanly"),
                Ok(Ok(Err(failure))) => {
                    warn!(task = %entry.name, error = %failure, "task errored during stop");
                }
                Ok(Err(join_error)) => {
                    warn!(task = %entry.name, error = %join_error, "task panicked during stop");
                }
                Err(_) => {
                    warn!(task = %entry.name, "shutdown timeout exceeded, aborting task");
                    abort.abort();
                }
            }
        }
        entry.state = TaskState::Stopped;
    }

    /// Stops everything, in registration order, within the shutdown
    /// timeout. Latched: only the first call performs the stop.
    pub async fn stop_all(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            debug!("stop already in progress, ignoring");
            return;
        }

        info!("stopping all tasks");
        // Broadcast first so every task sees shutdown immediately, then
        // reap in registration order within the overall deadline.
        self.root.cancel();
        let deadline = Instant::now() + self.config.shutdown_timeout_duration();

        if let Some(monitor) = self.monitor.lock().await.take() {
            let _ = monitor.await;
        }

        let mut tasks = self.tasks.lock().await;
        for entry in tasks.iter_mut() {
            Self::stop_entry(entry, deadline).await;
        }
        info!("all tasks stopped");
    }

    /// Waits until every task has reached a terminal state, or the
    /// timeout elapses. Returns whether everything terminated.
    pub async fn wait_all(&self, timeout: Option<std::time::Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let all_done = {
                let tasks = self.tasks.lock().await;
                tasks.iter().all(|e| {
                    matches!(e.state, TaskState::Stopped | TaskState::Crashed)
                        || e.handle.as_ref().is_some_and(JoinHandle::is_finished)
                })
            };
            if all_done {
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    /// Snapshot of every task's state.
    pub async fn health(&self) -> Vec<TaskHealth> {
        let tasks = self.tasks.lock().await;
        tasks
            .iter()
            .map(|entry| TaskHealth {
                name: entry.name.clone(),
                state: entry.state,
                restart_count: entry.restart_count,
                started_at: entry.started_at,
            })
            .collect()
    }

    /// Waits for a process termination signal, then runs the latched
    /// stop sequence. Repeated signals are absorbed.
    pub async fn run_until_signalled(&self) {
        wait_for_termination_signal().await;
        info!("termination signal received, shutting down");
        self.stop_all().await;
    }
}

/// Completes when SIGINT or SIGTERM arrives.
async fn wait_for_termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
