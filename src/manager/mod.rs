//! Task manager: runs many tasks concurrently and tracks them
//!
//! Each `run_task` spawns one tokio task that executes the whole [`Task`].
//! Bookkeeping lives behind one mutex that is held only for map updates,
//! never across a run, so tasks progress in parallel.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument, Span};

use crate::context::ExecutionContext;
use crate::core::config::ManagerConfig;
use crate::core::errors::{Result, TaskLaneError};
use crate::store::ValueStore;
use crate::task::{RunSummary, Task};

/// Last known state of a registered task
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Registered,
    Running {
        since: DateTime<Utc>,
    },
    Completed {
        finished_at: DateTime<Utc>,
        completed_actions: usize,
    },
    Failed {
        finished_at: DateTime<Utc>,
        error: String,
    },
    Stopped {
        finished_at: DateTime<Utc>,
    },
}

impl TaskState {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running { .. })
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskState::Completed { .. } | TaskState::Failed { .. } | TaskState::Stopped { .. }
        )
    }
}

struct RunningTask {
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct ManagerState {
    tasks: HashMap<String, Arc<AsyncMutex<Task>>>,
    running: HashMap<String, RunningTask>,
    states: HashMap<String, TaskState>,
    errors: HashMap<String, Arc<TaskLaneError>>,
}

/// Starts, tracks and cancels tasks against one shared value store
#[derive(Clone)]
pub struct TaskManager {
    config: Arc<ManagerConfig>,
    store: ValueStore,
    state: Arc<Mutex<ManagerState>>,
    lifetime: CancellationToken,
    span: Option<Span>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::build(ManagerConfig::default())
    }

    pub fn with_config(config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: ManagerConfig) -> Self {
        Self {
            config: Arc::new(config),
            store: ValueStore::new(),
            state: Arc::new(Mutex::new(ManagerState::default())),
            lifetime: CancellationToken::new(),
            span: None,
        }
    }

    /// Use an existing store instead of a private one
    pub fn with_store(mut self, store: ValueStore) -> Self {
        self.store = store;
        self
    }

    /// Parent span for every task run started by this manager
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The store shared by every task this manager runs
    pub fn store(&self) -> ValueStore {
        self.store.clone()
    }

    /// Clear every published output and result
    pub fn reset_store(&self) {
        self.store.clear();
    }

    /// Register a task definition under its id.
    ///
    /// Fails if the id is taken, so a running task is never replaced.
    pub fn add_task(&self, task: Task) -> Result<()> {
        if self.config.strict_action_ids {
            let mut seen = HashSet::new();
            if let Some(dup) = task.action_ids().find(|id| !seen.insert(*id)) {
                return Err(TaskLaneError::DuplicateActionId {
                    task_id: task.id().to_string(),
                    action_id: dup.to_string(),
                });
            }
        }

        let task_id = task.id().to_string();
        let mut state = self.state.lock();
        if state.tasks.contains_key(&task_id) {
            return Err(TaskLaneError::TaskAlreadyRegistered { task_id });
        }
        state
            .tasks
            .insert(task_id.clone(), Arc::new(AsyncMutex::new(task)));
        state.states.insert(task_id.clone(), TaskState::Registered);
        state.errors.remove(&task_id);
        info!(task_id = %task_id, "task registered");
        Ok(())
    }

    /// Unregister a task that is not currently running
    pub fn remove_task(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.running.contains_key(task_id) {
            return Err(TaskLaneError::TaskAlreadyRunning {
                task_id: task_id.to_string(),
            });
        }
        if state.tasks.remove(task_id).is_none() {
            return Err(TaskLaneError::task_not_found(task_id));
        }
        state.states.remove(task_id);
        state.errors.remove(task_id);
        info!(task_id, "task removed");
        Ok(())
    }

    /// Start a registered task in the background and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run_task(&self, task_id: &str) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| TaskLaneError::internal("run_task called outside a tokio runtime"))?;
        if self.lifetime.is_cancelled() {
            return Err(TaskLaneError::cancelled_with_reason(
                "task manager",
                "manager was shut down",
            ));
        }

        let (task, token, done) = {
            let mut state = self.state.lock();
            let task = state
                .tasks
                .get(task_id)
                .cloned()
                .ok_or_else(|| TaskLaneError::task_not_found(task_id))?;
            if state.running.contains_key(task_id) {
                return Err(TaskLaneError::TaskAlreadyRunning {
                    task_id: task_id.to_string(),
                });
            }
            if let Some(limit) = self.config.max_running_tasks {
                if state.running.len() >= limit {
                    return Err(TaskLaneError::ResourceExhausted {
                        resource: "running tasks".to_string(),
                        current: state.running.len(),
                        limit,
                    });
                }
            }

            let token = self.lifetime.child_token();
            let (done_tx, done_rx) = watch::channel(false);
            state.running.insert(
                task_id.to_string(),
                RunningTask {
                    token: token.clone(),
                    done: done_rx,
                },
            );
            state
                .states
                .insert(task_id.to_string(), TaskState::Running { since: Utc::now() });
            (task, token, done_tx)
        };

        let mut guard = RunGuard {
            state: self.state.clone(),
            task_id: task_id.to_string(),
            done,
            terminal: None,
        };
        let ctx = ExecutionContext::new(self.store.clone()).with_cancellation_token(token);
        let span = match &self.span {
            Some(parent) => info_span!(parent: parent, "task_run", task_id = %task_id),
            None => info_span!("task_run", task_id = %task_id),
        };

        handle.spawn(
            async move {
                let result = AssertUnwindSafe(async {
                    let mut task = task.lock().await;
                    task.run(&ctx).await
                })
                .catch_unwind()
                .await;
                drop(task);
                match result {
                    Ok(result) => guard.finish(result),
                    Err(payload) => guard.panicked(payload.as_ref()),
                }
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Cancel a running task and wait for it to exit, up to the
    /// configured stop timeout.
    ///
    /// Stopping a registered task that is not running is a no-op.
    pub async fn stop_task(&self, task_id: &str) -> Result<()> {
        let (token, mut done) = {
            let state = self.state.lock();
            match state.running.get(task_id) {
                Some(running) => (running.token.clone(), running.done.clone()),
                None if state.tasks.contains_key(task_id) => return Ok(()),
                None => return Err(TaskLaneError::task_not_found(task_id)),
            }
        };

        info!(task_id, "stopping task");
        token.cancel();

        let timeout = self.config.stop_timeout();
        let exited = tokio::time::timeout(timeout, done.wait_for(|finished| *finished))
            .await
            .is_ok();
        if !exited {
            warn!(task_id, timeout_ms = self.config.stop_timeout_ms, "task did not stop in time");
            return Err(TaskLaneError::timeout(
                format!("stop task '{}'", task_id),
                self.config.stop_timeout_ms,
            ));
        }
        Ok(())
    }

    /// Cancel every running task without waiting; returns the ids cancelled
    pub fn stop_all_tasks(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut stopped = Vec::with_capacity(state.running.len());
        for (task_id, running) in &state.running {
            running.token.cancel();
            stopped.push(task_id.clone());
        }
        if !stopped.is_empty() {
            info!(count = stopped.len(), "stopping all tasks");
        }
        stopped
    }

    /// Wait until the current run of a task exits (no-op if idle)
    pub async fn wait_for_task(&self, task_id: &str) -> Result<()> {
        let mut done = {
            let state = self.state.lock();
            match state.running.get(task_id) {
                Some(running) => running.done.clone(),
                None if state.tasks.contains_key(task_id) => return Ok(()),
                None => return Err(TaskLaneError::task_not_found(task_id)),
            }
        };
        // A dropped sender also means the worker is gone
        let _ = done.wait_for(|finished| *finished).await;
        Ok(())
    }

    /// Cancel all runs and the manager itself, then wait for the runs to exit.
    /// No new runs can be started afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        let waiters: Vec<(String, watch::Receiver<bool>)> = {
            let state = self.state.lock();
            state
                .running
                .iter()
                .map(|(id, running)| (id.clone(), running.done.clone()))
                .collect()
        };
        info!(running = waiters.len(), "shutting down task manager");
        self.lifetime.cancel();

        let timeout = self.config.stop_timeout();
        let results = join_all(waiters.into_iter().map(|(task_id, mut done)| async move {
            let exited = tokio::time::timeout(timeout, done.wait_for(|finished| *finished))
                .await
                .is_ok();
            (task_id, exited)
        }))
        .await;

        let mut stuck: Vec<String> = results
            .into_iter()
            .filter(|(_, exited)| !exited)
            .map(|(task_id, _)| task_id)
            .collect();
        if stuck.is_empty() {
            return Ok(());
        }
        stuck.sort();
        Err(TaskLaneError::timeout(
            format!("shutdown (still running: {})", stuck.join(", ")),
            self.config.stop_timeout_ms,
        ))
    }

    /// Snapshot of the ids currently running
    pub fn running_tasks(&self) -> HashSet<String> {
        self.state.lock().running.keys().cloned().collect()
    }

    pub fn is_task_running(&self, task_id: &str) -> bool {
        self.state.lock().running.contains_key(task_id)
    }

    /// Registered task ids, sorted
    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().tasks.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.state.lock().states.get(task_id).cloned()
    }

    /// Terminal error of the last run, if it failed or was stopped
    pub fn task_error(&self, task_id: &str) -> Option<Arc<TaskLaneError>> {
        self.state.lock().errors.get(task_id).cloned()
    }

    /// Run summary published by the last run of a task
    pub fn task_summary(&self, task_id: &str) -> Option<RunSummary> {
        self.store
            .task_output(task_id)
            .and_then(|output| serde_json::from_value(output).ok())
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears a task's running entry when its worker exits, including by panic
struct RunGuard {
    state: Arc<Mutex<ManagerState>>,
    task_id: String,
    done: watch::Sender<bool>,
    terminal: Option<(TaskState, Option<Arc<TaskLaneError>>)>,
}

impl RunGuard {
    fn panicked(&mut self, payload: &(dyn Any + Send)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|m| m.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        error!(task_id = %self.task_id, panic = %message, "task worker panicked");
        self.terminal = Some(abnormal_exit(format!("task worker panicked: {}", message)));
    }

    fn finish(&mut self, result: Result<RunSummary>) {
        let finished_at = Utc::now();
        self.terminal = Some(match result {
            Ok(summary) => (
                TaskState::Completed {
                    finished_at,
                    completed_actions: summary.completed_actions,
                },
                None,
            ),
            Err(err) => {
                let err = match err {
                    TaskLaneError::TaskFailed { source, .. } => source,
                    other => Arc::new(other),
                };
                let state = if err.is_cancellation() {
                    TaskState::Stopped { finished_at }
                } else {
                    TaskState::Failed {
                        finished_at,
                        error: err.to_string(),
                    }
                };
                (state, Some(err))
            }
        });
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        // Dropped before finishing: never polled, or aborted at runtime shutdown
        let (next, err) = self.terminal.take().unwrap_or_else(|| {
            error!(task_id = %self.task_id, "task worker exited without finishing");
            abnormal_exit("task worker exited without finishing".to_string())
        });

        {
            let mut state = self.state.lock();
            state.running.remove(&self.task_id);
            match err {
                Some(err) => {
                    state.errors.insert(self.task_id.clone(), err);
                }
                None => {
                    state.errors.remove(&self.task_id);
                }
            }
            if state.tasks.contains_key(&self.task_id) {
                state.states.insert(self.task_id.clone(), next);
            }
        }
        self.done.send_replace(true);
    }
}

fn abnormal_exit(message: String) -> (TaskState, Option<Arc<TaskLaneError>>) {
    (
        TaskState::Failed {
            finished_at: Utc::now(),
            error: message.clone(),
        },
        Some(Arc::new(TaskLaneError::internal(message))),
    )
}
