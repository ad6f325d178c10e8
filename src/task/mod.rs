//! Tasks: ordered, sequentially executed lists of wrapped actions
//!
//! A task runs its actions one after another on the calling task, stops at
//! the first failure, and publishes a [`RunSummary`] as its output at the end
//! of every run. An optional result builder turns a successful run into one
//! structured result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::action::{Action, ActionWrapper, Step};
use crate::context::ExecutionContext;
use crate::core::errors::{Result, TaskLaneError};
use crate::store::{Outcome, ResultProvider};

/// Builds a task's structured result from a successful run
pub type ResultBuilder = Box<dyn Fn(&RunSummary) -> anyhow::Result<Value> + Send + Sync>;

/// Output of one action within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub elapsed_ms: u64,
    pub output: Value,
}

/// View of one task run; published as the task's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub task_id: String,
    pub task_name: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_actions: usize,
    pub total_actions: usize,
    pub duration_ms: u64,
    /// Outputs of completed actions, in run order
    pub actions: Vec<ActionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    /// Output of the last completed action with this id
    pub fn output_of(&self, action_id: &str) -> Option<&Value> {
        self.actions
            .iter()
            .rev()
            .find(|r| r.action_id == action_id)
            .map(|r| &r.output)
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Builder for [`Task`]
pub struct TaskBuilder {
    id: String,
    name: Option<String>,
    actions: Vec<Box<dyn Step>>,
    result_builder: Option<ResultBuilder>,
}

impl TaskBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            actions: Vec::new(),
            result_builder: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Append an already wrapped action
    pub fn step<A: Action + 'static>(mut self, wrapper: ActionWrapper<A>) -> Self {
        self.actions.push(Box::new(wrapper));
        self
    }

    /// Wrap and append an action under the given id
    pub fn action<A: Action + 'static>(self, id: impl Into<String>, action: A) -> Self {
        self.step(ActionWrapper::with_id(id, action))
    }

    pub fn boxed_step(mut self, step: Box<dyn Step>) -> Self {
        self.actions.push(step);
        self
    }

    pub fn result_builder<F>(mut self, builder: F) -> Self
    where
        F: Fn(&RunSummary) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.result_builder = Some(Box::new(builder));
        self
    }

    pub fn build(self) -> Task {
        let name = self.name.unwrap_or_else(|| self.id.clone());
        Task {
            id: self.id,
            name,
            actions: self.actions,
            result_builder: self.result_builder,
            run_id: None,
            started_at: None,
            completed: 0,
            duration: Duration::ZERO,
            last_error: None,
            outcome: None,
            summary: None,
        }
    }
}

/// Ordered list of wrapped actions executed under one context
pub struct Task {
    id: String,
    name: String,
    actions: Vec<Box<dyn Step>>,
    result_builder: Option<ResultBuilder>,
    run_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed: usize,
    duration: Duration,
    last_error: Option<Arc<TaskLaneError>>,
    outcome: Option<Outcome>,
    summary: Option<RunSummary>,
}

impl Task {
    pub fn builder(id: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the current or last run; fresh for every run
    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn action_ids(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().map(|a| a.id())
    }

    pub fn completed_actions(&self) -> usize {
        self.completed
    }

    pub fn total_actions(&self) -> usize {
        self.actions.len()
    }

    /// Summed wall time of the actions completed in the last run
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Fraction of actions completed, in `0.0..=1.0`
    pub fn progress(&self) -> f64 {
        if self.actions.is_empty() {
            return 1.0;
        }
        self.completed as f64 / self.actions.len() as f64
    }

    pub fn last_error(&self) -> Option<Arc<TaskLaneError>> {
        self.last_error.clone()
    }

    pub fn summary(&self) -> Option<&RunSummary> {
        self.summary.as_ref()
    }

    /// Execute every action in order, stopping at the first failure.
    ///
    /// Cancellation is checked between actions. The run summary is published
    /// as this task's output whatever the outcome.
    pub async fn run(&mut self, ctx: &ExecutionContext) -> Result<RunSummary> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        self.run_id = Some(run_id.clone());
        self.started_at = Some(started_at);
        self.completed = 0;
        self.duration = Duration::ZERO;
        self.last_error = None;
        self.outcome = None;
        for step in self.actions.iter_mut() {
            step.reset();
        }

        let ctx = ctx.for_run(&self.id, &run_id);
        info!(
            task_id = %self.id,
            run_id = %run_id,
            actions = self.actions.len(),
            "task started"
        );

        let mut records = Vec::with_capacity(self.actions.len());
        let mut failure: Option<TaskLaneError> = None;

        for step in self.actions.iter_mut() {
            if ctx.is_cancelled() {
                failure = Some(TaskLaneError::cancelled_with_reason(
                    format!("task '{}'", self.id),
                    format!("before action '{}'", step.id()),
                ));
                break;
            }

            let started = Instant::now();
            match step.run(&ctx).await {
                Ok(output) => {
                    let elapsed = started.elapsed();
                    self.completed += 1;
                    self.duration += elapsed;
                    records.push(ActionRecord {
                        action_id: step.id().to_string(),
                        name: step.name().map(str::to_string),
                        elapsed_ms: elapsed.as_millis() as u64,
                        output,
                    });
                    debug!(
                        task_id = %self.id,
                        action_id = step.id(),
                        completed = self.completed,
                        "action completed"
                    );
                }
                Err(err) => {
                    let err = if ctx.is_cancelled() && !err.is_cancellation() {
                        TaskLaneError::cancelled_with_reason(
                            format!("action '{}'", step.id()),
                            err.to_string(),
                        )
                    } else {
                        err
                    };
                    failure = Some(err);
                    break;
                }
            }
        }

        let mut summary = RunSummary {
            task_id: self.id.clone(),
            task_name: self.name.clone(),
            run_id,
            started_at,
            completed_actions: self.completed,
            total_actions: self.actions.len(),
            duration_ms: self.duration.as_millis() as u64,
            actions: records,
            error: None,
        };

        if failure.is_none() {
            if let Some(builder) = &self.result_builder {
                match builder(&summary) {
                    Ok(value) => self.outcome = Some(Outcome::success(value)),
                    Err(source) => {
                        failure = Some(TaskLaneError::ResultBuilder {
                            task_id: self.id.clone(),
                            source,
                        })
                    }
                }
            }
        }

        let result = match failure {
            None => {
                info!(
                    task_id = %self.id,
                    completed = self.completed,
                    duration_ms = summary.duration_ms,
                    "task completed"
                );
                Ok(())
            }
            Some(err) => {
                let err = Arc::new(err);
                summary.error = Some(err.to_string());
                if self.result_builder.is_some() {
                    self.outcome = Some(Outcome::shared_failure(err.clone()));
                }
                if err.is_cancellation() {
                    warn!(task_id = %self.id, completed = self.completed, "task cancelled");
                } else {
                    warn!(
                        task_id = %self.id,
                        completed = self.completed,
                        error = %err,
                        category = err.category(),
                        "task failed"
                    );
                }
                self.last_error = Some(err.clone());
                Err(TaskLaneError::TaskFailed {
                    task_id: self.id.clone(),
                    source: err,
                })
            }
        };

        self.publish(&ctx, &summary);
        self.summary = Some(summary.clone());
        result.map(|()| summary)
    }

    fn publish(&self, ctx: &ExecutionContext, summary: &RunSummary) {
        match serde_json::to_value(summary) {
            Ok(output) => ctx.store().store_task_output(&self.id, output),
            Err(err) => warn!(task_id = %self.id, error = %err, "run summary not serializable"),
        }
        if let Some(outcome) = &self.outcome {
            ctx.store()
                .store_task_result(&self.id, Arc::new(outcome.clone()));
        }
    }
}

impl ResultProvider for Task {
    fn result(&self) -> Value {
        self.outcome
            .as_ref()
            .map(|o| o.value().clone())
            .unwrap_or(Value::Null)
    }

    fn error(&self) -> Option<Arc<TaskLaneError>> {
        self.last_error.clone()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("actions", &self.action_ids().collect::<Vec<_>>())
            .field("run_id", &self.run_id)
            .field("completed", &self.completed)
            .finish()
    }
}
