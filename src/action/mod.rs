//! Actions and the wrapper that drives their lifecycle
//!
//! A concrete [`Action`] does the work. [`ActionWrapper`] gives it an id and
//! a uniform `before_execute -> execute -> after_execute` lifecycle, then
//! publishes its output into the value store.

pub mod builtin;

pub use builtin::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::core::errors::{Result, TaskLaneError};
use crate::store::{Outcome, ResultProvider};

/// A concrete unit of work.
///
/// Parameterized fields should be resolved inside `execute`, against
/// `ctx`, so they observe outputs published by earlier actions.
#[async_trait]
pub trait Action: Send + Sync {
    /// Short name of the action type, used for generated ids and logs
    fn kind(&self) -> &str;

    async fn before_execute(&mut self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&mut self, ctx: &ExecutionContext) -> anyhow::Result<()>;

    /// Runs only after a successful `execute`
    async fn after_execute(&mut self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Output to publish. Must be side-effect free.
    fn output(&self) -> Value;

    /// Optional typed result, published under the action id
    fn result(&self) -> Option<Arc<dyn ResultProvider>> {
        None
    }
}

/// Lifecycle position of a wrapped action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Created,
    BeforeExecuted,
    Executed,
    AfterExecuted,
    Failed,
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ActionState::Created => "created",
            ActionState::BeforeExecuted => "before-executed",
            ActionState::Executed => "executed",
            ActionState::AfterExecuted => "after-executed",
            ActionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Uniform envelope around one concrete action
pub struct ActionWrapper<A> {
    id: String,
    name: Option<String>,
    action: A,
    state: ActionState,
    elapsed: Duration,
}

impl<A: Action> ActionWrapper<A> {
    /// Wrap an action under a generated `<kind>-<uuid>` id
    pub fn new(action: A) -> Self {
        let id = format!("{}-{}", action.kind(), uuid::Uuid::new_v4().simple());
        Self::with_id(id, action)
    }

    pub fn with_id(id: impl Into<String>, action: A) -> Self {
        Self {
            id: id.into(),
            name: None,
            action,
            state: ActionState::Created,
            elapsed: Duration::ZERO,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> ActionState {
        self.state
    }

    pub fn action(&self) -> &A {
        &self.action
    }

    /// Wall time of the last full lifecycle
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn output(&self) -> Value {
        self.action.output()
    }

    pub async fn before_execute(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.expect_state(ActionState::Created, "before_execute")?;
        debug!(action_id = %self.id, "before_execute");
        let res = self.action.before_execute(ctx).await;
        self.advance(res, ActionState::BeforeExecuted)
    }

    pub async fn execute(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.expect_state(ActionState::BeforeExecuted, "execute")?;
        debug!(action_id = %self.id, kind = self.action.kind(), "execute");
        let res = self.action.execute(ctx).await;
        self.advance(res, ActionState::Executed)
    }

    pub async fn after_execute(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.expect_state(ActionState::Executed, "after_execute")?;
        debug!(action_id = %self.id, "after_execute");
        let res = self.action.after_execute(ctx).await;
        self.advance(res, ActionState::AfterExecuted)
    }

    /// Full lifecycle, then publish the output (and result, if any).
    /// Returns the published output.
    pub async fn run(&mut self, ctx: &ExecutionContext) -> Result<Value> {
        let started = Instant::now();
        let res = self.run_phases(ctx).await;
        self.elapsed = started.elapsed();
        if let Err(err) = res {
            warn!(action_id = %self.id, error = %err, "action failed");
            // Lifecycle misuse leaves the previous result untouched
            if self.state == ActionState::Failed {
                self.publish_failure(ctx, &err);
            }
            return Err(err);
        }

        let output = self.action.output();
        ctx.store().store_action_output(&self.id, output.clone());
        if let Some(result) = self.action.result() {
            ctx.store().store_action_result(&self.id, result);
        }
        debug!(
            action_id = %self.id,
            elapsed_ms = self.elapsed.as_millis() as u64,
            "action output published"
        );
        Ok(output)
    }

    /// Back to `Created` so the wrapper can take part in another task run
    pub fn reset(&mut self) {
        self.state = ActionState::Created;
        self.elapsed = Duration::ZERO;
    }

    /// Record the failure in the result slot of actions that publish results,
    /// so `ActionResult` references see the upstream error instead of nothing.
    fn publish_failure(&self, ctx: &ExecutionContext, err: &TaskLaneError) {
        let Some(result) = self.action.result() else {
            return;
        };
        if result.error().is_some() {
            ctx.store().store_action_result(&self.id, result);
            return;
        }
        let detached = match err {
            TaskLaneError::Action { action_id, source } => {
                TaskLaneError::action(action_id.clone(), anyhow::anyhow!("{:#}", source))
            }
            other => TaskLaneError::internal(other.to_string()),
        };
        ctx.store()
            .store_action_result(&self.id, Arc::new(Outcome::failure(detached)));
    }

    async fn run_phases(&mut self, ctx: &ExecutionContext) -> Result<()> {
        self.before_execute(ctx).await?;
        self.execute(ctx).await?;
        self.after_execute(ctx).await
    }

    fn expect_state(&self, expected: ActionState, phase: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(TaskLaneError::Lifecycle {
                action_id: self.id.clone(),
                phase,
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    fn advance(&mut self, res: anyhow::Result<()>, next: ActionState) -> Result<()> {
        match res {
            Ok(()) => {
                self.state = next;
                Ok(())
            }
            Err(err) => {
                self.state = ActionState::Failed;
                Err(TaskLaneError::action(self.id.clone(), err))
            }
        }
    }
}

/// Object-safe view of a wrapped action, so a task can hold
/// wrappers around different action types in one list.
#[async_trait]
pub trait Step: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> Option<&str>;
    fn state(&self) -> ActionState;
    fn output(&self) -> Value;
    fn elapsed(&self) -> Duration;
    fn reset(&mut self);
    async fn run(&mut self, ctx: &ExecutionContext) -> Result<Value>;
}

#[async_trait]
impl<A: Action> Step for ActionWrapper<A> {
    fn id(&self) -> &str {
        ActionWrapper::id(self)
    }

    fn name(&self) -> Option<&str> {
        ActionWrapper::name(self)
    }

    fn state(&self) -> ActionState {
        ActionWrapper::state(self)
    }

    fn output(&self) -> Value {
        ActionWrapper::output(self)
    }

    fn elapsed(&self) -> Duration {
        ActionWrapper::elapsed(self)
    }

    fn reset(&mut self) {
        ActionWrapper::reset(self)
    }

    async fn run(&mut self, ctx: &ExecutionContext) -> Result<Value> {
        ActionWrapper::run(self, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::Parameter;
    use serde_json::json;

    #[derive(Default)]
    struct Probe {
        fail_in: Option<&'static str>,
        phases: Vec<&'static str>,
    }

    impl Probe {
        fn phase(&mut self, phase: &'static str) -> anyhow::Result<()> {
            self.phases.push(phase);
            if self.fail_in == Some(phase) {
                anyhow::bail!("{} exploded", phase);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Action for Probe {
        fn kind(&self) -> &str {
            "probe"
        }

        async fn before_execute(&mut self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
            self.phase("before")
        }

        async fn execute(&mut self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
            self.phase("execute")
        }

        async fn after_execute(&mut self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
            self.phase("after")
        }

        fn output(&self) -> Value {
            json!({ "phases": self.phases })
        }

        fn result(&self) -> Option<Arc<dyn ResultProvider>> {
            Some(Arc::new(Outcome::success(json!(self.phases.len()))))
        }
    }

    #[tokio::test]
    async fn test_full_lifecycle_publishes_output_and_result() {
        let ctx = ExecutionContext::default();
        let mut wrapper = ActionWrapper::with_id("p1", Probe::default()).named("probe one");

        let output = wrapper.run(&ctx).await.unwrap();
        assert_eq!(output, json!({"phases": ["before", "execute", "after"]}));
        assert_eq!(wrapper.state(), ActionState::AfterExecuted);
        assert_eq!(wrapper.name(), Some("probe one"));
        assert_eq!(ctx.store().action_output("p1"), Some(output));
        assert_eq!(ctx.store().action_result("p1").unwrap().result(), json!(3));

        // output() is side-effect free
        assert_eq!(wrapper.output(), wrapper.output());
    }

    #[tokio::test]
    async fn test_before_failure_short_circuits() {
        let ctx = ExecutionContext::default();
        let mut wrapper = ActionWrapper::with_id(
            "p1",
            Probe {
                fail_in: Some("before"),
                ..Default::default()
            },
        );

        let err = wrapper.run(&ctx).await.unwrap_err();
        assert!(matches!(err, TaskLaneError::Action { ref action_id, .. } if action_id == "p1"));
        assert_eq!(wrapper.state(), ActionState::Failed);
        assert_eq!(wrapper.action().phases, vec!["before"]);
        assert!(ctx.store().action_output("p1").is_none());
    }

    #[tokio::test]
    async fn test_after_execute_skipped_when_execute_fails() {
        let ctx = ExecutionContext::default();
        let mut wrapper = ActionWrapper::with_id(
            "p1",
            Probe {
                fail_in: Some("execute"),
                ..Default::default()
            },
        );

        assert!(wrapper.run(&ctx).await.is_err());
        assert_eq!(wrapper.action().phases, vec!["before", "execute"]);
        assert!(ctx.store().action_output("p1").is_none());
    }

    #[tokio::test]
    async fn test_failed_action_publishes_error_result() {
        let ctx = ExecutionContext::default();
        let mut wrapper = ActionWrapper::with_id(
            "p1",
            Probe {
                fail_in: Some("execute"),
                ..Default::default()
            },
        );
        assert!(wrapper.run(&ctx).await.is_err());

        // Probe reports a success outcome, so the wrapper's error replaces it
        let stored = ctx.store().action_result("p1").unwrap();
        assert_eq!(stored.result(), Value::Null);
        let err = stored.error().unwrap();
        assert!(err.to_string().contains("execute exploded"));

        match Parameter::action_result("p1").resolve(&ctx) {
            Err(TaskLaneError::Upstream { id, source, .. }) => {
                assert_eq!(id, "p1");
                assert!(source.to_string().contains("execute exploded"));
            }
            other => panic!("expected Upstream, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_out_of_order_phase_keeps_previous_result() {
        let ctx = ExecutionContext::default();
        let mut wrapper = ActionWrapper::with_id("p1", Probe::default());
        wrapper.run(&ctx).await.unwrap();

        assert!(wrapper.run(&ctx).await.is_err());
        let stored = ctx.store().action_result("p1").unwrap();
        assert!(stored.error().is_none());
        assert_eq!(stored.result(), json!(3));
    }

    #[tokio::test]
    async fn test_phases_out_of_order_are_rejected() {
        let ctx = ExecutionContext::default();
        let mut wrapper = ActionWrapper::with_id("p1", Probe::default());

        let err = wrapper.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, TaskLaneError::Lifecycle { phase: "execute", .. }));

        wrapper.run(&ctx).await.unwrap();
        assert!(matches!(
            wrapper.run(&ctx).await,
            Err(TaskLaneError::Lifecycle { .. })
        ));

        wrapper.reset();
        assert_eq!(wrapper.state(), ActionState::Created);
        assert!(wrapper.run(&ctx).await.is_ok());
    }

    #[test]
    fn test_generated_ids_carry_kind() {
        let a = ActionWrapper::new(Probe::default());
        let b = ActionWrapper::new(Probe::default());
        assert!(a.id().starts_with("probe-"));
        assert_ne!(a.id(), b.id());
    }
}
