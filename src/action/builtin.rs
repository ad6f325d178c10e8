//! Generic plumbing actions
//!
//! These carry no domain logic of their own; they are handy for wiring
//! values between actions, for tests, and for wrapping plain async functions.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use super::Action;
use crate::context::ExecutionContext;
use crate::core::errors::TaskLaneError;
use crate::param::Parameter;

/// Resolves a named set of parameters and outputs them as one object
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EchoAction {
    pub inputs: BTreeMap<String, Parameter>,
    #[serde(skip)]
    resolved: Map<String, Value>,
}

impl EchoAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, name: impl Into<String>, param: impl Into<Parameter>) -> Self {
        self.inputs.insert(name.into(), param.into());
        self
    }
}

#[async_trait]
impl Action for EchoAction {
    fn kind(&self) -> &str {
        "echo"
    }

    async fn execute(&mut self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        let mut resolved = Map::new();
        for (name, param) in &self.inputs {
            let value = param
                .resolve(ctx)
                .map_err(|e| TaskLaneError::parameter(name.clone(), e))?;
            resolved.insert(name.clone(), value);
        }
        self.resolved = resolved;
        Ok(())
    }

    fn output(&self) -> Value {
        Value::Object(self.resolved.clone())
    }
}

/// Waits for a fixed duration, returning early with `Cancelled`
/// when the context is cancelled
#[derive(Debug, Clone)]
pub struct DelayAction {
    duration: Duration,
    slept: Option<Duration>,
}

impl DelayAction {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            slept: None,
        }
    }
}

#[async_trait]
impl Action for DelayAction {
    fn kind(&self) -> &str {
        "delay"
    }

    async fn execute(&mut self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        self.slept = None;
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => {
                self.slept = Some(self.duration);
                Ok(())
            }
            _ = ctx.cancelled() => {
                Err(TaskLaneError::cancelled_with_reason(
                    "delay",
                    format!("cancelled before {}ms elapsed", self.duration.as_millis()),
                )
                .into())
            }
        }
    }

    fn output(&self) -> Value {
        match self.slept {
            Some(d) => json!({ "slept_ms": d.as_millis() as u64 }),
            None => Value::Null,
        }
    }
}

type ActionFn = Box<dyn Fn(ExecutionContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Adapts an async closure into an action; the closure's return value
/// becomes the output.
pub struct FnAction {
    kind: String,
    func: ActionFn,
    output: Value,
}

impl FnAction {
    pub fn new<F, Fut>(kind: impl Into<String>, func: F) -> Self
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            kind: kind.into(),
            func: Box::new(move |ctx| Box::pin(func(ctx))),
            output: Value::Null,
        }
    }
}

#[async_trait]
impl Action for FnAction {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn execute(&mut self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        self.output = (self.func)(ctx.clone()).await?;
        Ok(())
    }

    fn output(&self) -> Value {
        self.output.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionWrapper;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_echo_resolves_inputs() {
        let ctx = ExecutionContext::default();
        ctx.store().store_action_output("stat", json!({"path": "/tmp/x"}));

        let mut echo = ActionWrapper::with_id(
            "echo-1",
            EchoAction::new()
                .with_input("path", Parameter::action_output_field("stat", "path"))
                .with_input("mode", "0644"),
        );
        let output = echo.run(&ctx).await.unwrap();
        assert_eq!(output, json!({"path": "/tmp/x", "mode": "0644"}));
    }

    #[tokio::test]
    async fn test_echo_names_failing_parameter() {
        let ctx = ExecutionContext::default();
        let mut echo = ActionWrapper::with_id(
            "echo-1",
            EchoAction::new().with_input("src", Parameter::action_output("missing")),
        );
        let err = echo.run(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("parameter 'src' could not be resolved"));
    }

    #[test]
    fn test_echo_from_yaml() {
        let yaml = r#"
inputs:
  dest:
    type: task_output
    task_id: prepare
    field: dir
  overwrite:
    type: literal
    value: true
"#;
        let echo: EchoAction = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(echo.inputs.len(), 2);
        assert_eq!(echo.inputs["overwrite"], Parameter::literal(true));
    }

    #[tokio::test]
    async fn test_delay_honors_cancellation() {
        let ctx = ExecutionContext::default();
        let mut delay = ActionWrapper::with_id("d1", DelayAction::new(Duration::from_secs(30)));

        let token = ctx.cancellation_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let started = std::time::Instant::now();
        let err = delay.run(&ctx).await.unwrap_err();
        assert!(err.is_cancellation());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_fn_action_output() {
        let ctx = ExecutionContext::default();
        ctx.store().store_action_output("a1", json!({"x": 5}));

        let mut double = ActionWrapper::with_id(
            "double",
            FnAction::new("double", |ctx: ExecutionContext| async move {
                let x = Parameter::action_output_field("a1", "x").resolve_int(&ctx, "x")?;
                Ok::<_, anyhow::Error>(json!({ "y": x * 2 }))
            }),
        );
        assert_eq!(double.run(&ctx).await.unwrap(), json!({"y": 10}));
        assert_eq!(ctx.store().action_output("double"), Some(json!({"y": 10})));
    }
}
