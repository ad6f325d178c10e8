//! Lazy value references
//!
//! A [`Parameter`] is resolved against the value store at the moment the
//! consuming action executes, never earlier, so it may point at the output of
//! an action that has not run yet when the task is assembled.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::core::errors::{Result, TaskLaneError};
use crate::store::{StoredValue, ValueKind, ValueStore};

/// Reference to a value, resolved on demand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Parameter {
    /// A concrete value
    Literal { value: Value },
    /// Output of another action, optionally one field of it
    ActionOutput {
        action_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    /// Output of another task, optionally one field of it
    TaskOutput {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    /// Typed result of another action
    ActionResult { action_id: String },
    /// Typed result of another task
    TaskResult { task_id: String },
}

impl Parameter {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal {
            value: value.into(),
        }
    }

    pub fn action_output(action_id: impl Into<String>) -> Self {
        Self::ActionOutput {
            action_id: action_id.into(),
            field: None,
        }
    }

    pub fn action_output_field(action_id: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ActionOutput {
            action_id: action_id.into(),
            field: Some(field.into()),
        }
    }

    pub fn task_output(task_id: impl Into<String>) -> Self {
        Self::TaskOutput {
            task_id: task_id.into(),
            field: None,
        }
    }

    pub fn task_output_field(task_id: impl Into<String>, field: impl Into<String>) -> Self {
        Self::TaskOutput {
            task_id: task_id.into(),
            field: Some(field.into()),
        }
    }

    pub fn action_result(action_id: impl Into<String>) -> Self {
        Self::ActionResult {
            action_id: action_id.into(),
        }
    }

    pub fn task_result(task_id: impl Into<String>) -> Self {
        Self::TaskResult {
            task_id: task_id.into(),
        }
    }

    /// Resolve against the store carried by the execution context
    pub fn resolve(&self, ctx: &ExecutionContext) -> Result<Value> {
        self.resolve_in(ctx.store())
    }

    /// Resolve against an explicit store
    pub fn resolve_in(&self, store: &ValueStore) -> Result<Value> {
        match self {
            Parameter::Literal { value } => Ok(value.clone()),
            Parameter::ActionOutput { action_id, field } => {
                resolve_output(store, ValueKind::ActionOutput, action_id, field.as_deref())
            }
            Parameter::TaskOutput { task_id, field } => {
                resolve_output(store, ValueKind::TaskOutput, task_id, field.as_deref())
            }
            Parameter::ActionResult { action_id } => {
                resolve_result(store, ValueKind::ActionResult, action_id)
            }
            Parameter::TaskResult { task_id } => resolve_result(store, ValueKind::TaskResult, task_id),
        }
    }

    /// Resolve and deserialize into `T`.
    ///
    /// Any failure is wrapped in [`TaskLaneError::Parameter`] carrying `name`.
    pub fn resolve_as<T: DeserializeOwned>(&self, ctx: &ExecutionContext, name: &str) -> Result<T> {
        self.resolve_typed(ctx, name, short_type_name::<T>())
    }

    pub fn resolve_string(&self, ctx: &ExecutionContext, name: &str) -> Result<String> {
        self.resolve_typed(ctx, name, "string")
    }

    pub fn resolve_bool(&self, ctx: &ExecutionContext, name: &str) -> Result<bool> {
        self.resolve_typed(ctx, name, "bool")
    }

    pub fn resolve_int(&self, ctx: &ExecutionContext, name: &str) -> Result<i64> {
        self.resolve_typed(ctx, name, "integer")
    }

    pub fn resolve_string_list(&self, ctx: &ExecutionContext, name: &str) -> Result<Vec<String>> {
        self.resolve_typed(ctx, name, "list of strings")
    }

    fn resolve_typed<T: DeserializeOwned>(
        &self,
        ctx: &ExecutionContext,
        name: &str,
        expected: &str,
    ) -> Result<T> {
        let value = self
            .resolve(ctx)
            .map_err(|e| TaskLaneError::parameter(name, e))?;
        let actual = json_type_name(&value);
        serde_json::from_value(value).map_err(|_| {
            TaskLaneError::parameter(name, TaskLaneError::type_mismatch(expected, actual))
        })
    }
}

fn resolve_output(store: &ValueStore, kind: ValueKind, id: &str, field: Option<&str>) -> Result<Value> {
    let output = match store.lookup(kind, id) {
        Some(StoredValue::Output(value)) => value,
        _ => return Err(TaskLaneError::not_found(kind, id)),
    };
    let Some(field) = field else {
        return Ok(output);
    };
    output
        .as_object()
        .and_then(|map| map.get(field))
        .cloned()
        .ok_or_else(|| TaskLaneError::field_missing(kind, id, field))
}

fn resolve_result(store: &ValueStore, kind: ValueKind, id: &str) -> Result<Value> {
    let provider = match store.lookup(kind, id) {
        Some(StoredValue::Result(provider)) => provider,
        _ => return Err(TaskLaneError::not_found(kind, id)),
    };
    if let Some(source) = provider.error() {
        return Err(TaskLaneError::Upstream {
            kind,
            id: id.to_string(),
            source,
        });
    }
    Ok(provider.result())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() => "integer",
        Value::Number(n) if n.is_u64() => "integer beyond i64 range",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    match full.find('<') {
        Some(_) => full,
        None => full.rsplit("::").next().unwrap_or(full),
    }
}

impl From<Value> for Parameter {
    fn from(value: Value) -> Self {
        Parameter::Literal { value }
    }
}

impl From<&str> for Parameter {
    fn from(value: &str) -> Self {
        Parameter::literal(value)
    }
}

impl From<String> for Parameter {
    fn from(value: String) -> Self {
        Parameter::literal(value)
    }
}

impl From<bool> for Parameter {
    fn from(value: bool) -> Self {
        Parameter::literal(value)
    }
}

impl From<i64> for Parameter {
    fn from(value: i64) -> Self {
        Parameter::literal(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Outcome;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx() -> ExecutionContext {
        ExecutionContext::default()
    }

    #[test]
    fn test_literal_never_fails() {
        let ctx = ctx();
        assert_eq!(Parameter::literal(7).resolve(&ctx).unwrap(), json!(7));
        assert_eq!(Parameter::from("x").resolve_string(&ctx, "p").unwrap(), "x");
    }

    #[test]
    fn test_missing_keys_fail_with_not_found() {
        let ctx = ctx();
        let params = [
            (Parameter::action_output("a1"), ValueKind::ActionOutput),
            (Parameter::action_output_field("a1", "x"), ValueKind::ActionOutput),
            (Parameter::task_output("t1"), ValueKind::TaskOutput),
            (Parameter::task_output_field("t1", "x"), ValueKind::TaskOutput),
            (Parameter::action_result("a1"), ValueKind::ActionResult),
            (Parameter::task_result("t1"), ValueKind::TaskResult),
        ];
        for (param, expected_kind) in params {
            match param.resolve(&ctx) {
                Err(TaskLaneError::NotFound { kind, .. }) => assert_eq!(kind, expected_kind),
                other => panic!("expected NotFound for {:?}, got {:?}", param, other),
            }
        }
    }

    #[test]
    fn test_output_field_lookup() {
        let ctx = ctx();
        ctx.store().store_action_output("a1", json!({"x": 5}));
        ctx.store().store_task_output("t1", json!("plain"));

        assert_eq!(Parameter::action_output_field("a1", "x").resolve(&ctx).unwrap(), json!(5));
        assert_eq!(Parameter::action_output("a1").resolve(&ctx).unwrap(), json!({"x": 5}));
        assert!(matches!(
            Parameter::action_output_field("a1", "y").resolve(&ctx),
            Err(TaskLaneError::FieldMissing { .. })
        ));
        assert!(matches!(
            Parameter::task_output_field("t1", "x").resolve(&ctx),
            Err(TaskLaneError::FieldMissing { .. })
        ));
    }

    #[test]
    fn test_result_refs_propagate_upstream_errors() {
        let ctx = ctx();
        ctx.store()
            .store_task_result("ok", Arc::new(Outcome::success(json!({"n": 1}))));
        ctx.store().store_action_result(
            "bad",
            Arc::new(Outcome::failure(TaskLaneError::internal("disk full"))),
        );

        assert_eq!(Parameter::task_result("ok").resolve(&ctx).unwrap(), json!({"n": 1}));
        let err = Parameter::action_result("bad").resolve(&ctx).unwrap_err();
        match err {
            TaskLaneError::Upstream { kind, id, source } => {
                assert_eq!(kind, ValueKind::ActionResult);
                assert_eq!(id, "bad");
                assert_eq!(source.to_string(), "internal error: disk full");
            }
            other => panic!("expected Upstream, got {:?}", other),
        }
    }

    #[test]
    fn test_typed_helpers() {
        let ctx = ctx();
        ctx.store().store_action_output(
            "scan",
            json!({"count": 3, "recursive": true, "files": ["a", "b"], "ratio": 0.5}),
        );

        let p = |field: &str| Parameter::action_output_field("scan", field);
        assert_eq!(p("count").resolve_int(&ctx, "count").unwrap(), 3);
        assert!(p("recursive").resolve_bool(&ctx, "recursive").unwrap());
        assert_eq!(
            p("files").resolve_string_list(&ctx, "files").unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );

        let err = p("ratio").resolve_int(&ctx, "count").unwrap_err();
        assert_eq!(
            err.to_string(),
            "parameter 'count' could not be resolved: type mismatch: expected integer, found number"
        );

        let err = p("count").resolve_string(&ctx, "dest").unwrap_err();
        match err {
            TaskLaneError::Parameter { name, source } => {
                assert_eq!(name, "dest");
                assert!(matches!(*source, TaskLaneError::TypeMismatch { .. }));
            }
            other => panic!("expected Parameter error, got {:?}", other),
        }

        let err = Parameter::action_output("nope")
            .resolve_bool(&ctx, "flag")
            .unwrap_err();
        assert!(err.is_resolution());
        assert!(err.to_string().contains("no action output recorded for 'nope'"));
    }

    #[test]
    fn test_resolve_as_struct() {
        #[derive(Debug, PartialEq, Deserialize)]
        struct Target {
            path: String,
            mode: u32,
        }

        let ctx = ctx();
        ctx.store()
            .store_action_output("stat", json!({"path": "/tmp/x", "mode": 420}));
        let target: Target = Parameter::action_output("stat")
            .resolve_as(&ctx, "target")
            .unwrap();
        assert_eq!(
            target,
            Target {
                path: "/tmp/x".into(),
                mode: 420
            }
        );

        let err = Parameter::literal("oops")
            .resolve_as::<Target>(&ctx, "target")
            .unwrap_err();
        assert!(err.to_string().contains("expected Target, found string"));
    }

    #[test]
    fn test_serde_representation() {
        let yaml = r#"
- type: literal
  value: 5
- type: action_output
  action_id: a1
  field: x
- type: task_result
  task_id: t1
"#;
        let params: Vec<Parameter> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            params,
            vec![
                Parameter::literal(5),
                Parameter::action_output_field("a1", "x"),
                Parameter::task_result("t1"),
            ]
        );

        let json = serde_json::to_value(Parameter::action_output("a1")).unwrap();
        assert_eq!(json, json!({"type": "action_output", "action_id": "a1"}));
    }

    #[test]
    fn test_large_unsigned_mismatch_is_described() {
        let ctx = ExecutionContext::default();
        ctx.store().store_action_output("big", json!(u64::MAX));

        let err = Parameter::action_output("big").resolve_int(&ctx, "n").unwrap_err();
        assert_eq!(
            err.to_string(),
            "parameter 'n' could not be resolved: type mismatch: expected integer, found integer beyond i64 range"
        );
        let n: u64 = Parameter::action_output("big").resolve_as(&ctx, "n").unwrap();
        assert_eq!(n, u64::MAX);
    }
}
