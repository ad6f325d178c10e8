use serde_json::Value;
use std::sync::Arc;

use crate::core::errors::TaskLaneError;

/// Typed `(result, error)` outcome exposed by a task or action,
/// separate from its free-form output.
pub trait ResultProvider: Send + Sync {
    /// The structured result value (`Null` when none was produced)
    fn result(&self) -> Value;

    /// The error recorded instead of a result, if any
    fn error(&self) -> Option<Arc<TaskLaneError>>;
}

/// Plain stored outcome, used for task results and by actions
/// that want to publish one.
#[derive(Debug, Clone)]
pub struct Outcome {
    value: Value,
    error: Option<Arc<TaskLaneError>>,
}

impl Outcome {
    pub fn success(value: Value) -> Self {
        Self { value, error: None }
    }

    pub fn failure(error: TaskLaneError) -> Self {
        Self::shared_failure(Arc::new(error))
    }

    pub fn shared_failure(error: Arc<TaskLaneError>) -> Self {
        Self {
            value: Value::Null,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

impl ResultProvider for Outcome {
    fn result(&self) -> Value {
        self.value.clone()
    }

    fn error(&self) -> Option<Arc<TaskLaneError>> {
        self.error.clone()
    }
}
