use std::sync::Arc;
use thiserror::Error;

use crate::store::ValueKind;

/// Unified error type for the whole tasklane library
#[derive(Debug, Error)]
pub enum TaskLaneError {
    /// A referenced value was never written to the store
    #[error("no {kind} recorded for '{id}'")]
    NotFound { kind: ValueKind, id: String },

    /// The referenced output exists but has no such field
    #[error("field '{field}' not present in {kind} of '{id}'")]
    FieldMissing {
        kind: ValueKind,
        id: String,
        field: String,
    },

    /// A resolved value could not be read as the requested type
    #[error("type mismatch: expected {expected}, found {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// The referenced result slot carries an error instead of a value
    #[error("{kind} of '{id}' recorded an error: {source}")]
    Upstream {
        kind: ValueKind,
        id: String,
        #[source]
        source: Arc<TaskLaneError>,
    },

    /// Resolution of a named parameter failed
    #[error("parameter '{name}' could not be resolved: {source}")]
    Parameter {
        name: String,
        #[source]
        source: Box<TaskLaneError>,
    },

    /// A concrete action failed in one of its phases
    #[error("action '{action_id}' failed: {source}")]
    Action {
        action_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// A wrapper phase was invoked out of order
    #[error("action '{action_id}' cannot run {phase} while {state}")]
    Lifecycle {
        action_id: String,
        phase: &'static str,
        state: String,
    },

    /// Terminal error of a task run
    #[error("task '{task_id}' failed: {source}")]
    TaskFailed {
        task_id: String,
        #[source]
        source: Arc<TaskLaneError>,
    },

    /// The result builder of a task rejected the run
    #[error("result builder of task '{task_id}' failed: {source}")]
    ResultBuilder {
        task_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("task already registered: {task_id}")]
    TaskAlreadyRegistered { task_id: String },

    #[error("task already running: {task_id}")]
    TaskAlreadyRunning { task_id: String },

    #[error("task '{task_id}' uses action id '{action_id}' more than once")]
    DuplicateActionId { task_id: String, action_id: String },

    #[error("resource exhausted: {resource} (current: {current}, limit: {limit})")]
    ResourceExhausted {
        resource: String,
        current: usize,
        limit: usize,
    },

    /// Cooperative cancellation was observed
    #[error("operation was cancelled: {operation}{}", reason_suffix(.reason))]
    Cancelled {
        operation: String,
        reason: Option<String>,
    },

    #[error("operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl TaskLaneError {
    pub fn not_found<S: Into<String>>(kind: ValueKind, id: S) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn field_missing<S: Into<String>, F: Into<String>>(kind: ValueKind, id: S, field: F) -> Self {
        Self::FieldMissing {
            kind,
            id: id.into(),
            field: field.into(),
        }
    }

    pub fn type_mismatch<E: Into<String>, A: Into<String>>(expected: E, actual: A) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Wrap a resolution failure with the name of the parameter that caused it
    pub fn parameter<S: Into<String>>(name: S, source: TaskLaneError) -> Self {
        Self::Parameter {
            name: name.into(),
            source: Box::new(source),
        }
    }

    pub fn action<S: Into<String>>(action_id: S, source: anyhow::Error) -> Self {
        Self::Action {
            action_id: action_id.into(),
            source,
        }
    }

    pub fn task_not_found<S: Into<String>>(task_id: S) -> Self {
        Self::TaskNotFound {
            task_id: task_id.into(),
        }
    }

    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            reason: None,
        }
    }

    pub fn cancelled_with_reason<S: Into<String>, R: Into<String>>(operation: S, reason: R) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            reason: Some(reason.into()),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True when this error, or the error it wraps, is a cancellation
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::Parameter { source, .. } => source.is_cancellation(),
            Self::TaskFailed { source, .. } => source.is_cancellation(),
            Self::Action { source, .. } => source
                .downcast_ref::<TaskLaneError>()
                .map_or(false, TaskLaneError::is_cancellation),
            _ => false,
        }
    }

    /// True for failures that happen while resolving a parameter
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::FieldMissing { .. }
                | Self::TypeMismatch { .. }
                | Self::Upstream { .. }
                | Self::Parameter { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotFound { .. }
            | Self::FieldMissing { .. }
            | Self::TypeMismatch { .. }
            | Self::Upstream { .. }
            | Self::Parameter { .. } => "resolution",
            Self::Action { .. } | Self::Lifecycle { .. } => "action",
            Self::TaskFailed { .. } | Self::ResultBuilder { .. } => "task",
            Self::TaskNotFound { .. }
            | Self::TaskAlreadyRegistered { .. }
            | Self::TaskAlreadyRunning { .. }
            | Self::DuplicateActionId { .. }
            | Self::ResourceExhausted { .. } => "manager",
            Self::Cancelled { .. } => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|r| format!(" ({r})"))
        .unwrap_or_default()
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, TaskLaneError>;

impl From<std::io::Error> for TaskLaneError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            operation: "io_operation".to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for TaskLaneError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            format: "json".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<serde_yaml::Error> for TaskLaneError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization {
            format: "yaml".to_string(),
            source: Box::new(err),
        }
    }
}
