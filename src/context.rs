//! Execution context handed to every action
//!
//! Carries the value store parameters resolve against and the
//! cancellation token actions should honor.

use tokio_util::sync::CancellationToken;

use crate::core::errors::{Result, TaskLaneError};
use crate::store::ValueStore;

/// Context for a task run (cheap to clone)
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    store: ValueStore,
    cancellation_token: CancellationToken,
    task_id: Option<String>,
    run_id: Option<String>,
}

impl ExecutionContext {
    /// Create a context over the given store with a fresh cancellation token
    pub fn new(store: ValueStore) -> Self {
        Self {
            store,
            cancellation_token: CancellationToken::new(),
            task_id: None,
            run_id: None,
        }
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Same store and token, tagged with the task run it belongs to
    pub fn for_run(&self, task_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            store: self.store.clone(),
            cancellation_token: self.cancellation_token.clone(),
            task_id: Some(task_id.into()),
            run_id: Some(run_id.into()),
        }
    }

    pub fn store(&self) -> &ValueStore {
        &self.store
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Completes when cancellation is requested
    pub async fn cancelled(&self) {
        self.cancellation_token.cancelled().await
    }

    /// Child token cancelled together with this context
    pub fn child_token(&self) -> CancellationToken {
        self.cancellation_token.child_token()
    }

    /// Fail with `Cancelled` if cancellation was requested
    pub fn check_cancelled(&self, operation: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(TaskLaneError::cancelled(operation));
        }
        Ok(())
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(ValueStore::new())
    }
}
