//! tasklane: a small in-process execution engine
//!
//! Actions run inside tasks; tasks run concurrently under a [`TaskManager`].
//! Every action publishes its output into a shared [`ValueStore`], and later
//! actions consume those outputs through [`Parameter`] references.

// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
}

pub mod action;
pub mod context;
pub mod manager;
pub mod param;
pub mod store;
pub mod task;
pub mod telemetry;

// Re-exports for convenience
pub use action::{Action, ActionState, ActionWrapper, DelayAction, EchoAction, FnAction, Step};
pub use context::ExecutionContext;
pub use core::config::{ManagerConfig, ManagerConfigBuilder};
pub use core::errors::{Result, TaskLaneError};
pub use manager::{TaskManager, TaskState};
pub use param::Parameter;
pub use store::{Outcome, ResultProvider, StoredValue, ValueKind, ValueStore};
pub use task::{ActionRecord, ResultBuilder, RunSummary, Task, TaskBuilder};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    /// Reports the path it was pointed at instead of touching the disk
    struct WritePath {
        path: Parameter,
        wrote: Option<String>,
    }

    #[async_trait]
    impl Action for WritePath {
        fn kind(&self) -> &str {
            "write_path"
        }

        async fn execute(&mut self, ctx: &ExecutionContext) -> anyhow::Result<()> {
            let path = self.path.resolve_string(ctx, "path")?;
            self.wrote = Some(path);
            Ok(())
        }

        fn output(&self) -> Value {
            json!({ "wrote": self.wrote })
        }
    }

    #[tokio::test]
    async fn test_task_manager() {
        let manager = TaskManager::new();
        let task = Task::builder("T")
            .action(
                "A",
                FnAction::new("stat", |_ctx| async {
                    Ok::<_, anyhow::Error>(json!({"path": "/tmp/x"}))
                }),
            )
            .action(
                "B",
                WritePath {
                    path: Parameter::action_output_field("A", "path"),
                    wrote: None,
                },
            )
            .build();

        manager.add_task(task).unwrap();
        manager.run_task("T").unwrap();
        manager.wait_for_task("T").await.unwrap();

        let store = manager.store();
        assert_eq!(store.action_output("B"), Some(json!({"wrote": "/tmp/x"})));

        let summary = manager.task_summary("T").unwrap();
        assert_eq!(summary.completed_actions, 2);
        assert!(matches!(
            manager.task_state("T"),
            Some(TaskState::Completed { completed_actions: 2, .. })
        ));
        assert!(manager.task_error("T").is_none());

        manager.reset_store();
        assert!(manager.store().is_empty());
    }
}
