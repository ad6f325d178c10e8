use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use super::result::ResultProvider;
use crate::core::errors::Result;

/// Which of the four store mappings a key lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    ActionOutput,
    ActionResult,
    TaskOutput,
    TaskResult,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ValueKind::ActionOutput => "action output",
            ValueKind::ActionResult => "action result",
            ValueKind::TaskOutput => "task output",
            ValueKind::TaskResult => "task result",
        };
        f.write_str(label)
    }
}

/// A value found by [`ValueStore::lookup`]
#[derive(Clone)]
pub enum StoredValue {
    Output(Value),
    Result(Arc<dyn ResultProvider>),
}

#[derive(Default)]
struct Slots {
    action_outputs: HashMap<String, Value>,
    action_results: HashMap<String, Arc<dyn ResultProvider>>,
    task_outputs: HashMap<String, Value>,
    task_results: HashMap<String, Arc<dyn ResultProvider>>,
}

/// Published outputs and results of actions and tasks.
///
/// All four mappings sit behind a single reader/writer lock; writes replace
/// the value for a key wholesale, so readers never see a partial output.
/// Cloning is cheap and shares the same underlying maps.
#[derive(Clone, Default)]
pub struct ValueStore {
    slots: Arc<RwLock<Slots>>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_action_output(&self, action_id: &str, output: Value) {
        trace!(action_id, "storing action output");
        self.slots
            .write()
            .action_outputs
            .insert(action_id.to_string(), output);
    }

    pub fn store_action_result(&self, action_id: &str, result: Arc<dyn ResultProvider>) {
        trace!(action_id, "storing action result");
        self.slots
            .write()
            .action_results
            .insert(action_id.to_string(), result);
    }

    pub fn store_task_output(&self, task_id: &str, output: Value) {
        trace!(task_id, "storing task output");
        self.slots
            .write()
            .task_outputs
            .insert(task_id.to_string(), output);
    }

    pub fn store_task_result(&self, task_id: &str, result: Arc<dyn ResultProvider>) {
        trace!(task_id, "storing task result");
        self.slots
            .write()
            .task_results
            .insert(task_id.to_string(), result);
    }

    /// Serialize any value and store it as an action output
    pub fn insert_action_output<T: Serialize>(&self, action_id: &str, output: &T) -> Result<()> {
        let value = serde_json::to_value(output)?;
        self.store_action_output(action_id, value);
        Ok(())
    }

    /// Look up a key in one of the four mappings.
    ///
    /// `None` only means "not written yet"; callers decide whether that is an error.
    pub fn lookup(&self, kind: ValueKind, id: &str) -> Option<StoredValue> {
        let slots = self.slots.read();
        match kind {
            ValueKind::ActionOutput => slots.action_outputs.get(id).cloned().map(StoredValue::Output),
            ValueKind::TaskOutput => slots.task_outputs.get(id).cloned().map(StoredValue::Output),
            ValueKind::ActionResult => slots.action_results.get(id).cloned().map(StoredValue::Result),
            ValueKind::TaskResult => slots.task_results.get(id).cloned().map(StoredValue::Result),
        }
    }

    pub fn action_output(&self, action_id: &str) -> Option<Value> {
        self.slots.read().action_outputs.get(action_id).cloned()
    }

    pub fn task_output(&self, task_id: &str) -> Option<Value> {
        self.slots.read().task_outputs.get(task_id).cloned()
    }

    pub fn action_result(&self, action_id: &str) -> Option<Arc<dyn ResultProvider>> {
        self.slots.read().action_results.get(action_id).cloned()
    }

    pub fn task_result(&self, task_id: &str) -> Option<Arc<dyn ResultProvider>> {
        self.slots.read().task_results.get(task_id).cloned()
    }

    pub fn contains(&self, kind: ValueKind, id: &str) -> bool {
        let slots = self.slots.read();
        match kind {
            ValueKind::ActionOutput => slots.action_outputs.contains_key(id),
            ValueKind::TaskOutput => slots.task_outputs.contains_key(id),
            ValueKind::ActionResult => slots.action_results.contains_key(id),
            ValueKind::TaskResult => slots.task_results.contains_key(id),
        }
    }

    /// Total number of entries across all four mappings
    pub fn len(&self) -> usize {
        let slots = self.slots.read();
        slots.action_outputs.len()
            + slots.action_results.len()
            + slots.task_outputs.len()
            + slots.task_results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything, keeping the store shared with existing clones
    pub fn clear(&self) {
        let mut slots = self.slots.write();
        *slots = Slots::default();
    }

    /// JSON view of the two output mappings, for diagnostics.
    /// Results are not serializable and are left out.
    pub fn snapshot_json(&self) -> Value {
        let slots = self.slots.read();
        let actions: serde_json::Map<String, Value> = slots
            .action_outputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let tasks: serde_json::Map<String, Value> = slots
            .task_outputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        serde_json::json!({ "actions": actions, "tasks": tasks })
    }

    pub fn to_pretty_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot_json())?)
    }
}

impl fmt::Debug for ValueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.read();
        f.debug_struct("ValueStore")
            .field("action_outputs", &slots.action_outputs.keys().collect::<Vec<_>>())
            .field("action_results", &slots.action_results.keys().collect::<Vec<_>>())
            .field("task_outputs", &slots.task_outputs.keys().collect::<Vec<_>>())
            .field("task_results", &slots.task_results.keys().collect::<Vec<_>>())
            .finish()
    }
}
