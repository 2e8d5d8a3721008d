//! Hand-written workflows, one per task type.

pub mod anycard_load;
pub mod getmybonus;

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::{Value, json};

use super::resume::ResumptionState;
use super::steps::Step;
use super::surface::Observation;
use crate::error::WorkflowError;
use crate::tasks::model::{Task, TaskType};

pub use anycard_load::AnycardLoadWorkflow;
pub use getmybonus::GetmybonusWorkflow;

/// How the executor decides a submitted task is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// A later page yields the result through a finishing step.
    Page,
    /// Poll [`Workflow::signal`] until it has moved by the expected delta.
    Delta,
}

pub trait Workflow: Send + Sync {
    fn task_type(&self) -> TaskType;

    /// Steps in priority order.
    fn steps(&self) -> &[Box<dyn Step>];

    fn verification(&self) -> Verification {
        Verification::Page
    }

    /// Reject malformed tasks before any action is taken.
    fn validate(&self, task: &Task) -> Result<(), WorkflowError>;

    /// Failure reason when nothing on the page matches and nothing was submitted.
    fn no_step_message(&self) -> &'static str;

    /// Observable value for delta verification, when the page shows it.
    fn signal(&self, _task: &Task, _observation: &Observation) -> Option<Decimal> {
        None
    }

    /// Task result once delta verification passes.
    fn verified_result(&self, task: &Task, state: &ResumptionState, current: Decimal) -> Value {
        json!({
            "outcome": "verified",
            "taskType": task.task_type,
            "baseline": state.baseline.map(|d| d.to_string()),
            "expectedDelta": state.expected_delta.map(|d| d.to_string()),
            "current": current.to_string(),
        })
    }
}

/// Workflows keyed by task type.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<TaskType, Arc<dyn Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every workflow this crate ships.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GetmybonusWorkflow::new()));
        registry.register(Arc::new(AnycardLoadWorkflow::new()));
        registry
    }

    pub fn register(&mut self, workflow: Arc<dyn Workflow>) {
        self.workflows.insert(workflow.task_type(), workflow);
    }

    pub fn workflow_for(&self, task_type: TaskType) -> Result<Arc<dyn Workflow>, WorkflowError> {
        self.workflows
            .get(&task_type)
            .cloned()
            .ok_or_else(|| WorkflowError::Unsupported(task_type.to_string()))
    }
}

/// Required text field of the task data, under any of `keys`.
pub(crate) fn required(task: &Task, keys: &[&str]) -> Result<String, WorkflowError> {
    task.data_text(keys)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| WorkflowError::MissingField(keys.first().copied().unwrap_or_default().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_covers_every_type() {
        let registry = WorkflowRegistry::standard();
        for t in TaskType::ALL {
            assert_eq!(registry.workflow_for(t).unwrap().task_type(), t);
        }
    }

    #[test]
    fn empty_registry_reports_unsupported() {
        let err = WorkflowRegistry::new()
            .workflow_for(TaskType::AnycardLoad)
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "Unsupported task type: anycard_load");
    }
}
