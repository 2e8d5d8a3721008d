//! Domain hooks the dispatch queue calls around lease and completion.

use async_trait::async_trait;
use serde_json::Value;

use super::model::{Task, TaskType};
use crate::error::DatabaseError;

/// Record-keeping that belongs to the subjects tasks act on, not to the queue.
///
/// All three hooks run while the queue holds the lease lock for the task's type.
#[async_trait]
pub trait TaskHooks: Send + Sync {
    /// Data payloads for eligible subjects that have no task of this type yet.
    ///
    /// `existing` is every task of the type, in any status.
    async fn missing_tasks(
        &self,
        task_type: TaskType,
        existing: &[Task],
    ) -> Result<Vec<Value>, DatabaseError>;

    /// Replacement data for a task about to be leased, or `None` to keep it.
    async fn enrich(&self, task: &Task) -> Result<Option<Value>, DatabaseError>;

    /// Side effects of a task reaching COMPLETED. Failures are logged by the caller.
    async fn on_completed(&self, task: &Task) -> Result<(), DatabaseError>;
}

/// Hooks that do nothing.
pub struct NoHooks;

#[async_trait]
impl TaskHooks for NoHooks {
    async fn missing_tasks(
        &self,
        _task_type: TaskType,
        _existing: &[Task],
    ) -> Result<Vec<Value>, DatabaseError> {
        Ok(Vec::new())
    }

    async fn enrich(&self, _task: &Task) -> Result<Option<Value>, DatabaseError> {
        Ok(None)
    }

    async fn on_completed(&self, _task: &Task) -> Result<(), DatabaseError> {
        Ok(())
    }
}
