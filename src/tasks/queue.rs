//! Dispatch queue: pull-based leasing over the task store, with broadcast to WebSocket clients.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::hooks::{NoHooks, TaskHooks};
use super::model::{CreateTaskRequest, Task, TaskEvent, TaskStatus, TaskType};
use crate::error::TaskError;
use crate::store::Database;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// The coordinator's view of the task store.
///
/// `enqueue` and `next` for the same type are serialized by a per-type lock; the
/// store's conditional updates make `complete`/`fail` exactly-once without it.
pub struct DispatchQueue {
    db: Arc<dyn Database>,
    hooks: Arc<dyn TaskHooks>,
    lease_locks: HashMap<TaskType, Mutex<()>>,
    tx: broadcast::Sender<TaskEvent>,
}

impl DispatchQueue {
    /// Create a queue with no domain hooks.
    pub fn new(db: Arc<dyn Database>) -> Arc<Self> {
        Self::with_hooks(db, Arc::new(NoHooks))
    }

    pub fn with_hooks(db: Arc<dyn Database>, hooks: Arc<dyn TaskHooks>) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        let lease_locks = TaskType::ALL.into_iter().map(|t| (t, Mutex::new(()))).collect();
        Arc::new(Self {
            db,
            hooks,
            lease_locks,
            tx,
        })
    }

    /// Subscribe to task events. Each WS client calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    fn lock_for(&self, task_type: TaskType) -> &Mutex<()> {
        // Every TaskType has an entry, see `with_hooks`.
        &self.lease_locks[&task_type]
    }

    fn publish(&self, event: TaskEvent) {
        // Broadcast; ok if no receivers are listening yet
        let _ = self.tx.send(event);
    }

    /// Create a task from an API request body.
    pub async fn create(&self, req: CreateTaskRequest) -> Result<Task, TaskError> {
        let task_type: TaskType = req.task_type.parse()?;
        self.enqueue(task_type, req.data).await
    }

    /// Create a new READY task.
    pub async fn enqueue(&self, task_type: TaskType, data: Value) -> Result<Task, TaskError> {
        let _guard = self.lock_for(task_type).lock().await;
        self.insert(task_type, data).await
    }

    async fn insert(&self, task_type: TaskType, data: Value) -> Result<Task, TaskError> {
        let task = Task::new(task_type, data);
        self.db.insert_task(&task).await?;
        info!(task_id = %task.id, task_type = %task_type, "Task created");
        self.publish(TaskEvent::TaskCreated { task: task.clone() });
        Ok(task)
    }

    /// Lease the oldest READY task of a type. `None` when nothing is ready or the
    /// type is single-flight and already has a task IN_PROGRESS.
    pub async fn next(&self, task_type: TaskType) -> Result<Option<Task>, TaskError> {
        let _guard = self.lock_for(task_type).lock().await;

        let existing = self.db.list_tasks_by_type(task_type).await?;
        for data in self.hooks.missing_tasks(task_type, &existing).await? {
            self.insert(task_type, data).await?;
        }

        if task_type.is_single_flight() && self.db.has_in_progress(task_type).await? {
            debug!(task_type = %task_type, "Lease refused, a task is already in progress");
            return Ok(None);
        }

        let Some(task) = self.db.oldest_ready_task(task_type).await? else {
            return Ok(None);
        };

        let data = match self.hooks.enrich(&task).await {
            Ok(Some(enriched)) => enriched,
            Ok(None) => task.data.clone(),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Task enrichment failed, leasing as-is");
                task.data.clone()
            }
        };

        let claimed = self
            .db
            .claim_task(task.id, task_type, task_type.is_single_flight(), &data, Utc::now())
            .await?;
        if !claimed {
            debug!(task_id = %task.id, "Lease lost the claim");
            return Ok(None);
        }

        let leased = self.fetch(task.id).await?;
        info!(task_id = %leased.id, task_type = %task_type, "Task leased");
        self.publish(TaskEvent::TaskUpdated {
            task: leased.clone(),
        });
        Ok(Some(leased))
    }

    /// Get a task by ID.
    pub async fn get(&self, id: Uuid) -> Result<Task, TaskError> {
        self.fetch(id).await
    }

    async fn fetch(&self, id: Uuid) -> Result<Task, TaskError> {
        self.db
            .get_task(id)
            .await?
            .ok_or(TaskError::NotFound { id })
    }

    /// All tasks, most recently updated first.
    pub async fn list(&self) -> Result<Vec<Task>, TaskError> {
        Ok(self.db.list_tasks().await?)
    }

    /// Re-attach to a task already IN_PROGRESS.
    pub async fn lease_by_id(&self, id: Uuid) -> Result<Task, TaskError> {
        let task = self.fetch(id).await?;
        match task.status {
            TaskStatus::InProgress => Ok(task),
            status if status.is_terminal() => Err(TaskError::AlreadyTerminal { id, status }),
            status => Err(TaskError::NotInProgress { id, status }),
        }
    }

    /// Finalize an IN_PROGRESS task as COMPLETED, then run completion hooks.
    pub async fn complete(&self, id: Uuid, result: Value) -> Result<Task, TaskError> {
        let applied = self
            .db
            .finalize_task(id, TaskStatus::Completed, Some(&result), None, Utc::now())
            .await?;
        if !applied {
            return Err(self.rejection(id).await);
        }

        let task = self.fetch(id).await?;
        info!(task_id = %id, task_type = %task.task_type, "Task completed");

        if let Err(e) = self.hooks.on_completed(&task).await {
            warn!(task_id = %id, error = %e, "Completion side effects failed");
        }

        self.publish(TaskEvent::TaskUpdated { task: task.clone() });
        Ok(task)
    }

    /// Finalize an IN_PROGRESS task as FAILED.
    pub async fn fail(
        &self,
        id: Uuid,
        error: &str,
        result: Option<Value>,
    ) -> Result<Task, TaskError> {
        let error = error.trim();
        if error.is_empty() {
            return Err(TaskError::InvalidRequest("error is required".into()));
        }

        let applied = self
            .db
            .finalize_task(id, TaskStatus::Failed, result.as_ref(), Some(error), Utc::now())
            .await?;
        if !applied {
            return Err(self.rejection(id).await);
        }

        let task = self.fetch(id).await?;
        info!(task_id = %id, task_type = %task.task_type, error = error, "Task failed");
        self.publish(TaskEvent::TaskUpdated { task: task.clone() });
        Ok(task)
    }

    /// Explain why a finalize did not apply.
    async fn rejection(&self, id: Uuid) -> TaskError {
        match self.db.get_task(id).await {
            Ok(None) => TaskError::NotFound { id },
            Ok(Some(task)) if task.status.is_terminal() => {
                warn!(task_id = %id, status = %task.status, "Rejected second finalize");
                TaskError::AlreadyTerminal {
                    id,
                    status: task.status,
                }
            }
            Ok(Some(task)) => TaskError::NotInProgress {
                id,
                status: task.status,
            },
            Err(e) => e.into(),
        }
    }

    /// Delete a task in any status.
    pub async fn delete(&self, id: Uuid) -> Result<(), TaskError> {
        if !self.db.delete_task(id).await? {
            return Err(TaskError::NotFound { id });
        }
        info!(task_id = %id, "Task deleted");
        self.publish(TaskEvent::TaskDeleted { id });
        Ok(())
    }
}
