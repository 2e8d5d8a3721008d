//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::anycards::model::{Anycard, AnycardType};
use crate::error::DatabaseError;
use crate::tasks::model::{Task, TaskStatus, TaskType};

/// Backend-agnostic database trait covering tasks and anycards.
///
/// Every state transition on a task is a compare-and-set on its current status, so
/// callers learn whether *their* write won rather than reading and writing separately.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task.
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// All tasks, most recently updated first.
    async fn list_tasks(&self) -> Result<Vec<Task>, DatabaseError>;

    /// All tasks of one type, oldest first.
    async fn list_tasks_by_type(&self, task_type: TaskType) -> Result<Vec<Task>, DatabaseError>;

    /// The oldest READY task of a type, if any.
    async fn oldest_ready_task(&self, task_type: TaskType) -> Result<Option<Task>, DatabaseError>;

    /// Whether any task of the type is IN_PROGRESS.
    async fn has_in_progress(&self, task_type: TaskType) -> Result<bool, DatabaseError>;

    /// Move a READY task to IN_PROGRESS, replacing its data and clearing `last_error`.
    ///
    /// With `single_flight`, the claim is refused while another task of the same
    /// type is IN_PROGRESS. Returns `false` when the claim did not apply.
    async fn claim_task(
        &self,
        id: Uuid,
        task_type: TaskType,
        single_flight: bool,
        data: &Value,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Move an IN_PROGRESS task to a terminal status.
    ///
    /// Returns `false` when the task is missing or no longer IN_PROGRESS.
    async fn finalize_task(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: Option<&Value>,
        last_error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Delete a task in any status. Returns whether a row was removed.
    async fn delete_task(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Anycards ────────────────────────────────────────────────────

    /// Insert a new anycard.
    async fn insert_anycard(&self, card: &Anycard) -> Result<(), DatabaseError>;

    /// Get an anycard by ID.
    async fn get_anycard(&self, id: Uuid) -> Result<Option<Anycard>, DatabaseError>;

    /// All anycards, oldest first.
    async fn list_anycards(&self) -> Result<Vec<Anycard>, DatabaseError>;

    /// Look up by product line and card number.
    async fn find_anycard_by_number(
        &self,
        anycard_type: AnycardType,
        card_number: &str,
    ) -> Result<Option<Anycard>, DatabaseError>;

    /// Look up by card number regardless of product line.
    async fn find_anycard_by_any_number(
        &self,
        card_number: &str,
    ) -> Result<Option<Anycard>, DatabaseError>;

    /// Look up by serial number.
    async fn find_anycard_by_serial(&self, serial: &str) -> Result<Option<Anycard>, DatabaseError>;

    /// Overwrite every mutable field of an existing anycard.
    async fn update_anycard(&self, card: &Anycard) -> Result<(), DatabaseError>;
}
