//! Resumption state: what an agent must remember across a page reload.
//!
//! The state is a local hint, never authoritative. The executor re-validates it
//! against the task store on every cycle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::tasks::model::{Task, TaskType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumptionState {
    pub task_id: Uuid,
    pub task_type: TaskType,
    /// Set immediately before the side-effecting action is triggered.
    pub submitted: bool,
    /// Signal change the side effect should produce.
    #[serde(default)]
    pub expected_delta: Option<Decimal>,
    /// Signal value captured before the side effect.
    #[serde(default)]
    pub baseline: Option<Decimal>,
    pub picked_at: DateTime<Utc>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

impl ResumptionState {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type,
            submitted: false,
            expected_delta: None,
            baseline: None,
            picked_at: Utc::now(),
            submitted_at: None,
        }
    }

    pub fn belongs_to(&self, task: &Task) -> bool {
        self.task_id == task.id && self.task_type == task.task_type
    }

    pub fn mark_submitted(&mut self) {
        self.submitted = true;
        self.submitted_at = Some(Utc::now());
    }
}

/// Durable storage for resumption state, one slot per scope (one surface origin).
#[async_trait]
pub trait ResumptionStore: Send + Sync {
    async fn load(&self, scope: &str) -> Result<Option<ResumptionState>, WorkflowError>;
    async fn save(&self, scope: &str, state: &ResumptionState) -> Result<(), WorkflowError>;
    async fn clear(&self, scope: &str) -> Result<(), WorkflowError>;
}

/// One JSON file per scope under a directory.
pub struct FileResumptionStore {
    dir: PathBuf,
}

impl FileResumptionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, scope: &str) -> PathBuf {
        let name: String = scope
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

fn io_err(path: &Path, e: std::io::Error) -> WorkflowError {
    WorkflowError::Resume(format!("{}: {e}", path.display()))
}

#[async_trait]
impl ResumptionStore for FileResumptionStore {
    async fn load(&self, scope: &str) -> Result<Option<ResumptionState>, WorkflowError> {
        let path = self.path_for(scope);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path, e)),
        };
        match serde_json::from_slice(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                // Unreadable state is as good as none; the store re-validates anyway.
                warn!(path = %path.display(), error = %e, "Discarding corrupt resumption state");
                Ok(None)
            }
        }
    }

    async fn save(&self, scope: &str, state: &ResumptionState) -> Result<(), WorkflowError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_err(&self.dir, e))?;
        let path = self.path_for(scope);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(state)
            .map_err(|e| WorkflowError::Resume(e.to_string()))?;
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| io_err(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_err(&path, e))?;
        debug!(scope = scope, task_id = %state.task_id, submitted = state.submitted, "Resumption state saved");
        Ok(())
    }

    async fn clear(&self, scope: &str) -> Result<(), WorkflowError> {
        let path = self.path_for(scope);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path, e)),
        }
    }
}

/// In-memory store, for tests and single-process embedding.
#[derive(Default)]
pub struct MemoryResumptionStore {
    slots: Mutex<HashMap<String, ResumptionState>>,
}

impl MemoryResumptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResumptionStore for MemoryResumptionStore {
    async fn load(&self, scope: &str) -> Result<Option<ResumptionState>, WorkflowError> {
        Ok(self.slots.lock().await.get(scope).cloned())
    }

    async fn save(&self, scope: &str, state: &ResumptionState) -> Result<(), WorkflowError> {
        self.slots
            .lock()
            .await
            .insert(scope.to_string(), state.clone());
        Ok(())
    }

    async fn clear(&self, scope: &str) -> Result<(), WorkflowError> {
        self.slots.lock().await.remove(scope);
        Ok(())
    }
}
