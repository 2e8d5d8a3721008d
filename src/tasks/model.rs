//! Task data model: the durable unit of automation work.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::TaskError;

/// The workflow a task runs. Each kind has a hand-written step library on the agent side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TaskType {
    /// Claim a bonus anycard on the bonus site and harvest its code + PIN.
    GetmybonusAnycard,
    /// Load a funded anycard into the swap wallet and verify the balance moved.
    AnycardLoad,
}

impl TaskType {
    pub const ALL: [TaskType; 2] = [TaskType::GetmybonusAnycard, TaskType::AnycardLoad];

    /// Wire code, as stored and as carried in surface addresses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::GetmybonusAnycard => "getmybonus_anycard",
            Self::AnycardLoad => "anycard_load",
        }
    }

    fn upper_name(&self) -> &'static str {
        match self {
            Self::GetmybonusAnycard => "GETMYBONUS_ANYCARD",
            Self::AnycardLoad => "ANYCARD_LOAD",
        }
    }

    /// Whether at most one task of this type may be IN_PROGRESS at a time.
    pub fn is_single_flight(&self) -> bool {
        match self {
            Self::GetmybonusAnycard | Self::AnycardLoad => true,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for TaskType {
    type Err = TaskError;

    /// Accepts either the wire code (any case) or the upper-case name.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if normalized.is_empty() {
            return Err(TaskError::InvalidRequest("Task type is required".into()));
        }
        let upper = normalized.to_ascii_uppercase();
        TaskType::ALL
            .into_iter()
            .find(|t| t.upper_name() == upper || t.code().eq_ignore_ascii_case(normalized))
            .ok_or_else(|| TaskError::UnknownType(value.to_string()))
    }
}

impl TryFrom<String> for TaskType {
    type Error = TaskError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskType> for String {
    fn from(t: TaskType) -> Self {
        t.code().to_string()
    }
}

/// Lifecycle status. `READY → IN_PROGRESS → {COMPLETED | FAILED}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Ready,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "READY" => Some(Self::Ready),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of automation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Workflow inputs, supplied at creation.
    pub data: Value,
    /// Written once, at finalization.
    pub result: Option<Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A fresh READY task.
    pub fn new(task_type: TaskType, data: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type,
            status: TaskStatus::Ready,
            data: if data.is_null() {
                Value::Object(Default::default())
            } else {
                data
            },
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// First non-blank value among `keys` in `data`.
    pub fn data_text(&self, keys: &[&str]) -> Option<String> {
        first_text(&self.data, keys)
    }
}

/// First non-blank scalar among `keys`, rendered as text. Numbers are accepted
/// because producers are loose about `"10"` vs `10`.
pub fn first_text(value: &Value, keys: &[&str]) -> Option<String> {
    let obj = value.as_object()?;
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

/// Body of `POST /api/tasks`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub data: Value,
}

/// Body of `POST /api/tasks/{id}/complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteTaskRequest {
    pub result: Value,
}

/// Body of `POST /api/tasks/{id}/fail`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailTaskRequest {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Messages pushed to `/ws/tasks` subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Full listing, sent on connect and after a lagged receiver.
    TasksSync { tasks: Vec<Task> },
    TaskCreated { task: Task },
    TaskUpdated { task: Task },
    TaskDeleted { id: Uuid },
}
