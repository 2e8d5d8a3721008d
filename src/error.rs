//! Error types for the gift-card bridge.

use std::time::Duration;

use uuid::Uuid;

use crate::tasks::model::TaskStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task lifecycle errors raised at the store / queue boundary.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task not found: {id}")]
    NotFound { id: Uuid },

    #[error("Task {id} is already {status}")]
    AlreadyTerminal { id: Uuid, status: TaskStatus },

    #[error("Task {id} is {status}, expected IN_PROGRESS")]
    NotInProgress { id: Uuid, status: TaskStatus },

    #[error("Unknown task type: {0}")]
    UnknownType(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Agent-side workflow errors. Every one of these ends in `fail(id, reason)`.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Timeout waiting for {what} after {after:?}")]
    StepTimeout { what: String, after: Duration },

    #[error("task.data.{0} missing")]
    MissingField(String),

    #[error("{what} mismatch: page={page} task={task}")]
    Mismatch {
        what: String,
        page: String,
        task: String,
    },

    #[error("Unsupported task type: {0}")]
    Unsupported(String),

    #[error("{0}")]
    NoApplicableStep(String),

    #[error("{0}")]
    Extraction(String),

    #[error("Surface error: {0}")]
    Surface(String),

    #[error("Resumption store error: {0}")]
    Resume(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Errors talking to the coordinator from an agent.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Bridge returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task already finalized: {0}")]
    AlreadyTerminal(String),

    #[error("Task not in progress: {0}")]
    NotInProgress(String),

    #[error("Invalid response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            BridgeError::Decode(e.to_string())
        } else {
            BridgeError::Http(e.to_string())
        }
    }
}

/// Result type alias for the bridge.
pub type Result<T> = std::result::Result<T, Error>;
