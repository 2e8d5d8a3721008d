//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::anycards::model::{Anycard, AnycardType};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::Database;
use crate::tasks::model::{Task, TaskStatus, TaskType};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_tasks(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => tasks.push(row_to_task(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(tasks)
    }

    async fn query_anycards(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<Anycard>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut cards = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => cards.push(row_to_anycard(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(cards)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed-width microseconds keep text ordering chronological.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn to_json(value: &Value) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn row_err(op: &str, e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("{op} row parse: {e}"))
}

const TASK_COLUMNS: &str =
    "id, type, status, data_json, result_json, last_error, created_at, updated_at";

const ANYCARD_COLUMNS: &str = "id, card_number, serial_number, pin, anycard_type, balance, needs_redeem, created_at, updated_at";

/// Map a libsql Row to a Task. Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str: String = row.get(0).map_err(|e| row_err("task", e))?;
    let type_str: String = row.get(1).map_err(|e| row_err("task", e))?;
    let status_str: String = row.get(2).map_err(|e| row_err("task", e))?;
    let data_str: String = row.get(3).map_err(|e| row_err("task", e))?;
    let result_str: Option<String> = row.get(4).map_err(|e| row_err("task", e))?;
    let last_error: Option<String> = row.get(5).map_err(|e| row_err("task", e))?;
    let created_str: String = row.get(6).map_err(|e| row_err("task", e))?;
    let updated_str: String = row.get(7).map_err(|e| row_err("task", e))?;

    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("task id {id_str}: {e}")))?;
    let task_type: TaskType = type_str
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("task {id} type: {e}")))?;
    let status = TaskStatus::parse(&status_str).ok_or_else(|| {
        DatabaseError::Serialization(format!("task {id} status: {status_str}"))
    })?;
    let data: Value = serde_json::from_str(&data_str)
        .map_err(|e| DatabaseError::Serialization(format!("task {id} data: {e}")))?;
    let result = result_str
        .map(|s| serde_json::from_str::<Value>(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("task {id} result: {e}")))?;

    Ok(Task {
        id,
        task_type,
        status,
        data,
        result,
        last_error,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to an Anycard. Column order matches ANYCARD_COLUMNS.
fn row_to_anycard(row: &libsql::Row) -> Result<Anycard, DatabaseError> {
    let id_str: String = row.get(0).map_err(|e| row_err("anycard", e))?;
    let card_number: String = row.get(1).map_err(|e| row_err("anycard", e))?;
    let serial_number: Option<String> = row.get(2).map_err(|e| row_err("anycard", e))?;
    let pin: Option<String> = row.get(3).map_err(|e| row_err("anycard", e))?;
    let type_str: String = row.get(4).map_err(|e| row_err("anycard", e))?;
    let balance: Option<String> = row.get(5).map_err(|e| row_err("anycard", e))?;
    let needs_redeem: i64 = row.get(6).map_err(|e| row_err("anycard", e))?;
    let created_str: String = row.get(7).map_err(|e| row_err("anycard", e))?;
    let updated_str: String = row.get(8).map_err(|e| row_err("anycard", e))?;

    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("anycard id {id_str}: {e}")))?;
    let anycard_type: AnycardType = type_str
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("anycard {id} type: {e}")))?;

    Ok(Anycard {
        id,
        card_number,
        serial_number,
        pin,
        anycard_type,
        balance,
        needs_redeem: needs_redeem != 0,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let result_json = task.result.as_ref().map(to_json).transpose()?;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO automation_tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    task.id.to_string(),
                    task.task_type.code(),
                    task.status.as_str(),
                    to_json(&task.data)?,
                    opt_text(result_json.as_deref()),
                    opt_text(task.last_error.as_deref()),
                    ts(&task.created_at),
                    ts(&task.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;

        debug!(task_id = %task.id, task_type = %task.task_type, "Task inserted into DB");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut tasks = self
            .query_tasks(
                &format!("SELECT {TASK_COLUMNS} FROM automation_tasks WHERE id = ?1"),
                params![id.to_string()],
                "get_task",
            )
            .await?;
        Ok(tasks.pop())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM automation_tasks ORDER BY updated_at DESC, rowid DESC"
            ),
            (),
            "list_tasks",
        )
        .await
    }

    async fn list_tasks_by_type(&self, task_type: TaskType) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM automation_tasks WHERE type = ?1 ORDER BY created_at ASC, rowid ASC"
            ),
            params![task_type.code()],
            "list_tasks_by_type",
        )
        .await
    }

    async fn oldest_ready_task(&self, task_type: TaskType) -> Result<Option<Task>, DatabaseError> {
        let mut tasks = self
            .query_tasks(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM automation_tasks WHERE type = ?1 AND status = 'READY' ORDER BY created_at ASC, rowid ASC LIMIT 1"
                ),
                params![task_type.code()],
                "oldest_ready_task",
            )
            .await?;
        Ok(tasks.pop())
    }

    async fn has_in_progress(&self, task_type: TaskType) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM automation_tasks WHERE type = ?1 AND status = 'IN_PROGRESS'",
                params![task_type.code()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("has_in_progress: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).map_err(|e| row_err("has_in_progress", e))?;
                Ok(count > 0)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("has_in_progress: {e}"))),
        }
    }

    async fn claim_task(
        &self,
        id: Uuid,
        task_type: TaskType,
        single_flight: bool,
        data: &Value,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE automation_tasks
                 SET status = 'IN_PROGRESS', data_json = ?1, last_error = NULL, updated_at = ?2
                 WHERE id = ?3 AND status = 'READY'
                   AND (?4 = 0 OR NOT EXISTS (
                       SELECT 1 FROM automation_tasks WHERE type = ?5 AND status = 'IN_PROGRESS'
                   ))",
                params![
                    to_json(data)?,
                    ts(&at),
                    id.to_string(),
                    i64::from(single_flight),
                    task_type.code(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_task: {e}")))?;
        Ok(affected == 1)
    }

    async fn finalize_task(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: Option<&Value>,
        last_error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        if !status.is_terminal() {
            return Err(DatabaseError::Query(format!(
                "finalize_task: {status} is not terminal"
            )));
        }
        let result_json = result.map(to_json).transpose()?;
        let affected = self
            .conn()
            .execute(
                "UPDATE automation_tasks
                 SET status = ?1, result_json = ?2, last_error = ?3, updated_at = ?4
                 WHERE id = ?5 AND status = 'IN_PROGRESS'",
                params![
                    status.as_str(),
                    opt_text(result_json.as_deref()),
                    opt_text(last_error),
                    ts(&at),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finalize_task: {e}")))?;
        Ok(affected == 1)
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "DELETE FROM automation_tasks WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_task: {e}")))?;
        Ok(affected > 0)
    }

    // ── Anycards ────────────────────────────────────────────────────

    async fn insert_anycard(&self, card: &Anycard) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO anycards ({ANYCARD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    card.id.to_string(),
                    card.card_number.clone(),
                    opt_text(card.serial_number.as_deref()),
                    opt_text(card.pin.as_deref()),
                    card.anycard_type.code(),
                    opt_text(card.balance.as_deref()),
                    i64::from(card.needs_redeem),
                    ts(&card.created_at),
                    ts(&card.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_anycard: {e}")))?;
        debug!(anycard_id = %card.id, "Anycard inserted into DB");
        Ok(())
    }

    async fn get_anycard(&self, id: Uuid) -> Result<Option<Anycard>, DatabaseError> {
        let mut cards = self
            .query_anycards(
                &format!("SELECT {ANYCARD_COLUMNS} FROM anycards WHERE id = ?1"),
                params![id.to_string()],
                "get_anycard",
            )
            .await?;
        Ok(cards.pop())
    }

    async fn list_anycards(&self) -> Result<Vec<Anycard>, DatabaseError> {
        self.query_anycards(
            &format!("SELECT {ANYCARD_COLUMNS} FROM anycards ORDER BY created_at ASC, rowid ASC"),
            (),
            "list_anycards",
        )
        .await
    }

    async fn find_anycard_by_number(
        &self,
        anycard_type: AnycardType,
        card_number: &str,
    ) -> Result<Option<Anycard>, DatabaseError> {
        let mut cards = self
            .query_anycards(
                &format!(
                    "SELECT {ANYCARD_COLUMNS} FROM anycards WHERE anycard_type = ?1 AND card_number = ?2 ORDER BY created_at ASC LIMIT 1"
                ),
                params![anycard_type.code(), card_number.trim()],
                "find_anycard_by_number",
            )
            .await?;
        Ok(cards.pop())
    }

    async fn find_anycard_by_any_number(
        &self,
        card_number: &str,
    ) -> Result<Option<Anycard>, DatabaseError> {
        let mut cards = self
            .query_anycards(
                &format!(
                    "SELECT {ANYCARD_COLUMNS} FROM anycards WHERE card_number = ?1 ORDER BY created_at ASC LIMIT 1"
                ),
                params![card_number.trim()],
                "find_anycard_by_any_number",
            )
            .await?;
        Ok(cards.pop())
    }

    async fn find_anycard_by_serial(&self, serial: &str) -> Result<Option<Anycard>, DatabaseError> {
        let mut cards = self
            .query_anycards(
                &format!(
                    "SELECT {ANYCARD_COLUMNS} FROM anycards WHERE serial_number = ?1 ORDER BY created_at ASC LIMIT 1"
                ),
                params![serial.trim()],
                "find_anycard_by_serial",
            )
            .await?;
        Ok(cards.pop())
    }

    async fn update_anycard(&self, card: &Anycard) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE anycards
                 SET card_number = ?1, serial_number = ?2, pin = ?3, anycard_type = ?4,
                     balance = ?5, needs_redeem = ?6, updated_at = ?7
                 WHERE id = ?8",
                params![
                    card.card_number.clone(),
                    opt_text(card.serial_number.as_deref()),
                    opt_text(card.pin.as_deref()),
                    card.anycard_type.code(),
                    opt_text(card.balance.as_deref()),
                    i64::from(card.needs_redeem),
                    ts(&card.updated_at),
                    card.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_anycard: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "anycard".into(),
                id: card.id.to_string(),
            });
        }
        Ok(())
    }
}
