//! The coordinator as seen from an agent.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::anycards::model::{Anycard, AnycardInput};
use crate::config::AuthConfig;
use crate::error::{BridgeError, DatabaseError, TaskError};
use crate::store::Database;
use crate::tasks::model::{CompleteTaskRequest, FailTaskRequest, Task, TaskStatus, TaskType};
use crate::tasks::queue::DispatchQueue;

#[async_trait]
pub trait BridgeClient: Send + Sync {
    /// Lease the next task of a type. `None` when nothing can be leased now.
    async fn next_task(&self, task_type: TaskType) -> Result<Option<Task>, BridgeError>;

    /// Re-attach to an IN_PROGRESS task.
    async fn lease_task(&self, id: Uuid) -> Result<Task, BridgeError>;

    async fn complete_task(&self, id: Uuid, result: Value) -> Result<Task, BridgeError>;

    async fn fail_task(&self, id: Uuid, error: &str) -> Result<Task, BridgeError>;

    async fn get_anycard(&self, id: Uuid) -> Result<Option<Anycard>, BridgeError>;

    async fn update_anycard(&self, id: Uuid, input: AnycardInput) -> Result<Anycard, BridgeError>;
}

/// Talks to the bridge server over HTTP with Basic auth.
pub struct HttpBridgeClient {
    client: reqwest::Client,
    base_url: String,
    auth: AuthConfig,
}

impl HttpBridgeClient {
    pub fn new(base_url: impl Into<String>, auth: AuthConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.basic_auth(&self.auth.username, Some(self.auth.password.expose_secret()))
    }

    /// Map non-success responses. 404 and 409 carry meaning for the executor.
    async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response, BridgeError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => BridgeError::NotFound(what.to_string()),
            StatusCode::CONFLICT => BridgeError::AlreadyTerminal(what.to_string()),
            _ => BridgeError::Status {
                status: status.as_u16(),
                body,
            },
        })
    }

    async fn get_task(&self, id: Uuid) -> Result<Task, BridgeError> {
        let resp = self
            .authed(self.client.get(self.url(&format!("/api/tasks/{id}"))))
            .send()
            .await?;
        Ok(Self::check(resp, &id.to_string()).await?.json().await?)
    }
}

#[async_trait]
impl BridgeClient for HttpBridgeClient {
    async fn next_task(&self, task_type: TaskType) -> Result<Option<Task>, BridgeError> {
        let resp = self
            .authed(self.client.get(self.url("/api/tasks/next")))
            .query(&[("type", task_type.code())])
            .send()
            .await?;
        if resp.status() == StatusCode::NO_CONTENT {
            debug!(task_type = %task_type, "No task available");
            return Ok(None);
        }
        Ok(Some(Self::check(resp, task_type.code()).await?.json().await?))
    }

    async fn lease_task(&self, id: Uuid) -> Result<Task, BridgeError> {
        let task = self.get_task(id).await?;
        match task.status {
            TaskStatus::InProgress => Ok(task),
            s if s.is_terminal() => Err(BridgeError::AlreadyTerminal(id.to_string())),
            _ => Err(BridgeError::NotInProgress(id.to_string())),
        }
    }

    async fn complete_task(&self, id: Uuid, result: Value) -> Result<Task, BridgeError> {
        let resp = self
            .authed(self.client.post(self.url(&format!("/api/tasks/{id}/complete"))))
            .json(&CompleteTaskRequest { result })
            .send()
            .await?;
        Ok(Self::check(resp, &id.to_string()).await?.json().await?)
    }

    async fn fail_task(&self, id: Uuid, error: &str) -> Result<Task, BridgeError> {
        let resp = self
            .authed(self.client.post(self.url(&format!("/api/tasks/{id}/fail"))))
            .json(&FailTaskRequest {
                error: error.to_string(),
                result: None,
            })
            .send()
            .await?;
        Ok(Self::check(resp, &id.to_string()).await?.json().await?)
    }

    async fn get_anycard(&self, id: Uuid) -> Result<Option<Anycard>, BridgeError> {
        let resp = self
            .authed(self.client.get(self.url(&format!("/api/anycards/{id}"))))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::check(resp, &id.to_string()).await?.json().await?))
    }

    async fn update_anycard(&self, id: Uuid, input: AnycardInput) -> Result<Anycard, BridgeError> {
        let resp = self
            .authed(self.client.put(self.url(&format!("/api/anycards/{id}"))))
            .json(&input)
            .send()
            .await?;
        Ok(Self::check(resp, &id.to_string()).await?.json().await?)
    }
}

/// In-process bridge over a [`DispatchQueue`].
pub struct LocalBridge {
    queue: Arc<DispatchQueue>,
}

impl LocalBridge {
    pub fn new(queue: Arc<DispatchQueue>) -> Self {
        Self { queue }
    }

    fn db(&self) -> &Arc<dyn Database> {
        self.queue.db()
    }
}

impl From<TaskError> for BridgeError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::NotFound { id } => BridgeError::NotFound(id.to_string()),
            TaskError::Database(DatabaseError::NotFound { id, .. }) => BridgeError::NotFound(id),
            TaskError::AlreadyTerminal { id, .. } => BridgeError::AlreadyTerminal(id.to_string()),
            TaskError::NotInProgress { id, .. } => BridgeError::NotInProgress(id.to_string()),
            other => BridgeError::Status {
                status: 500,
                body: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl BridgeClient for LocalBridge {
    async fn next_task(&self, task_type: TaskType) -> Result<Option<Task>, BridgeError> {
        Ok(self.queue.next(task_type).await?)
    }

    async fn lease_task(&self, id: Uuid) -> Result<Task, BridgeError> {
        Ok(self.queue.lease_by_id(id).await?)
    }

    async fn complete_task(&self, id: Uuid, result: Value) -> Result<Task, BridgeError> {
        Ok(self.queue.complete(id, result).await?)
    }

    async fn fail_task(&self, id: Uuid, error: &str) -> Result<Task, BridgeError> {
        Ok(self.queue.fail(id, error, None).await?)
    }

    async fn get_anycard(&self, id: Uuid) -> Result<Option<Anycard>, BridgeError> {
        self.db()
            .get_anycard(id)
            .await
            .map_err(|e| TaskError::from(e).into())
    }

    async fn update_anycard(&self, id: Uuid, input: AnycardInput) -> Result<Anycard, BridgeError> {
        let Some(mut card) = self.get_anycard(id).await? else {
            return Err(BridgeError::NotFound(id.to_string()));
        };
        card.apply(input);
        self.db()
            .update_anycard(&card)
            .await
            .map_err(TaskError::from)?;
        Ok(card)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anycards::model::AnycardType;
    use crate::store::LibSqlBackend;
    use serde_json::json;

    async fn bridge() -> (Arc<DispatchQueue>, LocalBridge) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = DispatchQueue::new(db);
        (queue.clone(), LocalBridge::new(queue))
    }

    #[tokio::test]
    async fn local_bridge_maps_lifecycle_errors() {
        let (queue, bridge) = bridge().await;
        let task = queue
            .enqueue(TaskType::AnycardLoad, json!({"anycardId": "x"}))
            .await
            .unwrap();

        assert!(matches!(
            bridge.lease_task(task.id).await,
            Err(BridgeError::NotInProgress(_))
        ));
        let leased = bridge.next_task(TaskType::AnycardLoad).await.unwrap().unwrap();
        assert_eq!(bridge.lease_task(leased.id).await.unwrap().id, task.id);

        bridge.complete_task(task.id, json!({"ok": true})).await.unwrap();
        assert!(matches!(
            bridge.complete_task(task.id, json!({})).await,
            Err(BridgeError::AlreadyTerminal(_))
        ));
        assert!(matches!(
            bridge.lease_task(task.id).await,
            Err(BridgeError::AlreadyTerminal(_))
        ));
        assert!(matches!(
            bridge.lease_task(Uuid::new_v4()).await,
            Err(BridgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn local_bridge_updates_anycards() {
        let (queue, bridge) = bridge().await;
        let card = Anycard::new("6001", AnycardType::Celebrate).with_balance("25");
        queue.db().insert_anycard(&card).await.unwrap();

        let mut input = card.to_input();
        input.balance = Some("0".into());
        let updated = bridge.update_anycard(card.id, input.clone()).await.unwrap();
        assert_eq!(updated.balance.as_deref(), Some("0"));
        assert!(bridge.get_anycard(Uuid::new_v4()).await.unwrap().is_none());
        assert!(matches!(
            bridge.update_anycard(Uuid::new_v4(), input).await,
            Err(BridgeError::NotFound(_))
        ));
    }
}
