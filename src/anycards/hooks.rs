//! Anycard bookkeeping around the task lifecycle.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{debug, info};
use uuid::Uuid;

use super::model::{Anycard, AnycardType};
use crate::error::DatabaseError;
use crate::store::Database;
use crate::tasks::hooks::TaskHooks;
use crate::tasks::model::{Task, TaskStatus, TaskType, first_text};

const CARD_NUMBER_KEYS: &[&str] = &["cardNumber", "card_number"];
const SERIAL_KEYS: &[&str] = &["serialNumber", "serial_number"];

/// Keeps anycards and their tasks in step.
pub struct AnycardTaskHooks {
    db: Arc<dyn Database>,
}

impl AnycardTaskHooks {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    async fn find_by_id_text(&self, id: Option<&str>) -> Result<Option<Anycard>, DatabaseError> {
        match id.and_then(|s| Uuid::parse_str(s.trim()).ok()) {
            Some(id) => self.db.get_anycard(id).await,
            None => Ok(None),
        }
    }

    /// Anycards flagged `needsRedeem` whose card number has no live task and was
    /// not itself harvested by a completed one. A completed redeem of a card does
    /// not cover it, so re-flagging the card queues it again.
    async fn missing_redeem_tasks(&self, existing: &[Task]) -> Result<Vec<Value>, DatabaseError> {
        let cards: Vec<Anycard> = self
            .db
            .list_anycards()
            .await?
            .into_iter()
            .filter(Anycard::is_redeemable)
            .collect();
        if cards.is_empty() {
            return Ok(Vec::new());
        }

        let mut covered = HashSet::new();
        for task in existing {
            match task.status {
                TaskStatus::Completed => {
                    if let Some(n) = task.result.as_ref().and_then(|r| first_text(r, CARD_NUMBER_KEYS)) {
                        covered.insert(n);
                    }
                }
                TaskStatus::Ready | TaskStatus::InProgress => {
                    if let Some(n) = task.data_text(CARD_NUMBER_KEYS) {
                        covered.insert(n);
                    }
                }
                TaskStatus::Failed => {}
            }
        }

        Ok(cards
            .into_iter()
            .filter(|c| !covered.contains(&c.card_number))
            .map(|c| {
                let mut data = Map::new();
                data.insert("anycardId".into(), json!(c.id));
                data.insert("cardNumber".into(), json!(c.card_number));
                if let Some(serial) = c.serial_number.as_deref().filter(|s| !s.trim().is_empty()) {
                    data.insert("serialNumber".into(), json!(serial));
                }
                data.insert("anycardType".into(), json!(c.anycard_type.code()));
                Value::Object(data)
            })
            .collect())
    }

    /// Funded anycards with a PIN that have no READY or IN_PROGRESS load task, richest first.
    async fn missing_load_tasks(&self, existing: &[Task]) -> Result<Vec<Value>, DatabaseError> {
        let live: HashSet<String> = existing
            .iter()
            .filter(|t| !t.status.is_terminal())
            .filter_map(|t| t.data_text(&["anycardId"]))
            .collect();

        let mut cards: Vec<Anycard> = self
            .db
            .list_anycards()
            .await?
            .into_iter()
            .filter(Anycard::is_loadable)
            .filter(|c| !live.contains(&c.id.to_string()))
            .collect();
        cards.sort_by(|a, b| b.parsed_balance().cmp(&a.parsed_balance()));

        Ok(cards
            .into_iter()
            .map(|c| {
                json!({
                    "anycardId": c.id,
                    "cardNumber": c.card_number,
                    "anycardType": c.anycard_type.code(),
                    "balance": c.balance,
                })
            })
            .collect())
    }

    /// Save the harvested bonus card, then clear `needsRedeem` on the card it came from.
    async fn record_redeemed(&self, task: &Task) -> Result<(), DatabaseError> {
        let result = task.result.as_ref().ok_or_else(|| invalid("missing task result"))?;

        let card_number =
            first_text(result, &["card_number"]).ok_or_else(|| invalid("missing card_number"))?;
        let card_type: AnycardType = first_text(result, &["card_type"])
            .ok_or_else(|| invalid("missing card_type"))?
            .parse()
            .map_err(|e| invalid(&format!("{e}")))?;
        let pin = first_text(result, &["PIN", "pin"]);
        let balance = first_text(result, &["balance"]);

        match self.db.find_anycard_by_number(card_type, &card_number).await? {
            Some(mut existing) => {
                existing.pin = pin;
                existing.balance = balance;
                existing.updated_at = Utc::now();
                self.db.update_anycard(&existing).await?;
                info!(anycard_id = %existing.id, "Harvested anycard updated");
            }
            None => {
                let mut card = Anycard::new(card_number, card_type);
                card.pin = pin;
                card.balance = balance;
                self.db.insert_anycard(&card).await?;
                info!(anycard_id = %card.id, "Harvested anycard stored");
            }
        }

        let anycard_id = task.data_text(&["anycardId"]);
        let serial = first_text(result, &["serial_number", "serialNumber"])
            .or_else(|| task.data_text(SERIAL_KEYS));

        let mut source = self.find_by_id_text(anycard_id.as_deref()).await?;
        if source.is_none() {
            if let Some(serial) = serial.as_deref() {
                source = self.db.find_anycard_by_serial(serial).await?;
            }
        }

        match source {
            Some(mut card) => {
                card.needs_redeem = false;
                card.updated_at = Utc::now();
                self.db.update_anycard(&card).await?;
                info!(anycard_id = %card.id, task_id = %task.id, "Anycard redeemed");
                Ok(())
            }
            None if anycard_id.is_some() || serial.is_some() => Err(DatabaseError::NotFound {
                entity: "anycard".into(),
                id: anycard_id.or(serial).unwrap_or_default(),
            }),
            None => Ok(()),
        }
    }

    /// The wallet now holds the card's value; the card itself is spent.
    async fn record_loaded(&self, task: &Task) -> Result<(), DatabaseError> {
        let id = task.data_text(&["anycardId"]);
        let mut card = match self.find_by_id_text(id.as_deref()).await? {
            Some(card) => card,
            None => match task.data_text(CARD_NUMBER_KEYS) {
                Some(n) => self
                    .db
                    .find_anycard_by_any_number(&n)
                    .await?
                    .ok_or_else(|| DatabaseError::NotFound {
                        entity: "anycard".into(),
                        id: n,
                    })?,
                None => return Ok(()),
            },
        };
        card.balance = Some("0".into());
        card.updated_at = Utc::now();
        self.db.update_anycard(&card).await?;
        info!(anycard_id = %card.id, task_id = %task.id, "Anycard balance zeroed after load");
        Ok(())
    }
}

fn invalid(message: &str) -> DatabaseError {
    DatabaseError::Serialization(format!("task result: {message}"))
}

#[async_trait]
impl TaskHooks for AnycardTaskHooks {
    async fn missing_tasks(
        &self,
        task_type: TaskType,
        existing: &[Task],
    ) -> Result<Vec<Value>, DatabaseError> {
        let missing = match task_type {
            TaskType::GetmybonusAnycard => self.missing_redeem_tasks(existing).await?,
            TaskType::AnycardLoad => self.missing_load_tasks(existing).await?,
        };
        if !missing.is_empty() {
            debug!(task_type = %task_type, count = missing.len(), "Seeding tasks for eligible anycards");
        }
        Ok(missing)
    }

    async fn enrich(&self, task: &Task) -> Result<Option<Value>, DatabaseError> {
        if task.task_type != TaskType::GetmybonusAnycard || task.data_text(SERIAL_KEYS).is_some() {
            return Ok(None);
        }

        let anycard_id = task.data_text(&["anycardId"]);
        let mut card = self.find_by_id_text(anycard_id.as_deref()).await?;
        if card.is_none() {
            if let Some(n) = task.data_text(CARD_NUMBER_KEYS) {
                card = self.db.find_anycard_by_any_number(&n).await?;
            }
        }
        let Some(card) = card else {
            return Ok(None);
        };
        let Some(serial) = card.serial_number.filter(|s| !s.trim().is_empty()) else {
            return Ok(None);
        };

        let mut data = match &task.data {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        data.insert("serialNumber".into(), json!(serial));
        if anycard_id.is_none() {
            data.insert("anycardId".into(), json!(card.id));
        }
        debug!(task_id = %task.id, "Task data enriched with serial number");
        Ok(Some(Value::Object(data)))
    }

    async fn on_completed(&self, task: &Task) -> Result<(), DatabaseError> {
        match task.task_type {
            TaskType::GetmybonusAnycard => self.record_redeemed(task).await,
            TaskType::AnycardLoad => self.record_loaded(task).await,
        }
    }
}
