//! Load a funded anycard into the anycard.ca swap wallet.
//!
//! The load form gives no reliable confirmation, so the workflow captures the
//! wallet balance for the card type before submitting and completes only once
//! that balance has grown by the card's value.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use super::{Verification, Workflow, required};
use crate::agent::resume::ResumptionState;
use crate::agent::steps::{Step, StepContext, StepEffect};
use crate::agent::surface::{ElementKind, Observation};
use crate::anycards::model::{AnycardType, parse_balance};
use crate::error::WorkflowError;
use crate::tasks::model::{Task, TaskType};

pub const BRANDS_PATH: &str = "/swap/brands";
pub const LOADCARD_PATH: &str = "/swap/loadcard";
pub const BRANDS_URL: &str = "https://www.anycard.ca/swap/brands";
pub const LOADCARD_URL: &str = "https://www.anycard.ca/swap/loadcard";

const WALLET_TILE: &str = ".account-balance-card";
const ZERO_WARNING: &str = ".modal-content .worning-message";
const CARD_NUMBER_INPUT: &str = "#cardnumber";
const PIN_INPUT: &str = "#pin";
const LOAD_BUTTON: &str = "button.load-card";

pub struct AnycardLoadWorkflow {
    steps: Vec<Box<dyn Step>>,
}

impl AnycardLoadWorkflow {
    pub fn new() -> Self {
        Self {
            steps: vec![
                Box::new(ZeroBalanceWarning),
                Box::new(OpenLoadForm),
                Box::new(SubmitLoadForm),
            ],
        }
    }
}

impl Default for AnycardLoadWorkflow {
    fn default() -> Self {
        Self::new()
    }
}

fn anycard_id(task: &Task) -> Result<Uuid, WorkflowError> {
    let raw = required(task, &["anycardId"])?;
    Uuid::parse_str(&raw).map_err(|_| WorkflowError::MissingField("anycardId".into()))
}

fn card_type_label(task: &Task) -> String {
    task.data_text(&["anycardType"])
        .unwrap_or_else(|| AnycardType::Celebrate.code().to_string())
}

fn on_page(obs: &Observation, path: &str) -> bool {
    obs.path().trim_end_matches('/') == path
}

/// Wallet balance shown on the tile labeled with `card_type`.
pub fn wallet_balance(obs: &Observation, card_type: &str) -> Option<Decimal> {
    let wanted = card_type.trim().to_lowercase();
    obs.texts()
        .filter(|e| e.selector == WALLET_TILE)
        .filter(|e| {
            let label = e.label.trim().to_lowercase();
            !label.is_empty() && label == wanted
        })
        .find_map(|e| parse_balance(&e.text))
}

impl Workflow for AnycardLoadWorkflow {
    fn task_type(&self) -> TaskType {
        TaskType::AnycardLoad
    }

    fn steps(&self) -> &[Box<dyn Step>] {
        &self.steps
    }

    fn verification(&self) -> Verification {
        Verification::Delta
    }

    fn validate(&self, task: &Task) -> Result<(), WorkflowError> {
        anycard_id(task)?;
        required(task, &["cardNumber"])?;
        let balance = required(task, &["balance"])?;
        match parse_balance(&balance) {
            Some(b) if b > Decimal::ZERO => Ok(()),
            _ => Err(WorkflowError::Extraction(format!(
                "Card balance is not a positive amount: {balance}"
            ))),
        }
    }

    fn no_step_message(&self) -> &'static str {
        "No wallet page or load form found on this page"
    }

    fn signal(&self, task: &Task, observation: &Observation) -> Option<Decimal> {
        if !on_page(observation, BRANDS_PATH) {
            return None;
        }
        wallet_balance(observation, &card_type_label(task))
    }

    fn verified_result(&self, task: &Task, state: &ResumptionState, current: Decimal) -> Value {
        json!({
            "outcome": "loaded",
            "anycardId": task.data_text(&["anycardId"]),
            "cardNumber": task.data_text(&["cardNumber"]),
            "baseline": state.baseline.map(|d| d.to_string()),
            "expectedDelta": state.expected_delta.map(|d| d.to_string()),
            "current": current.to_string(),
        })
    }
}

/// The site refuses cards with nothing on them. Reconcile the record and move on.
struct ZeroBalanceWarning;

static ZERO_BALANCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\$0\s*balance").expect("valid regex"));

#[async_trait]
impl Step for ZeroBalanceWarning {
    fn name(&self) -> &'static str {
        "zero_balance_warning"
    }

    fn is_applicable(&self, ctx: &StepContext<'_>) -> bool {
        ctx.observation
            .by_selector(ZERO_WARNING)
            .is_some_and(|e| ZERO_BALANCE.is_match(&e.content()))
    }

    async fn act(&self, ctx: &mut StepContext<'_>) -> Result<StepEffect, WorkflowError> {
        let id = anycard_id(ctx.task)?;
        match ctx.bridge.get_anycard(id).await {
            Ok(Some(card)) => {
                let mut input = card.to_input();
                input.balance = Some("0".into());
                if let Err(e) = ctx.bridge.update_anycard(id, input).await {
                    warn!(anycard_id = %id, error = %e, "Failed to zero balance after warning");
                }
            }
            Ok(None) => warn!(anycard_id = %id, "Anycard vanished before zeroing"),
            Err(e) => warn!(anycard_id = %id, error = %e, "Failed to read anycard"),
        }

        info!(task_id = %ctx.task.id, anycard_id = %id, "Card has a zero balance");
        ctx.surface.navigate(BRANDS_URL).await?;
        Ok(StepEffect::Finish(json!({
            "outcome": "zero_balance",
            "anycardId": id,
            "cardNumber": ctx.task.data_text(&["cardNumber"]),
        })))
    }
}

/// Wallet page: capture the baseline, then open the load form.
struct OpenLoadForm;

#[async_trait]
impl Step for OpenLoadForm {
    fn name(&self) -> &'static str {
        "open_load_form"
    }

    fn is_applicable(&self, ctx: &StepContext<'_>) -> bool {
        !ctx.state.submitted && on_page(&ctx.observation, BRANDS_PATH)
    }

    async fn act(&self, ctx: &mut StepContext<'_>) -> Result<StepEffect, WorkflowError> {
        let card_type = card_type_label(ctx.task);
        ctx.state.baseline = wallet_balance(&ctx.observation, &card_type);
        ctx.state.expected_delta = ctx
            .task
            .data_text(&["balance"])
            .as_deref()
            .and_then(parse_balance);
        ctx.persist().await?;
        info!(
            task_id = %ctx.task.id,
            baseline = ?ctx.state.baseline,
            expected = ?ctx.state.expected_delta,
            "Opening load form"
        );

        let link = ctx
            .observation
            .find(ElementKind::Link, |e| {
                e.selector.starts_with("a.nav-link")
                    && e.href.as_deref().map(str::trim) == Some(LOADCARD_PATH)
            })
            .map(|e| e.selector.clone());
        match link {
            Some(selector) => ctx.surface.click(&selector).await?,
            None => ctx.surface.navigate(LOADCARD_URL).await?,
        }
        Ok(StepEffect::Yield)
    }
}

/// Load form: enter card number and PIN, then submit.
struct SubmitLoadForm;

#[async_trait]
impl Step for SubmitLoadForm {
    fn name(&self) -> &'static str {
        "submit_load_form"
    }

    fn is_side_effect(&self) -> bool {
        true
    }

    fn is_applicable(&self, ctx: &StepContext<'_>) -> bool {
        let obs = &ctx.observation;
        on_page(obs, LOADCARD_PATH)
            && obs.has(CARD_NUMBER_INPUT)
            && obs.has(PIN_INPUT)
            && obs.has(LOAD_BUTTON)
    }

    async fn act(&self, ctx: &mut StepContext<'_>) -> Result<StepEffect, WorkflowError> {
        if ctx.state.expected_delta.is_none() {
            // Landed here without passing the wallet page; capture the baseline first.
            ctx.surface.navigate(BRANDS_URL).await?;
            return Ok(StepEffect::Yield);
        }

        let id = anycard_id(ctx.task)?;
        let card = ctx
            .bridge
            .get_anycard(id)
            .await?
            .ok_or_else(|| WorkflowError::Extraction(format!("Anycard {id} not found")))?;
        let pin = card
            .pin
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| WorkflowError::Extraction(format!("Anycard {id} has no PIN")))?;

        ctx.surface.fill(CARD_NUMBER_INPUT, card.card_number.trim()).await?;
        ctx.surface.fill(PIN_INPUT, pin).await?;

        ctx.mark_submitted().await?;
        info!(task_id = %ctx.task.id, anycard_id = %id, "Submitting load form");
        ctx.surface.click(LOAD_BUTTON).await?;
        Ok(StepEffect::Yield)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::surface::Element;
    use rust_decimal_macros::dec;

    fn brands(balance: &str) -> Observation {
        Observation::new(BRANDS_URL)
            .with(Element::text(WALLET_TILE, "Birthday", "$99.00"))
            .with(Element::text(WALLET_TILE, "Celebrate", balance))
    }

    #[test]
    fn wallet_balance_matches_type_label() {
        let obs = brands("$1,015.50");
        assert_eq!(wallet_balance(&obs, "celebrate"), Some(dec!(1015.50)));
        assert_eq!(wallet_balance(&obs, "Thanks"), None);
    }

    #[test]
    fn signal_only_on_wallet_page() {
        let wf = AnycardLoadWorkflow::new();
        let task = Task::new(TaskType::AnycardLoad, json!({"anycardType": "Celebrate"}));
        assert_eq!(wf.signal(&task, &brands("$10")), Some(dec!(10)));
        let form = Observation::new(LOADCARD_URL)
            .with(Element::text(WALLET_TILE, "Celebrate", "$10"));
        assert_eq!(wf.signal(&task, &form), None);
    }

    #[test]
    fn validate_rejects_unfunded_tasks() {
        let wf = AnycardLoadWorkflow::new();
        let id = Uuid::new_v4();
        let ok = Task::new(
            TaskType::AnycardLoad,
            json!({"anycardId": id, "cardNumber": "6001", "balance": "$5"}),
        );
        assert!(wf.validate(&ok).is_ok());

        let zero = Task::new(
            TaskType::AnycardLoad,
            json!({"anycardId": id, "cardNumber": "6001", "balance": "0"}),
        );
        assert!(wf.validate(&zero).is_err());

        let no_id = Task::new(TaskType::AnycardLoad, json!({"cardNumber": "6001"}));
        assert!(matches!(
            wf.validate(&no_id),
            Err(WorkflowError::MissingField(f)) if f == "anycardId"
        ));
    }
}
