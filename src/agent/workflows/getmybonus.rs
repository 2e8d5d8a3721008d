//! Bonus-card claim on getmybonus.ca.
//!
//! The claim crosses several page loads: landing page, anycard promo, the
//! serial/captcha/email wizard, then a codes page showing the new bonus card.
//! The "Show & Email Code" click is the side effect; the codes page is the proof.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use tracing::info;

use super::{Workflow, required};
use crate::agent::steps::{Step, StepContext, StepEffect};
use crate::agent::surface::{ElementKind, Observation, with_task_params};
use crate::error::WorkflowError;
use crate::tasks::model::{Task, TaskType};

const SERIAL_KEYS: &[&str] = &["serialNumber", "serial_number"];
const SERIAL_INPUT: &str = "input.wizard-serial-number";
const CODES_CONTAINER: &str = ".codes-container";
const EMAIL_INPUT: &str = "#workflow_data_email";
const EMAIL_CONFIRM_INPUT: &str = "#workflow_data_email_confirmation";
const TERMS_CHECKBOX: &str = "#workflow_data_terms_of_service";

/// Harvested cards are always this product and face value.
const HARVESTED_CARD_TYPE: &str = "Celebrate";
const HARVESTED_BALANCE: &str = "10";

static LABELED_SERIAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)eligible\s*card\s*:\s*([0-9]{10,})").expect("valid regex"));
static LONG_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9]{10,}").expect("valid regex"));

pub struct GetmybonusWorkflow {
    steps: Vec<Box<dyn Step>>,
}

impl GetmybonusWorkflow {
    pub fn new() -> Self {
        Self {
            steps: vec![
                Box::new(HarvestCodes),
                Box::new(OpenPromo),
                Box::new(ClaimBonus),
                Box::new(EnterSerial),
            ],
        }
    }
}

impl Default for GetmybonusWorkflow {
    fn default() -> Self {
        Self::new()
    }
}

impl Workflow for GetmybonusWorkflow {
    fn task_type(&self) -> TaskType {
        TaskType::GetmybonusAnycard
    }

    fn steps(&self) -> &[Box<dyn Step>] {
        &self.steps
    }

    fn validate(&self, task: &Task) -> Result<(), WorkflowError> {
        required(task, SERIAL_KEYS).map(|_| ())
    }

    fn no_step_message(&self) -> &'static str {
        "No Anycard link / Get My Bonus / serial input found on this page"
    }
}

/// Codes page: check the eligible card is ours, then read Bonus Code and PIN.
struct HarvestCodes;

impl HarvestCodes {
    /// Prefer the number after the "Eligible Card:" label; bonus code digits may
    /// share the same block.
    fn eligible_serial(&self, obs: &Observation) -> Option<String> {
        obs.texts()
            .map(|e| e.content())
            .filter(|text| text.to_lowercase().contains("eligible card"))
            .find_map(|text| {
                if let Some(caps) = LABELED_SERIAL.captures(&text) {
                    return caps.get(1).map(|m| m.as_str().to_string());
                }
                LONG_NUMBER
                    .find_iter(&text)
                    .last()
                    .map(|m| m.as_str().to_string())
            })
    }
}

/// Bonus code and PIN, from the titled blocks inside the codes container.
fn bonus_code_and_pin(obs: &Observation) -> (Option<String>, Option<String>) {
    let mut code = None;
    let mut pin = None;
    for el in obs.texts().filter(|e| e.selector.starts_with(CODES_CONTAINER)) {
        let title = el.label.trim().to_lowercase();
        let value = el.text.trim();
        if value.is_empty() {
            continue;
        }
        if code.is_none() && title.contains("bonus code") {
            code = Some(value.to_string());
        }
        if pin.is_none() && title == "pin" {
            pin = Some(value.to_string());
        }
    }
    (code, pin)
}

#[async_trait]
impl Step for HarvestCodes {
    fn name(&self) -> &'static str {
        "harvest_codes"
    }

    fn is_applicable(&self, ctx: &StepContext<'_>) -> bool {
        ctx.observation.has(CODES_CONTAINER)
    }

    async fn act(&self, ctx: &mut StepContext<'_>) -> Result<StepEffect, WorkflowError> {
        let eligible = self
            .eligible_serial(&ctx.observation)
            .ok_or_else(|| WorkflowError::Extraction("Eligible Card serial not found".into()))?;
        let serial = required(ctx.task, SERIAL_KEYS)?;
        if eligible.trim() != serial {
            return Err(WorkflowError::Mismatch {
                what: "Eligible Card serial".into(),
                page: eligible,
                task: serial,
            });
        }

        let (Some(code), Some(pin)) = bonus_code_and_pin(&ctx.observation) else {
            return Err(WorkflowError::Extraction(
                "Failed to extract Bonus Code or PIN".into(),
            ));
        };

        info!(task_id = %ctx.task.id, serial = %serial, "Bonus codes harvested");
        Ok(StepEffect::Finish(json!({
            "card_number": code,
            "PIN": pin,
            "card_type": HARVESTED_CARD_TYPE,
            "serial_number": serial,
            "balance": HARVESTED_BALANCE,
            "status": "ACTIVE",
        })))
    }
}

/// Landing page: follow the anycard promo link, carrying the task reference.
struct OpenPromo;

impl OpenPromo {
    fn target(obs: &Observation) -> Option<String> {
        obs.find(ElementKind::Link, |e| {
            e.label.to_lowercase().contains("anycard") && e.href.is_some()
        })
        .and_then(|e| e.href.as_deref())
        .and_then(|href| obs.resolve(href))
        .filter(|href| !obs.url.starts_with(href.as_str()))
    }
}

#[async_trait]
impl Step for OpenPromo {
    fn name(&self) -> &'static str {
        "open_promo"
    }

    fn is_applicable(&self, ctx: &StepContext<'_>) -> bool {
        Self::target(&ctx.observation).is_some()
    }

    async fn act(&self, ctx: &mut StepContext<'_>) -> Result<StepEffect, WorkflowError> {
        let href = Self::target(&ctx.observation)
            .ok_or_else(|| WorkflowError::NoApplicableStep("Anycard link disappeared".into()))?;
        let next = with_task_params(&href, ctx.task)?;
        info!(task_id = %ctx.task.id, url = %next, "Opening anycard promo");
        ctx.surface.navigate(&next).await?;
        Ok(StepEffect::Yield)
    }
}

/// Promo page: press "Get My Bonus".
struct ClaimBonus;

#[async_trait]
impl Step for ClaimBonus {
    fn name(&self) -> &'static str {
        "claim_bonus"
    }

    fn is_applicable(&self, ctx: &StepContext<'_>) -> bool {
        ctx.observation
            .button(|l| l.contains("get my bonus"))
            .is_some()
    }

    async fn act(&self, ctx: &mut StepContext<'_>) -> Result<StepEffect, WorkflowError> {
        let selector = ctx
            .observation
            .button(|l| l.contains("get my bonus"))
            .map(|e| e.selector.clone())
            .ok_or_else(|| WorkflowError::NoApplicableStep("Get My Bonus disappeared".into()))?;
        ctx.surface.click(&selector).await?;
        Ok(StepEffect::Continue)
    }
}

/// The claim wizard: serial, captcha-gated Next, email and terms, then the
/// "Show & Email Code" submit.
struct EnterSerial;

#[async_trait]
impl Step for EnterSerial {
    fn name(&self) -> &'static str {
        "enter_serial"
    }

    fn is_side_effect(&self) -> bool {
        true
    }

    fn is_applicable(&self, ctx: &StepContext<'_>) -> bool {
        ctx.observation.has(SERIAL_INPUT)
    }

    async fn act(&self, ctx: &mut StepContext<'_>) -> Result<StepEffect, WorkflowError> {
        let serial = required(ctx.task, SERIAL_KEYS)?;
        let email = ctx
            .task
            .data_text(&["email"])
            .or_else(|| ctx.settings.email.clone())
            .ok_or_else(|| WorkflowError::MissingField("email".into()))?;
        let waits = ctx.settings.waits;

        ctx.surface.fill(SERIAL_INPUT, &serial).await?;

        let save = ctx
            .wait_for_element("Save button", waits.save_button, |o| o.button(|l| l == "save"))
            .await?;
        ctx.surface.click(&save.selector).await?;

        // A human may have to solve a captcha before Next enables.
        let next = ctx
            .wait_for_element("Next button enabled", waits.captcha, |o| {
                o.button(|l| l == "next")
            })
            .await?;
        ctx.surface.click(&next.selector).await?;

        ctx.wait_for_element("Email inputs", waits.email_inputs, |o| {
            if o.has(EMAIL_INPUT) && o.has(EMAIL_CONFIRM_INPUT) {
                o.by_selector(TERMS_CHECKBOX)
            } else {
                None
            }
        })
        .await?;
        ctx.surface.fill(EMAIL_INPUT, &email).await?;
        ctx.surface.fill(EMAIL_CONFIRM_INPUT, &email).await?;
        ctx.surface.check(TERMS_CHECKBOX).await?;

        let submit = ctx
            .wait_for_element("Show & Email Code enabled", waits.show_code, |o| {
                o.button(|l| l.contains("show") && l.contains("email"))
            })
            .await?;

        ctx.mark_submitted().await?;
        info!(task_id = %ctx.task.id, "Submitting bonus claim");
        ctx.surface.click(&submit.selector).await?;
        Ok(StepEffect::Yield)
    }
}
