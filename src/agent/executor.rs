//! Workflow executor.
//!
//! One executor drives one surface. Every page load starts a fresh cycle: the
//! executor re-derives which task it is working on from the surface address and
//! its resumption state, re-validates that against the task store, then runs the
//! first applicable step until a step yields, the task finishes, or nothing applies.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bridge::{BridgeClient, HttpBridgeClient};
use super::resume::{FileResumptionStore, ResumptionState, ResumptionStore};
use super::steps::{StepContext, StepEffect};
use super::surface::{EntryReference, Observation, Surface, with_task_params, without_task_id};
use super::verify::{SignalSource, Verifier, VerifyOutcome};
use super::workflows::{Verification, Workflow, WorkflowRegistry};
use crate::config::{AgentConfig, WaitPolicies};
use crate::error::{BridgeError, WorkflowError};
use crate::tasks::model::{Task, TaskType};

/// Where the executor is within a cycle. Published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorPhase {
    Idle,
    Attached,
    StepEvaluating,
    Acting,
    Waiting,
    Yielded,
    Verifying,
    Done,
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Fallback address for forms that ask for one.
    pub email: Option<String>,
    pub waits: WaitPolicies,
    pub verify_interval: Duration,
    /// Type to lease when the address carries no reference.
    pub default_task_type: Option<TaskType>,
    /// Guard against steps that continue without changing the page.
    pub max_steps_per_cycle: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            email: None,
            waits: WaitPolicies::default(),
            verify_interval: Duration::from_secs(2),
            default_task_type: None,
            max_steps_per_cycle: 16,
        }
    }
}

impl ExecutorSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            email: config.email.clone(),
            waits: config.waits,
            verify_interval: config.verify_interval,
            ..Self::default()
        }
    }

    pub fn with_default_task_type(mut self, task_type: TaskType) -> Self {
        self.default_task_type = Some(task_type);
        self
    }
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// No task to work on.
    Idle,
    /// The referenced task is gone or finished; local state was dropped.
    Discarded { task_id: Uuid },
    /// A step started a navigation. The next page load continues.
    Yielded { task_id: Uuid, step: &'static str },
    Done { task_id: Uuid },
    Failed { task_id: Uuid, reason: String },
    /// Left IN_PROGRESS for an operator.
    Stalled { task_id: Uuid, reason: String },
}

enum Driven {
    Effect { step: &'static str, effect: StepEffect },
    NoStep,
    Exhausted,
}

pub struct Executor {
    surface: Arc<dyn Surface>,
    bridge: Arc<dyn BridgeClient>,
    store: Arc<dyn ResumptionStore>,
    registry: WorkflowRegistry,
    settings: ExecutorSettings,
    scope: String,
    phase: watch::Sender<ExecutorPhase>,
}

impl Executor {
    pub fn new(
        surface: Arc<dyn Surface>,
        bridge: Arc<dyn BridgeClient>,
        store: Arc<dyn ResumptionStore>,
        scope: impl Into<String>,
        settings: ExecutorSettings,
    ) -> Self {
        let (phase, _) = watch::channel(ExecutorPhase::Idle);
        Self {
            surface,
            bridge,
            store,
            registry: WorkflowRegistry::standard(),
            settings,
            scope: scope.into(),
            phase,
        }
    }

    /// An executor talking to the bridge over HTTP, with resumption files under
    /// the configured directory.
    pub fn connect(surface: Arc<dyn Surface>, config: &AgentConfig, scope: impl Into<String>) -> Self {
        Self::new(
            surface,
            Arc::new(HttpBridgeClient::new(config.bridge_url.clone(), config.auth.clone())),
            Arc::new(FileResumptionStore::new(config.resume_dir.clone())),
            scope,
            ExecutorSettings::from_config(config),
        )
    }

    pub fn with_registry(mut self, registry: WorkflowRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn phases(&self) -> watch::Receiver<ExecutorPhase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> ExecutorPhase {
        *self.phase.borrow()
    }

    fn set_phase(&self, phase: ExecutorPhase) {
        self.phase.send_replace(phase);
    }

    /// Run one cycle against the current page.
    ///
    /// Errors are infrastructure failures (surface, bridge, resumption store)
    /// outside any task; anything that goes wrong while working a task is
    /// reported through the outcome.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, WorkflowError> {
        self.set_phase(ExecutorPhase::Idle);
        let observation = self.surface.observe().await?;
        let reference = EntryReference::from_url(&observation.url);
        let saved = self.store.load(&self.scope).await?;

        let known_id = reference.task_id.or(saved.as_ref().map(|s| s.task_id));
        let task = match known_id {
            Some(id) => match self.bridge.lease_task(id).await {
                Ok(task) => task,
                Err(
                    BridgeError::NotFound(_)
                    | BridgeError::AlreadyTerminal(_)
                    | BridgeError::NotInProgress(_),
                ) => {
                    info!(task_id = %id, "Task is no longer in progress, discarding local state");
                    self.store.clear(&self.scope).await?;
                    // Drop the stale id so the next cycle leases by type.
                    if reference.task_id == Some(id) {
                        self.surface
                            .replace_url(&without_task_id(&observation.url)?)
                            .await?;
                    }
                    return Ok(CycleOutcome::Discarded { task_id: id });
                }
                Err(e) => return Err(e.into()),
            },
            None => {
                let Some(task_type) = reference.task_type.or(self.settings.default_task_type)
                else {
                    return Ok(CycleOutcome::Idle);
                };
                match self.bridge.next_task(task_type).await? {
                    Some(task) => task,
                    None => {
                        debug!(task_type = %task_type, "Nothing to lease");
                        return Ok(CycleOutcome::Idle);
                    }
                }
            }
        };
        self.set_phase(ExecutorPhase::Attached);

        // An IN_PROGRESS task we cannot account for locally may already have had
        // its side effect; only an operator can tell.
        let state = match saved {
            Some(state) if state.belongs_to(&task) => state,
            _ if reference.task_id == Some(task.id) => {
                warn!(task_id = %task.id, "Resumption state lost for an in-progress task");
                return Ok(CycleOutcome::Stalled {
                    task_id: task.id,
                    reason: "Resumption state lost".into(),
                });
            }
            _ => ResumptionState::for_task(&task),
        };

        let workflow = match self.registry.workflow_for(task.task_type) {
            Ok(workflow) => workflow,
            Err(e) => return self.fail(&task, e).await,
        };
        if let Err(e) = workflow.validate(&task) {
            return self.fail(&task, e).await;
        }

        if !reference.points_at(&task) {
            let url = with_task_params(&observation.url, &task)?;
            self.surface.replace_url(&url).await?;
        }
        self.store.save(&self.scope, &state).await?;

        self.work(&task, workflow.as_ref(), state, observation).await
    }

    async fn work(
        &self,
        task: &Task,
        workflow: &dyn Workflow,
        mut state: ResumptionState,
        observation: Observation,
    ) -> Result<CycleOutcome, WorkflowError> {
        let (driven, observation) = {
            let mut ctx = StepContext {
                task,
                observation,
                surface: self.surface.as_ref(),
                bridge: self.bridge.as_ref(),
                state: &mut state,
                store: self.store.as_ref(),
                scope: &self.scope,
                settings: &self.settings,
                phase: &self.phase,
            };
            let driven = self.drive(workflow, &mut ctx).await;
            (driven, ctx.observation)
        };

        match driven {
            Err(e) => self.fail(task, e).await,
            Ok(Driven::Effect { step, effect }) => match effect {
                StepEffect::Finish(result) => self.complete(task, result).await,
                _ => {
                    self.set_phase(ExecutorPhase::Yielded);
                    debug!(task_id = %task.id, step = step, "Yielded to navigation");
                    Ok(CycleOutcome::Yielded {
                        task_id: task.id,
                        step,
                    })
                }
            },
            Ok(Driven::Exhausted) => {
                warn!(task_id = %task.id, "Step budget exhausted");
                Ok(CycleOutcome::Stalled {
                    task_id: task.id,
                    reason: "Steps kept continuing without progress".into(),
                })
            }
            Ok(Driven::NoStep) if !state.submitted => {
                self.fail(task, WorkflowError::NoApplicableStep(workflow.no_step_message().into()))
                    .await
            }
            Ok(Driven::NoStep) => match workflow.verification() {
                Verification::Delta => self.verify(task, workflow, &state, &observation).await,
                Verification::Page => {
                    debug!(task_id = %task.id, "Submitted, waiting for the result page");
                    Ok(CycleOutcome::Stalled {
                        task_id: task.id,
                        reason: "Submitted, result page not shown".into(),
                    })
                }
            },
        }
    }

    async fn drive(
        &self,
        workflow: &dyn Workflow,
        ctx: &mut StepContext<'_>,
    ) -> Result<Driven, WorkflowError> {
        for _ in 0..self.settings.max_steps_per_cycle {
            ctx.set_phase(ExecutorPhase::StepEvaluating);
            let view: &StepContext<'_> = ctx;
            let Some(step) = workflow
                .steps()
                .iter()
                .filter(|s| !(view.state.submitted && s.is_side_effect()))
                .find(|s| s.is_applicable(view))
            else {
                return Ok(Driven::NoStep);
            };

            debug!(task_id = %ctx.task.id, step = step.name(), "Running step");
            ctx.set_phase(ExecutorPhase::Acting);
            match step.act(ctx).await? {
                StepEffect::Continue => ctx.refresh().await?,
                effect => {
                    return Ok(Driven::Effect {
                        step: step.name(),
                        effect,
                    });
                }
            }
        }
        Ok(Driven::Exhausted)
    }

    async fn verify(
        &self,
        task: &Task,
        workflow: &dyn Workflow,
        state: &ResumptionState,
        observation: &Observation,
    ) -> Result<CycleOutcome, WorkflowError> {
        let prepared = state.baseline.is_some() && state.expected_delta.is_some();
        if prepared && workflow.signal(task, observation).is_none() {
            debug!(task_id = %task.id, "Verification signal not on this page");
            return Ok(CycleOutcome::Stalled {
                task_id: task.id,
                reason: "Verification signal not visible".into(),
            });
        }

        self.set_phase(ExecutorPhase::Verifying);
        let signal = SurfaceSignal {
            surface: self.surface.as_ref(),
            workflow,
            task,
        };
        match Verifier::new(self.settings.verify_interval)
            .run(state, &signal)
            .await
        {
            VerifyOutcome::Verified { current, needed } => {
                info!(task_id = %task.id, current = %current, needed = %needed, "Signal verified");
                let result = workflow.verified_result(task, state, current);
                self.complete(task, result).await
            }
            VerifyOutcome::Impasse(reason) => {
                warn!(task_id = %task.id, reason = %reason, "Verification impasse");
                Ok(CycleOutcome::Stalled {
                    task_id: task.id,
                    reason,
                })
            }
        }
    }

    async fn complete(
        &self,
        task: &Task,
        result: serde_json::Value,
    ) -> Result<CycleOutcome, WorkflowError> {
        match self.bridge.complete_task(task.id, result).await {
            Ok(_) => info!(task_id = %task.id, task_type = %task.task_type, "Task completed"),
            Err(BridgeError::AlreadyTerminal(_)) => {
                warn!(task_id = %task.id, "Task was already finalized")
            }
            Err(e) => return Err(e.into()),
        }
        self.store.clear(&self.scope).await?;
        self.set_phase(ExecutorPhase::Done);
        Ok(CycleOutcome::Done { task_id: task.id })
    }

    async fn fail(&self, task: &Task, error: WorkflowError) -> Result<CycleOutcome, WorkflowError> {
        let reason = error.to_string();
        warn!(task_id = %task.id, task_type = %task.task_type, error = %reason, "Task failed");
        match self.bridge.fail_task(task.id, &reason).await {
            Ok(_) => {}
            Err(BridgeError::AlreadyTerminal(_)) => {
                warn!(task_id = %task.id, "Task was already finalized")
            }
            Err(e) => return Err(e.into()),
        }
        self.store.clear(&self.scope).await?;
        self.set_phase(ExecutorPhase::Done);
        Ok(CycleOutcome::Failed {
            task_id: task.id,
            reason,
        })
    }
}

/// Reads the verification signal off a fresh observation.
struct SurfaceSignal<'a> {
    surface: &'a dyn Surface,
    workflow: &'a dyn Workflow,
    task: &'a Task,
}

#[async_trait]
impl<'a> SignalSource for SurfaceSignal<'a> {
    async fn read(&self) -> Option<Decimal> {
        match self.surface.observe().await {
            Ok(observation) => self.workflow.signal(self.task, &observation),
            Err(e) => {
                debug!(error = %e, "Observation failed during verification");
                None
            }
        }
    }
}

/// Spawn a loop that runs a cycle every `interval`.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop the loop.
pub fn spawn_executor_loop(
    executor: Arc<Executor>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(scope = %executor.scope, "Executor loop started");
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                info!("Executor loop shutting down");
                break;
            }
            match executor.run_cycle().await {
                Ok(CycleOutcome::Idle) => {}
                Ok(outcome) => debug!(outcome = ?outcome, "Cycle finished"),
                Err(e) => warn!(error = %e, "Cycle failed"),
            }
        }
    });

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::bridge::LocalBridge;
    use crate::agent::resume::MemoryResumptionStore;
    use crate::agent::surface::Element;
    use crate::agent::testing::ScriptedSurface;
    use crate::agent::workflows::anycard_load::{BRANDS_URL, LOADCARD_URL};
    use crate::anycards::hooks::AnycardTaskHooks;
    use crate::anycards::model::{Anycard, AnycardType};
    use crate::config::WaitPolicy;
    use crate::store::{Database, LibSqlBackend};
    use crate::tasks::model::TaskStatus;
    use crate::tasks::queue::DispatchQueue;
    use rust_decimal_macros::dec;
    use serde_json::json;

    const SCOPE: &str = "test-scope";

    struct Harness {
        queue: Arc<DispatchQueue>,
        surface: Arc<ScriptedSurface>,
        store: Arc<MemoryResumptionStore>,
        executor: Executor,
    }

    fn settings(default_type: TaskType) -> ExecutorSettings {
        ExecutorSettings {
            email: Some("ops@example.com".into()),
            waits: WaitPolicies::uniform(WaitPolicy::new(
                Duration::from_millis(200),
                Duration::from_millis(1),
            )),
            verify_interval: Duration::from_millis(1),
            default_task_type: Some(default_type),
            max_steps_per_cycle: 8,
        }
    }

    async fn harness(surface: ScriptedSurface, default_type: TaskType) -> Harness {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue =
            DispatchQueue::with_hooks(db.clone(), Arc::new(AnycardTaskHooks::new(db.clone())));
        let surface = Arc::new(surface);
        let store = Arc::new(MemoryResumptionStore::new());
        let executor = Executor::new(
            surface.clone(),
            Arc::new(LocalBridge::new(queue.clone())),
            store.clone(),
            SCOPE,
            settings(default_type),
        );
        Harness {
            queue,
            surface,
            store,
            executor,
        }
    }

    fn landing() -> Observation {
        Observation::new("https://getmybonus.ca/").with(Element::link(
            "a.promo",
            "AnyCard Celebrate",
            "https://getmybonus.ca/anycard",
        ))
    }

    #[tokio::test]
    async fn connect_applies_agent_config() {
        let dir = tempfile::tempdir().unwrap();
        let resume_dir = dir.path().to_string_lossy().into_owned();
        let config = AgentConfig::from_lookup(|key| match key {
            "BRIDGE_AUTH_PASSWORD" => Some("s3cret".to_string()),
            "AGENT_EMAIL" => Some("ops@example.com".to_string()),
            "AGENT_RESUME_DIR" => Some(resume_dir.clone()),
            "AGENT_VERIFY_INTERVAL_SECS" => Some("3".to_string()),
            _ => None,
        })
        .unwrap();

        let surface = Arc::new(ScriptedSurface::new(vec![Observation::new("https://getmybonus.ca/")]));
        let executor = Executor::connect(surface.clone(), &config, "getmybonus.ca");
        assert_eq!(executor.settings.email.as_deref(), Some("ops@example.com"));
        assert_eq!(executor.settings.verify_interval, Duration::from_secs(3));
        assert_eq!(executor.settings.default_task_type, None);

        // No reference and no default type: nothing reaches the bridge.
        assert_eq!(executor.run_cycle().await.unwrap(), CycleOutcome::Idle);
        assert!(surface.actions().is_empty());
    }

    #[tokio::test]
    async fn idle_without_work() {
        let h = harness(ScriptedSurface::new(vec![landing()]), TaskType::GetmybonusAnycard).await;
        assert_eq!(h.executor.run_cycle().await.unwrap(), CycleOutcome::Idle);
        assert!(h.surface.actions().is_empty());
    }

    #[tokio::test]
    async fn bonus_claim_across_page_loads() {
        let h = harness(ScriptedSurface::new(vec![landing()]), TaskType::GetmybonusAnycard).await;
        let source = Anycard::new("6001", AnycardType::Celebrate)
            .with_serial("1234567890")
            .with_needs_redeem(true);
        h.queue.db().insert_anycard(&source).await.unwrap();

        // Landing page: the task is leased and the promo link followed.
        let outcome = h.executor.run_cycle().await.unwrap();
        let CycleOutcome::Yielded { task_id, step } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(step, "open_promo");
        let promo_url = h.surface.url();
        assert!(promo_url.starts_with("https://getmybonus.ca/anycard?"));
        assert!(promo_url.contains(&task_id.to_string()));

        // Promo page through the claim wizard.
        let at = |o: Observation| Observation { url: promo_url.clone(), ..o };
        let promo = at(landing()).with(Element::button("input.get-bonus", "Get My Bonus"));
        let wizard = at(Observation::new("")).with(Element::input("input.wizard-serial-number"));
        let saved = wizard.clone().with(Element::button("button.save", "Save"));
        let captcha = at(Observation::new("")).with(Element::button("input.next", "Next").disabled());
        let solved = at(Observation::new("")).with(Element::button("input.next", "Next"));
        let email = at(Observation::new(""))
            .with(Element::input("#workflow_data_email"))
            .with(Element::input("#workflow_data_email_confirmation"))
            .with(Element::checkbox("#workflow_data_terms_of_service"))
            .with(Element::button("input.show-code", "Show & Email Code"));
        let codes = at(Observation::new(""))
            .with(Element::text(".codes-container", "", ""))
            .with(Element::text(".codes-container .title", "Bonus Code", "6009998887776665"))
            .with(Element::text(".codes-container .title", "PIN", "4321"))
            .with(Element::text("div.eligible", "", "Eligible Card: 1234567890"));

        h.surface
            .on("click input.get-bonus", vec![wizard])
            .on("fill input.wizard-serial-number=1234567890", vec![saved])
            .on("click button.save", vec![captcha, solved])
            .on("click input.next", vec![email])
            .on("click input.show-code", vec![codes]);
        h.surface.show(vec![promo]);

        assert_eq!(
            h.executor.run_cycle().await.unwrap(),
            CycleOutcome::Yielded {
                task_id,
                step: "enter_serial"
            }
        );
        let state = h.store.load(SCOPE).await.unwrap().unwrap();
        assert!(state.submitted);
        let actions = h.surface.actions();
        assert!(actions.contains(&"fill #workflow_data_email=ops@example.com".to_string()));
        assert!(actions.contains(&"check #workflow_data_terms_of_service".to_string()));
        assert_eq!(actions.last().map(String::as_str), Some("click input.show-code"));

        // Codes page: harvest and complete.
        assert_eq!(
            h.executor.run_cycle().await.unwrap(),
            CycleOutcome::Done { task_id }
        );
        assert_eq!(h.executor.phase(), ExecutorPhase::Done);
        let task = h.queue.get(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let result = task.result.unwrap();
        assert_eq!(result["card_number"], "6009998887776665");
        assert_eq!(result["PIN"], "4321");
        assert!(h.store.load(SCOPE).await.unwrap().is_none());

        let db = h.queue.db();
        assert!(!db.get_anycard(source.id).await.unwrap().unwrap().needs_redeem);
        let harvested = db
            .find_anycard_by_number(AnycardType::Celebrate, "6009998887776665")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(harvested.pin.as_deref(), Some("4321"));

        // A reload of the codes page finds the task finished.
        assert_eq!(
            h.executor.run_cycle().await.unwrap(),
            CycleOutcome::Discarded { task_id }
        );
    }

    #[tokio::test]
    async fn wallet_load_verified_by_balance_delta() {
        let brands = |balance: &str| {
            Observation::new(BRANDS_URL)
                .with(Element::text(".account-balance-card", "Celebrate", balance))
                .with(Element::link("a.nav-link", "Add new card", "/swap/loadcard"))
        };
        let h = harness(ScriptedSurface::new(vec![brands("$100.00")]), TaskType::AnycardLoad).await;
        let card = Anycard::new("7001", AnycardType::Celebrate)
            .with_pin("9999")
            .with_balance("$25.00");
        h.queue.db().insert_anycard(&card).await.unwrap();

        let form = Observation::new(LOADCARD_URL)
            .with(Element::input("#cardnumber"))
            .with(Element::input("#pin"))
            .with(Element::button("button.load-card", "Load card"));
        h.surface
            .on("click a.nav-link", vec![form])
            .on(
                "click button.load-card",
                vec![brands("$100.00"), brands("$100.00"), brands("$125.00")],
            );

        let outcome = h.executor.run_cycle().await.unwrap();
        let CycleOutcome::Yielded { task_id, step } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(step, "open_load_form");
        let state = h.store.load(SCOPE).await.unwrap().unwrap();
        assert_eq!(state.baseline, Some(dec!(100.00)));
        assert_eq!(state.expected_delta, Some(dec!(25.00)));

        // The form page carries no reference; the saved state does.
        assert_eq!(
            h.executor.run_cycle().await.unwrap(),
            CycleOutcome::Yielded {
                task_id,
                step: "submit_load_form"
            }
        );
        let actions = h.surface.actions();
        assert!(actions.contains(&"fill #cardnumber=7001".to_string()));
        assert!(actions.contains(&"fill #pin=9999".to_string()));

        assert_eq!(
            h.executor.run_cycle().await.unwrap(),
            CycleOutcome::Done { task_id }
        );
        let task = h.queue.get(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let result = task.result.unwrap();
        assert_eq!(result["outcome"], "loaded");
        assert_eq!(result["current"], "125.00");
        let stored = h.queue.db().get_anycard(card.id).await.unwrap().unwrap();
        assert_eq!(stored.balance.as_deref(), Some("0"));
    }

    async fn leased(h: &Harness, task_type: TaskType, data: serde_json::Value) -> Task {
        let task = h.queue.enqueue(task_type, data).await.unwrap();
        let leased = h.queue.next(task_type).await.unwrap().unwrap();
        assert_eq!(leased.id, task.id);
        leased
    }

    #[tokio::test]
    async fn finished_task_in_address_is_discarded() {
        let h = harness(ScriptedSurface::new(vec![]), TaskType::GetmybonusAnycard).await;
        let task = leased(&h, TaskType::GetmybonusAnycard, json!({"serialNumber": "1234567890"})).await;
        h.queue.complete(task.id, json!({})).await.unwrap();
        h.store
            .save(SCOPE, &ResumptionState::for_task(&task))
            .await
            .unwrap();
        h.surface.show(vec![
            Observation::new(with_task_params("https://getmybonus.ca/codes", &task).unwrap()),
        ]);

        assert_eq!(
            h.executor.run_cycle().await.unwrap(),
            CycleOutcome::Discarded { task_id: task.id }
        );
        assert!(h.store.load(SCOPE).await.unwrap().is_none());
        assert_eq!(
            h.surface.actions(),
            ["replace_url https://getmybonus.ca/codes?task_type=getmybonus_anycard"]
        );
    }

    #[tokio::test]
    async fn stale_reference_falls_back_to_leasing_by_type() {
        let h = harness(ScriptedSurface::new(vec![]), TaskType::AnycardLoad).await;
        let done = leased(&h, TaskType::GetmybonusAnycard, json!({"serialNumber": "1234567890"})).await;
        h.queue.complete(done.id, json!({})).await.unwrap();
        let fresh = h
            .queue
            .enqueue(TaskType::GetmybonusAnycard, json!({"serialNumber": "5555555555"}))
            .await
            .unwrap();
        h.surface.show(vec![Observation {
            url: with_task_params("https://getmybonus.ca/codes", &done).unwrap(),
            ..landing()
        }]);

        assert_eq!(
            h.executor.run_cycle().await.unwrap(),
            CycleOutcome::Discarded { task_id: done.id }
        );
        // The address keeps its type, which wins over the default type.
        assert_eq!(
            h.executor.run_cycle().await.unwrap(),
            CycleOutcome::Yielded {
                task_id: fresh.id,
                step: "open_promo"
            }
        );
        assert_eq!(
            h.queue.get(fresh.id).await.unwrap().status,
            TaskStatus::InProgress
        );
        assert!(h.surface.url().contains(&fresh.id.to_string()));
    }

    #[tokio::test]
    async fn lost_state_stalls_without_acting() {
        let h = harness(ScriptedSurface::new(vec![]), TaskType::GetmybonusAnycard).await;
        let task = leased(&h, TaskType::GetmybonusAnycard, json!({"serialNumber": "1234567890"})).await;
        h.surface.show(vec![
            Observation::new(with_task_params("https://getmybonus.ca/anycard", &task).unwrap())
                .with(Element::input("input.wizard-serial-number")),
        ]);

        let outcome = h.executor.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Stalled { task_id, .. } if task_id == task.id));
        assert_eq!(
            h.queue.get(task.id).await.unwrap().status,
            TaskStatus::InProgress
        );
        assert!(h.surface.actions().is_empty());
    }

    #[tokio::test]
    async fn side_effect_is_not_repeated_after_submit() {
        let h = harness(ScriptedSurface::new(vec![]), TaskType::GetmybonusAnycard).await;
        let task = leased(&h, TaskType::GetmybonusAnycard, json!({"serialNumber": "1234567890"})).await;
        let mut state = ResumptionState::for_task(&task);
        state.mark_submitted();
        h.store.save(SCOPE, &state).await.unwrap();
        h.surface.show(vec![
            Observation::new(with_task_params("https://getmybonus.ca/anycard", &task).unwrap())
                .with(Element::input("input.wizard-serial-number")),
        ]);

        let outcome = h.executor.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Stalled { .. }));
        assert!(h.surface.actions().is_empty());
        assert!(h.store.load(SCOPE).await.unwrap().unwrap().submitted);
    }

    #[tokio::test]
    async fn unrecognized_page_fails_the_task() {
        let h = harness(
            ScriptedSurface::new(vec![Observation::new("https://getmybonus.ca/elsewhere")]),
            TaskType::GetmybonusAnycard,
        )
        .await;
        let task = h
            .queue
            .enqueue(TaskType::GetmybonusAnycard, json!({"serialNumber": "1234567890"}))
            .await
            .unwrap();

        let outcome = h.executor.run_cycle().await.unwrap();
        let CycleOutcome::Failed { task_id, reason } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(task_id, task.id);
        assert_eq!(
            reason,
            "No Anycard link / Get My Bonus / serial input found on this page"
        );
        let stored = h.queue.get(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some(reason.as_str()));
        assert!(h.store.load(SCOPE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_task_fails_before_acting() {
        let h = harness(ScriptedSurface::new(vec![landing()]), TaskType::GetmybonusAnycard).await;
        let task = h
            .queue
            .enqueue(TaskType::GetmybonusAnycard, json!({"cardNumber": "6001"}))
            .await
            .unwrap();

        let outcome = h.executor.run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Failed {
                task_id: task.id,
                reason: "task.data.serialNumber missing".into()
            }
        );
        assert!(h.surface.actions().is_empty());
    }

    #[tokio::test]
    async fn missing_baseline_is_an_impasse() {
        let h = harness(ScriptedSurface::new(vec![]), TaskType::AnycardLoad).await;
        let task = leased(
            &h,
            TaskType::AnycardLoad,
            json!({"anycardId": Uuid::new_v4(), "cardNumber": "7001", "balance": "25"}),
        )
        .await;
        let mut state = ResumptionState::for_task(&task);
        state.expected_delta = Some(dec!(25));
        state.mark_submitted();
        h.store.save(SCOPE, &state).await.unwrap();
        h.surface.show(vec![
            Observation::new(with_task_params(BRANDS_URL, &task).unwrap())
                .with(Element::text(".account-balance-card", "Celebrate", "$125")),
        ]);

        let outcome = h.executor.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Stalled { .. }));
        assert_eq!(
            h.queue.get(task.id).await.unwrap().status,
            TaskStatus::InProgress
        );
        assert_eq!(h.store.load(SCOPE).await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn loop_runs_cycles_until_shutdown() {
        let h = harness(ScriptedSurface::new(vec![landing()]), TaskType::GetmybonusAnycard).await;
        let executor = Arc::new(h.executor);
        let (handle, shutdown) = spawn_executor_loop(executor.clone(), Duration::from_millis(5));

        let task = h
            .queue
            .enqueue(TaskType::GetmybonusAnycard, json!({"serialNumber": "1234567890"}))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.queue.get(task.id).await.unwrap().status == TaskStatus::Ready {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(h.surface.url().contains(&task.id.to_string()));

        shutdown.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
