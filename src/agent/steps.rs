//! Step library primitives.
//!
//! A step is a guarded action: the executor runs the first applicable step of a
//! workflow against the current observation. Steps may yield (the surface is about
//! to navigate away), continue (re-observe and pick again) or finish the task.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use super::bridge::BridgeClient;
use super::executor::{ExecutorPhase, ExecutorSettings};
use super::resume::{ResumptionState, ResumptionStore};
use super::surface::{Element, Observation, Surface};
use crate::config::WaitPolicy;
use crate::error::WorkflowError;
use crate::tasks::model::Task;

#[derive(Debug, Clone, PartialEq)]
pub enum StepEffect {
    /// Re-observe and select again.
    Continue,
    /// The surface is navigating; this cycle ends and the next page load resumes.
    Yield,
    /// Complete the task with this result.
    Finish(Value),
}

/// Everything a step may touch during one action.
pub struct StepContext<'a> {
    pub task: &'a Task,
    pub observation: Observation,
    pub surface: &'a dyn Surface,
    pub bridge: &'a dyn BridgeClient,
    pub state: &'a mut ResumptionState,
    pub store: &'a dyn ResumptionStore,
    pub scope: &'a str,
    pub settings: &'a ExecutorSettings,
    pub phase: &'a watch::Sender<ExecutorPhase>,
}

impl StepContext<'_> {
    pub fn set_phase(&self, phase: ExecutorPhase) {
        self.phase.send_replace(phase);
    }

    pub async fn persist(&self) -> Result<(), WorkflowError> {
        self.store.save(self.scope, self.state).await
    }

    /// Record that the side effect is about to fire. Must precede the action.
    pub async fn mark_submitted(&mut self) -> Result<(), WorkflowError> {
        self.state.mark_submitted();
        self.persist().await
    }

    pub async fn refresh(&mut self) -> Result<(), WorkflowError> {
        self.observation = self.surface.observe().await?;
        Ok(())
    }

    /// Wait for an element on the live page, keeping the newest observation.
    pub async fn wait_for_element<F>(
        &mut self,
        what: &str,
        policy: WaitPolicy,
        pred: F,
    ) -> Result<Element, WorkflowError>
    where
        F: Fn(&Observation) -> Option<&Element> + Send + Sync,
    {
        self.set_phase(ExecutorPhase::Waiting);
        let (observation, element) = wait_for(self.surface, what, policy, pred).await?;
        self.observation = observation;
        self.set_phase(ExecutorPhase::Acting);
        Ok(element)
    }
}

/// Poll the surface until `pred` finds an element or the policy times out.
/// The surface is always observed at least once.
pub async fn wait_for<F>(
    surface: &dyn Surface,
    what: &str,
    policy: WaitPolicy,
    pred: F,
) -> Result<(Observation, Element), WorkflowError>
where
    F: Fn(&Observation) -> Option<&Element> + Send + Sync,
{
    let started = Instant::now();
    loop {
        let observation = surface.observe().await?;
        if let Some(element) = pred(&observation).cloned() {
            return Ok((observation, element));
        }
        if started.elapsed() >= policy.timeout {
            return Err(WorkflowError::StepTimeout {
                what: what.to_string(),
                after: policy.timeout,
            });
        }
        debug!(what = what, "Waiting");
        tokio::time::sleep(policy.interval).await;
    }
}

#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    /// Side-effecting steps are never re-run once the task is marked submitted.
    fn is_side_effect(&self) -> bool {
        false
    }

    fn is_applicable(&self, ctx: &StepContext<'_>) -> bool;

    async fn act(&self, ctx: &mut StepContext<'_>) -> Result<StepEffect, WorkflowError>;
}
