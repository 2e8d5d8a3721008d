//! Agent side: drives a page through a task's workflow and reports back to the bridge.

pub mod bridge;
pub mod executor;
pub mod resume;
pub mod steps;
pub mod surface;
pub mod verify;
pub mod workflows;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{BridgeClient, HttpBridgeClient, LocalBridge};
pub use executor::{CycleOutcome, Executor, ExecutorPhase, ExecutorSettings, spawn_executor_loop};
pub use resume::{FileResumptionStore, MemoryResumptionStore, ResumptionState, ResumptionStore};
pub use surface::{Element, ElementKind, EntryReference, Observation, Surface};
pub use workflows::{Workflow, WorkflowRegistry};
