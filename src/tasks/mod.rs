//! Tasks: the durable unit of automation work, its dispatch queue, and its HTTP surface.

pub mod api;
pub mod hooks;
pub mod model;
pub mod queue;

pub use model::{Task, TaskEvent, TaskStatus, TaskType};
pub use queue::DispatchQueue;
