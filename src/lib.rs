//! Gift-card bridge: task dispatch for browser-driven redeem workflows.

pub mod agent;
pub mod anycards;
pub mod config;
pub mod error;
pub mod store;
pub mod supervisor;
pub mod tasks;
