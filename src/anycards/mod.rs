//! Anycards: the subjects the redeem workflows act on.

pub mod hooks;
pub mod model;
pub mod routes;

pub use hooks::AnycardTaskHooks;
pub use model::{Anycard, AnycardInput, AnycardType, parse_balance};
