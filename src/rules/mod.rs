//! Rules engine
//!
//! Ordered evaluation of economic, non-economic, and workflow rule sets over
//! the request and the working blotter.

mod engine;
mod store;
mod types;

pub use engine::evaluate;
pub use store::{RuleStore, default_seed};
pub use types::{Criterion, Operator, Rule, RuleAction, RuleSet, RuleType};
