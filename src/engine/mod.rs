mod action;
mod generated;
pub mod rule;

pub use action::{ActionDispatcher, ActionExecutor};
pub use generated::{AutoRuleGenerator, EVENT_OCCURRENCE_ACTION};
pub use rule::{IndexedRule, RuleEngine, RULE_QUERY_PREFIX};
