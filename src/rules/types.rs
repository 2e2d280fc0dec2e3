//! Rule model
//!
//! Rules are configurable at runtime through the admin API and seeded from
//! config at boot. Evaluation order across sets is fixed (ECONOMIC ->
//! NON_ECONOMIC -> WORKFLOW); within a set, priority ascending with id as
//! tiebreak.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    Economic,
    NonEconomic,
    Workflow,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Economic => "ECONOMIC",
            RuleType::NonEconomic => "NON_ECONOMIC",
            RuleType::Workflow => "WORKFLOW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "economic" | "ECONOMIC" => Some(RuleType::Economic),
            "non-economic" | "non_economic" | "NON_ECONOMIC" => Some(RuleType::NonEconomic),
            "workflow" | "WORKFLOW" => Some(RuleType::Workflow),
            _ => None,
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Value is an array; matches when the field value is an element
    In,
    /// Substring match on strings, element match on arrays
    Contains,
}

/// One criterion; all criteria of a rule must match (AND)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub field: String,
    pub operator: Operator,
    pub value: serde_json::Value,
}

/// One target-setter applied when the rule matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    pub target: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub rule_type: RuleType,
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub criteria: Vec<Criterion>,
    pub actions: Vec<RuleAction>,
    #[serde(default)]
    pub version: i64,
}

fn default_enabled() -> bool {
    true
}

/// Immutable, pre-sorted view taken by each evaluation.
///
/// Concurrent evaluations snapshot this; admin mutations swap in a new one
/// and never break an evaluation mid-flight.
#[derive(Debug, Default)]
pub struct RuleSet {
    pub economic: Vec<Rule>,
    pub non_economic: Vec<Rule>,
    pub workflow: Vec<Rule>,
}

impl RuleSet {
    /// Build from an unordered rule collection: enabled rules only, each set
    /// sorted by (priority, id).
    pub fn build(rules: impl IntoIterator<Item = Rule>) -> Self {
        let mut set = RuleSet::default();
        for rule in rules {
            if !rule.enabled {
                continue;
            }
            match rule.rule_type {
                RuleType::Economic => set.economic.push(rule),
                RuleType::NonEconomic => set.non_economic.push(rule),
                RuleType::Workflow => set.workflow.push(rule),
            }
        }
        for bucket in [&mut set.economic, &mut set.non_economic, &mut set.workflow] {
            bucket.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        }
        set
    }

    pub fn len(&self) -> usize {
        self.economic.len() + self.non_economic.len() + self.workflow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, rule_type: RuleType, priority: i32) -> Rule {
        Rule {
            id: id.into(),
            rule_type,
            priority,
            enabled: true,
            criteria: Vec::new(),
            actions: Vec::new(),
            version: 1,
        }
    }

    #[test]
    fn test_build_sorts_by_priority_then_id() {
        let set = RuleSet::build(vec![
            rule("b", RuleType::Workflow, 5),
            rule("a", RuleType::Workflow, 5),
            rule("z", RuleType::Workflow, 1),
        ]);
        let ids: Vec<_> = set.workflow.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a", "b"]);
    }

    #[test]
    fn test_disabled_rules_excluded() {
        let mut disabled = rule("d", RuleType::Economic, 1);
        disabled.enabled = false;
        let set = RuleSet::build(vec![disabled, rule("e", RuleType::Economic, 1)]);
        assert_eq!(set.economic.len(), 1);
    }

    #[test]
    fn test_rule_type_parse_accepts_api_path_forms() {
        assert_eq!(RuleType::parse("economic"), Some(RuleType::Economic));
        assert_eq!(RuleType::parse("non-economic"), Some(RuleType::NonEconomic));
        assert_eq!(RuleType::parse("workflow"), Some(RuleType::Workflow));
        assert_eq!(RuleType::parse("bogus"), None);
    }
}
