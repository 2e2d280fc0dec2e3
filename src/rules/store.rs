//! Rule store
//!
//! Config rules are the boot-time seed; API-managed rules shadow them by id.
//! Readers take an ArcSwap snapshot so admin mutations never break an
//! evaluation mid-flight.

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

use super::types::{Rule, RuleSet};
use crate::error::CaptureError;

#[derive(Default)]
struct StoreInner {
    seed: FxHashMap<String, Rule>,
    api: FxHashMap<String, Rule>,
}

impl StoreInner {
    fn effective(&self) -> RuleSet {
        let mut merged: FxHashMap<&str, &Rule> = FxHashMap::default();
        for rule in self.seed.values() {
            merged.insert(rule.id.as_str(), rule);
        }
        for rule in self.api.values() {
            merged.insert(rule.id.as_str(), rule);
        }
        RuleSet::build(merged.into_values().cloned())
    }
}

pub struct RuleStore {
    inner: Mutex<StoreInner>,
    snapshot: ArcSwap<RuleSet>,
}

impl RuleStore {
    pub fn new(seed: Vec<Rule>) -> Self {
        let mut inner = StoreInner::default();
        for rule in seed {
            inner.seed.insert(rule.id.clone(), rule);
        }
        let snapshot = inner.effective();
        info!(rules = snapshot.len(), "Rule store seeded");
        Self {
            inner: Mutex::new(inner),
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Snapshot for one evaluation pass
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.snapshot.load_full()
    }

    /// Add or replace an API-managed rule. Shadows a seed rule of the same
    /// id until deleted.
    pub fn upsert(&self, mut rule: Rule) -> Result<i64, CaptureError> {
        if rule.id.is_empty() {
            return Err(CaptureError::Validation("rule id must not be empty".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        rule.version = inner
            .api
            .get(&rule.id)
            .map(|prev| prev.version + 1)
            .unwrap_or(1);
        let version = rule.version;
        info!(rule_id = %rule.id, rule_type = %rule.rule_type, version, "Rule upserted");
        inner.api.insert(rule.id.clone(), rule);
        self.snapshot.store(Arc::new(inner.effective()));
        Ok(version)
    }

    /// Delete an API-managed rule. A shadowed seed rule of the same id comes
    /// back into effect.
    pub fn delete(&self, id: &str) -> Result<(), CaptureError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.api.remove(id).is_none() {
            return Err(CaptureError::Validation(format!("no API-managed rule {}", id)));
        }
        info!(rule_id = %id, "Rule deleted");
        self.snapshot.store(Arc::new(inner.effective()));
        Ok(())
    }

    pub fn rule_count(&self) -> usize {
        self.snapshot.load().len()
    }
}

/// Standard boot seed used when the config carries no rules: manual trades
/// require approval, automated trades flow straight through.
pub fn default_seed() -> Vec<Rule> {
    use super::types::{Criterion, Operator, RuleAction, RuleType};
    vec![Rule {
        id: "wf-manual-approval".into(),
        rule_type: RuleType::Workflow,
        priority: 10,
        enabled: true,
        criteria: vec![Criterion {
            field: "source".into(),
            operator: Operator::Eq,
            value: serde_json::json!("MANUAL"),
        }],
        actions: vec![RuleAction {
            target: "workflowStatus".into(),
            value: serde_json::json!("PENDING_APPROVAL"),
        }],
        version: 1,
    }]
}
