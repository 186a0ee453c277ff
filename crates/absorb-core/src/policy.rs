//! Policy gate seam.
//!
//! Policy lives outside the core. The lifecycle engine only assembles a
//! [`Facts`] map and asks a [`PolicyGate`] for a boolean decision; it never
//! interprets the facts itself.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::Result;

/// Named decisions the lifecycle asks the gate for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// `Quarantined -> Canary`
    AllowPromoteFromQuarantine,
    /// `Canary -> Promoted`
    AllowAutoAdopt,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::AllowPromoteFromQuarantine => "allow_promote_from_quarantine",
            Decision::AllowAutoAdopt => "allow_auto_adopt",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured, JSON-like fact mapping handed to the gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Facts(BTreeMap<String, Value>);

impl Facts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bool(mut self, key: impl Into<String>, value: bool) -> Self {
        self.0.insert(key.into(), Value::Bool(value));
        self
    }

    pub fn with_number(mut self, key: impl Into<String>, value: f64) -> Self {
        self.0.insert(key.into(), serde_json::json!(value));
        self
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.0.clone().into_iter().collect())
    }
}

/// External policy decision function. Must be side-effect free.
#[async_trait]
pub trait PolicyGate: Send + Sync {
    async fn decide(&self, decision: Decision, facts: &Facts) -> Result<bool>;
}

/// One row of a [`StaticPolicyGate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Boolean facts that must be present and `true`.
    pub require_true: Vec<String>,
    /// Upper bound on the numeric `risk` fact, inclusive.
    pub max_risk: Option<f64>,
}

impl PolicyRule {
    pub fn requiring<I, S>(facts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            require_true: facts.into_iter().map(Into::into).collect(),
            max_risk: None,
        }
    }

    pub fn with_max_risk(mut self, max_risk: f64) -> Self {
        self.max_risk = Some(max_risk);
        self
    }

    fn allows(&self, facts: &Facts) -> bool {
        let flags_ok = self
            .require_true
            .iter()
            .all(|key| facts.get_bool(key) == Some(true));
        let risk_ok = match self.max_risk {
            Some(bound) => facts.get_f64("risk").is_some_and(|risk| risk <= bound),
            None => true,
        };
        flags_ok && risk_ok
    }
}

/// Table-driven gate. Decisions without a rule are denied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticPolicyGate {
    pub rules: BTreeMap<Decision, PolicyRule>,
}

impl StaticPolicyGate {
    /// Every fact the lifecycle assembles must hold.
    pub fn standard() -> Self {
        Self::default()
            .with_rule(
                Decision::AllowPromoteFromQuarantine,
                PolicyRule::requiring(["ready_to_promote"]),
            )
            .with_rule(
                Decision::AllowAutoAdopt,
                PolicyRule::requiring(["signature_ok", "sbom_ok", "provenance_ok", "canary_passed"]),
            )
    }

    /// Allow everything, including decisions with no facts.
    pub fn permissive() -> Self {
        Self::default()
            .with_rule(Decision::AllowPromoteFromQuarantine, PolicyRule::requiring(Vec::<String>::new()))
            .with_rule(Decision::AllowAutoAdopt, PolicyRule::requiring(Vec::<String>::new()))
    }

    pub fn with_rule(mut self, decision: Decision, rule: PolicyRule) -> Self {
        self.rules.insert(decision, rule);
        self
    }
}

#[async_trait]
impl PolicyGate for StaticPolicyGate {
    async fn decide(&self, decision: Decision, facts: &Facts) -> Result<bool> {
        Ok(self
            .rules
            .get(&decision)
            .is_some_and(|rule| rule.allows(facts)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn standard_gate_requires_every_flag() {
        let gate = StaticPolicyGate::standard();
        let all = Facts::new()
            .with_bool("signature_ok", true)
            .with_bool("sbom_ok", true)
            .with_bool("provenance_ok", true)
            .with_bool("canary_passed", true);
        assert!(gate.decide(Decision::AllowAutoAdopt, &all).await.unwrap());

        let missing = all.clone().with_bool("canary_passed", false);
        assert!(!gate.decide(Decision::AllowAutoAdopt, &missing).await.unwrap());
    }

    #[tokio::test]
    async fn risk_bound_is_inclusive() {
        let gate = StaticPolicyGate::default().with_rule(
            Decision::AllowPromoteFromQuarantine,
            PolicyRule::requiring(["ready_to_promote"]).with_max_risk(0.5),
        );
        let facts = Facts::new().with_bool("ready_to_promote", true);
        // risk fact absent
        assert!(!gate
            .decide(Decision::AllowPromoteFromQuarantine, &facts)
            .await
            .unwrap());
        let at_bound = facts.clone().with_number("risk", 0.5);
        assert!(gate
            .decide(Decision::AllowPromoteFromQuarantine, &at_bound)
            .await
            .unwrap());
        let above = facts.with_number("risk", 0.51);
        assert!(!gate
            .decide(Decision::AllowPromoteFromQuarantine, &above)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn unknown_decision_is_denied() {
        let gate = StaticPolicyGate::default();
        assert!(!gate
            .decide(Decision::AllowAutoAdopt, &Facts::new())
            .await
            .unwrap());
    }

    #[test]
    fn facts_serialize_as_flat_object() {
        let facts = Facts::new().with_bool("sbom_ok", true).with_number("risk", 0.25);
        assert_eq!(
            serde_json::to_value(&facts).unwrap(),
            serde_json::json!({"risk": 0.25, "sbom_ok": true})
        );
    }
}
