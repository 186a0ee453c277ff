//! Router weight adapter.
//!
//! Turns lifecycle outcomes and trust scores into per-role routing weights
//! for the external dispatcher. Weights move by exponential smoothing so a
//! single experiment result cannot swing routing on its own.

use std::collections::{BTreeMap, BTreeSet};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::RouterConfig;
use crate::domain::{LifecycleState, Result};
use crate::federation::{ConvergentEntry, ReplicatedStore};
use crate::trust::TrustTier;

/// Federation key under which a role's bundle is published.
pub fn bundle_key(role: &str) -> String {
    format!("router/{role}")
}

/// Normalised routing weights for one role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightBundle {
    pub role: String,
    pub weights: BTreeMap<String, f64>,
}

impl WeightBundle {
    /// Scale weights to sum to 1.0. An all-zero bundle stays all zero.
    pub fn normalized(role: impl Into<String>, raw: BTreeMap<String, f64>) -> Self {
        let total: f64 = raw.values().filter(|w| **w > 0.0).sum();
        let weights = raw
            .into_iter()
            .map(|(k, w)| {
                let w = w.max(0.0);
                (k, if total > 0.0 { w / total } else { 0.0 })
            })
            .collect();
        Self {
            role: role.into(),
            weights,
        }
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Debug)]
pub struct RouterWeightAdapter {
    config: RouterConfig,
    /// role -> candidate -> raw (unnormalised) weight
    weights: DashMap<String, BTreeMap<String, f64>>,
    trust: DashMap<String, f64>,
    /// role -> candidates the policy gate has hard-denied
    denied: DashMap<String, BTreeSet<String>>,
}

impl RouterWeightAdapter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            weights: DashMap::new(),
            trust: DashMap::new(),
            denied: DashMap::new(),
        }
    }

    pub fn set_trust(&self, candidate: &str, trust_score: f64) {
        self.trust.insert(candidate.to_string(), trust_score.clamp(0.0, 1.0));
    }

    pub fn trust(&self, candidate: &str) -> Option<f64> {
        self.trust.get(candidate).map(|t| *t)
    }

    pub fn deny(&self, role: &str, candidate: &str) {
        self.denied
            .entry(role.to_string())
            .or_default()
            .insert(candidate.to_string());
    }

    pub fn allow(&self, role: &str, candidate: &str) {
        if let Some(mut set) = self.denied.get_mut(role) {
            set.remove(candidate);
        }
    }

    pub fn is_denied(&self, role: &str, candidate: &str) -> bool {
        self.denied
            .get(role)
            .is_some_and(|set| set.contains(candidate))
    }

    /// Blend `raw_score` with the candidate's trust tier.
    ///
    /// Monotonic in trust. A denied candidate always scores zero. Unknown
    /// candidates are treated as the lowest tier.
    pub fn apply_trust_modifier(&self, role: &str, candidate: &str, raw_score: f64) -> f64 {
        if self.is_denied(role, candidate) {
            return 0.0;
        }
        let tier = TrustTier::from_score(self.trust(candidate).unwrap_or(0.0));
        let beta = self.config.trust_blend;
        raw_score * ((1.0 - beta) + beta * tier.routing_modifier())
    }

    /// `new = old + alpha * (outcome - old)`; returns the new raw weight.
    pub fn update_weight(&self, role: &str, candidate: &str, outcome: f64) -> f64 {
        let mut role_weights = self.weights.entry(role.to_string()).or_default();
        let old = role_weights
            .get(candidate)
            .copied()
            .unwrap_or(self.config.initial_weight);
        let new = old + self.config.smoothing_alpha * (outcome.clamp(0.0, 1.0) - old);
        role_weights.insert(candidate.to_string(), new);
        tracing::debug!(role, candidate, old, new, "router weight updated");
        new
    }

    /// Feed a lifecycle state change. Returns the new weight when the state
    /// carries a routing signal.
    pub fn record_lifecycle_outcome(
        &self,
        role: &str,
        candidate: &str,
        state: LifecycleState,
    ) -> Option<f64> {
        let outcome = match state {
            LifecycleState::Promoted => 1.0,
            LifecycleState::Rejected | LifecycleState::RolledBack => 0.0,
            _ => return None,
        };
        Some(self.update_weight(role, candidate, outcome))
    }

    pub fn weight(&self, role: &str, candidate: &str) -> Option<f64> {
        self.weights.get(role)?.get(candidate).copied()
    }

    pub fn bundle(&self, role: &str) -> WeightBundle {
        let raw = self
            .weights
            .get(role)
            .map(|w| w.clone())
            .unwrap_or_default();
        WeightBundle::normalized(role, raw)
    }

    /// Write the role's normalised bundle into the federation store.
    pub fn publish(&self, role: &str, store: &ReplicatedStore) -> Result<ConvergentEntry> {
        let bundle = self.bundle(role);
        Ok(store.put(bundle_key(role), serde_json::to_value(&bundle)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> RouterWeightAdapter {
        RouterWeightAdapter::new(RouterConfig::default())
    }

    #[test]
    fn smoothing_from_initial_weight() {
        let r = adapter();
        // 0.1 + 0.2 * (1.0 - 0.1)
        let w = r.update_weight("summarize", "cap-a", 1.0);
        assert!((w - 0.28).abs() < 1e-12);
        let w = r.update_weight("summarize", "cap-a", 0.0);
        assert!((w - 0.224).abs() < 1e-12);
    }

    #[test]
    fn higher_trust_wins_at_equal_raw_score() {
        let r = adapter();
        r.set_trust("high", 0.9);
        r.set_trust("low", 0.3);
        let high = r.apply_trust_modifier("summarize", "high", 1.0);
        let low = r.apply_trust_modifier("summarize", "low", 1.0);
        assert!(high > low);
        assert!((high - 1.02).abs() < 1e-12);
        assert!((low - 0.9).abs() < 1e-12);
    }

    #[test]
    fn deny_overrides_trust() {
        let r = adapter();
        r.set_trust("cap", 1.0);
        r.deny("summarize", "cap");
        assert_eq!(r.apply_trust_modifier("summarize", "cap", 5.0), 0.0);
        // deny is role scoped
        assert!(r.apply_trust_modifier("translate", "cap", 5.0) > 0.0);
        r.allow("summarize", "cap");
        assert!(r.apply_trust_modifier("summarize", "cap", 5.0) > 0.0);
    }

    #[test]
    fn lifecycle_outcomes_map_to_targets() {
        let r = adapter();
        assert!(r
            .record_lifecycle_outcome("summarize", "cap", LifecycleState::Canary)
            .is_none());
        let up = r
            .record_lifecycle_outcome("summarize", "cap", LifecycleState::Promoted)
            .unwrap();
        let down = r
            .record_lifecycle_outcome("summarize", "cap", LifecycleState::RolledBack)
            .unwrap();
        assert!(down < up);
    }

    #[test]
    fn bundle_is_normalised() {
        let r = adapter();
        r.update_weight("summarize", "a", 1.0);
        r.update_weight("summarize", "b", 1.0);
        r.update_weight("summarize", "b", 1.0);
        let bundle = r.bundle("summarize");
        let total: f64 = bundle.weights.values().sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!(bundle.weights["b"] > bundle.weights["a"]);
    }

    #[test]
    fn publish_writes_role_key() {
        let r = adapter();
        r.update_weight("summarize", "a", 1.0);
        let store = ReplicatedStore::new("east");
        let entry = r.publish("summarize", &store).unwrap();
        assert_eq!(entry.key, "router/summarize");
        let bundle = WeightBundle::from_value(store.get("router/summarize").unwrap()).unwrap();
        assert_eq!(bundle.weights["a"], 1.0);
    }
}
