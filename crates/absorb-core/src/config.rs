//! Governance configuration.
//!
//! Every knob has a documented default so an empty TOML file is a valid
//! configuration. Load with [`GovernanceConfig::load`] and call
//! [`GovernanceConfig::validate`] before handing it to the engine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{GovernanceError, Result};

/// Statistical thresholds for the experiment evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Below this many samples in either arm the verdict is `Insufficient`.
    pub min_samples_per_arm: usize,
    /// Two-sided p-value must be strictly below this to promote.
    pub significance_threshold: f64,
    /// Confidence level of the bootstrap interval.
    pub confidence_level: f64,
    pub bootstrap_resamples: usize,
    /// Fixed seed for reproducible intervals; `None` draws from OS entropy.
    pub bootstrap_seed: Option<u64>,
    /// Maximum allowed mean cost increase of variant over control.
    pub cost_ceiling: f64,
    /// Point-estimate uplift below `-demotion_margin` demotes.
    pub demotion_margin: f64,
    /// Raise the per-arm minimum for domains whose scores are noisy.
    pub adaptive_sampling: bool,
    /// Domain score variance is multiplied by this to scale the minimum.
    pub variance_scale: f64,
    /// Ceiling on the adaptive per-arm minimum.
    pub max_samples_per_arm: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            min_samples_per_arm: 10,
            significance_threshold: 0.05,
            confidence_level: 0.95,
            bootstrap_resamples: 2000,
            bootstrap_seed: Some(1337),
            cost_ceiling: 0.10,
            demotion_margin: 0.02,
            adaptive_sampling: false,
            variance_scale: 50.0,
            max_samples_per_arm: 500,
        }
    }
}

/// Trial gating parameters for the lifecycle state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Variant samples needed before leaving shadow trial.
    pub min_shadow_samples: usize,
    /// Share of live traffic a quarantined capability receives.
    pub quarantine_canary_rate: f64,
    /// Share of live traffic on entry to canary.
    pub initial_canary_fraction: f64,
    /// Pass/fail outcomes needed before quarantine readiness is judged.
    pub min_quarantine_outcomes: u64,
    /// Pass/fail outcomes needed before the canary counts as passed.
    pub min_canary_outcomes: u64,
    pub min_success_ratio: f64,
    pub max_failure_ratio: f64,
    /// Canary without promotion for this long is rejected.
    pub canary_timeout_secs: u64,
    /// Canary outcomes allowed before the budget is exhausted.
    pub canary_sample_budget: u64,
    /// Smoothing step applied to trust on promotion.
    pub trust_gain: f64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            min_shadow_samples: 20,
            quarantine_canary_rate: 0.02,
            initial_canary_fraction: 0.10,
            min_quarantine_outcomes: 20,
            min_canary_outcomes: 20,
            min_success_ratio: 0.90,
            max_failure_ratio: 0.10,
            canary_timeout_secs: 24 * 60 * 60,
            canary_sample_budget: 1000,
            trust_gain: 0.1,
        }
    }
}

impl LifecycleConfig {
    pub fn canary_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.canary_timeout_secs as i64)
    }
}

/// Staged blast-radius reduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Effective traffic share per stage, non-increasing.
    pub stage_fractions: Vec<f64>,
    pub stage_interval_secs: u64,
    /// Re-trial is refused for this long after a rollback completes.
    pub cooldown_secs: u64,
    /// Trust is multiplied by `1 - trust_penalty` on rollback.
    pub trust_penalty: f64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            stage_fractions: vec![1.0, 0.5, 0.25, 0.0],
            stage_interval_secs: 120,
            cooldown_secs: 60 * 60,
            trust_penalty: 0.25,
        }
    }
}

impl RollbackConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }
}

/// Router weight adaptation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Exponential smoothing factor for weight updates.
    pub smoothing_alpha: f64,
    /// Weight given to a candidate the role has never seen.
    pub initial_weight: f64,
    /// How strongly the trust tier bends the raw routing score.
    pub trust_blend: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            smoothing_alpha: 0.2,
            initial_weight: 0.1,
            trust_blend: 0.2,
        }
    }
}

/// Periodic adaptation loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlLoopConfig {
    pub interval_secs: u64,
    /// Maximum adaptation actions in flight at once.
    pub max_concurrency: usize,
    pub action_timeout_ms: u64,
    /// Consecutive timeouts after which a trial is forced to `Rejected`.
    pub max_consecutive_timeouts: u32,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_concurrency: 4,
            action_timeout_ms: 10_000,
            max_consecutive_timeouts: 3,
        }
    }
}

impl ControlLoopConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }
}

/// Cross-cluster convergence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Tie-breaker identity of this replica; must be unique per cluster.
    pub replica_id: String,
    /// z-score beyond which a cluster's mean score counts as drift.
    pub drift_z_threshold: f64,
    /// Cluster samples kept by the aggregator; the oldest are dropped first.
    pub aggregator_capacity: usize,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            replica_id: "local".to_string(),
            drift_z_threshold: 2.5,
            aggregator_capacity: 10_000,
        }
    }
}

/// Log output settings consumed by [`crate::telemetry::init_tracing`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub json: bool,
    pub level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json: false,
            level: "info".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub evaluator: EvaluatorConfig,
    pub lifecycle: LifecycleConfig,
    pub rollback: RollbackConfig,
    pub router: RouterConfig,
    pub control_loop: ControlLoopConfig,
    pub federation: FederationConfig,
    pub telemetry: TelemetryConfig,
}

fn unit_interval(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(GovernanceError::InvalidConfig(format!(
            "{name} must be within 0.0..=1.0, got {value}"
        )));
    }
    Ok(())
}

fn non_negative(name: &str, value: f64) -> Result<()> {
    if !(value.is_finite() && value >= 0.0) {
        return Err(GovernanceError::InvalidConfig(format!(
            "{name} must be a finite non-negative number, got {value}"
        )));
    }
    Ok(())
}

fn positive(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(GovernanceError::InvalidConfig(format!(
            "{name} must be greater than zero"
        )));
    }
    Ok(())
}

impl GovernanceConfig {
    /// Parse a TOML document. Missing sections and fields take their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the state machine or statistics ill-defined.
    pub fn validate(&self) -> Result<()> {
        let ev = &self.evaluator;
        if ev.min_samples_per_arm < 2 {
            return Err(GovernanceError::InvalidConfig(
                "evaluator.min_samples_per_arm must be at least 2".to_string(),
            ));
        }
        if !(ev.confidence_level > 0.0 && ev.confidence_level < 1.0) {
            return Err(GovernanceError::InvalidConfig(format!(
                "evaluator.confidence_level must be within (0, 1), got {}",
                ev.confidence_level
            )));
        }
        unit_interval("evaluator.significance_threshold", ev.significance_threshold)?;
        positive("evaluator.bootstrap_resamples", ev.bootstrap_resamples as u64)?;
        non_negative("evaluator.demotion_margin", ev.demotion_margin)?;
        if !ev.cost_ceiling.is_finite() {
            return Err(GovernanceError::InvalidConfig(format!(
                "evaluator.cost_ceiling must be finite, got {}",
                ev.cost_ceiling
            )));
        }
        non_negative("evaluator.variance_scale", ev.variance_scale)?;
        if ev.max_samples_per_arm < ev.min_samples_per_arm {
            return Err(GovernanceError::InvalidConfig(
                "evaluator.max_samples_per_arm must be at least min_samples_per_arm".to_string(),
            ));
        }

        let lc = &self.lifecycle;
        unit_interval("lifecycle.quarantine_canary_rate", lc.quarantine_canary_rate)?;
        unit_interval("lifecycle.initial_canary_fraction", lc.initial_canary_fraction)?;
        unit_interval("lifecycle.min_success_ratio", lc.min_success_ratio)?;
        unit_interval("lifecycle.max_failure_ratio", lc.max_failure_ratio)?;
        unit_interval("lifecycle.trust_gain", lc.trust_gain)?;
        positive("lifecycle.canary_timeout_secs", lc.canary_timeout_secs)?;
        positive("lifecycle.canary_sample_budget", lc.canary_sample_budget)?;
        if lc.canary_sample_budget < lc.min_canary_outcomes {
            return Err(GovernanceError::InvalidConfig(format!(
                "lifecycle.canary_sample_budget ({}) must cover min_canary_outcomes ({})",
                lc.canary_sample_budget, lc.min_canary_outcomes
            )));
        }

        crate::rollback::validate_stages(&self.rollback.stage_fractions)?;
        positive("rollback.stage_interval_secs", self.rollback.stage_interval_secs)?;
        unit_interval("rollback.trust_penalty", self.rollback.trust_penalty)?;

        unit_interval("router.smoothing_alpha", self.router.smoothing_alpha)?;
        unit_interval("router.trust_blend", self.router.trust_blend)?;

        let cl = &self.control_loop;
        positive("control_loop.interval_secs", cl.interval_secs)?;
        positive("control_loop.max_concurrency", cl.max_concurrency as u64)?;
        positive("control_loop.action_timeout_ms", cl.action_timeout_ms)?;
        positive(
            "control_loop.max_consecutive_timeouts",
            cl.max_consecutive_timeouts as u64,
        )?;

        let fed = &self.federation;
        if fed.replica_id.trim().is_empty() {
            return Err(GovernanceError::InvalidConfig(
                "federation.replica_id must not be empty".to_string(),
            ));
        }
        if !(fed.drift_z_threshold.is_finite() && fed.drift_z_threshold > 0.0) {
            return Err(GovernanceError::InvalidConfig(format!(
                "federation.drift_z_threshold must be positive, got {}",
                fed.drift_z_threshold
            )));
        }
        positive("federation.aggregator_capacity", fed.aggregator_capacity as u64)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        GovernanceConfig::default().validate().unwrap();
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config = GovernanceConfig::from_toml_str("").unwrap();
        assert_eq!(config, GovernanceConfig::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = GovernanceConfig::from_toml_str(
            r#"
            [evaluator]
            significance_threshold = 0.01

            [rollback]
            stage_fractions = [1.0, 0.2, 0.0]
            "#,
        )
        .unwrap();
        assert_eq!(config.evaluator.significance_threshold, 0.01);
        assert_eq!(config.evaluator.bootstrap_resamples, 2000);
        assert_eq!(config.rollback.stage_fractions, vec![1.0, 0.2, 0.0]);
        assert_eq!(config.rollback.stage_interval_secs, 120);
        config.validate().unwrap();
    }

    #[test]
    fn test_increasing_stages_rejected() {
        let mut config = GovernanceConfig::default();
        config.rollback.stage_fractions = vec![0.5, 1.0];
        assert!(matches!(
            config.validate(),
            Err(GovernanceError::InvalidRollbackPlan(_))
        ));
    }

    #[test]
    fn test_out_of_range_fraction_rejected() {
        let mut config = GovernanceConfig::default();
        config.lifecycle.initial_canary_fraction = 1.5;
        assert!(matches!(
            config.validate(),
            Err(GovernanceError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_canary_budget_must_be_positive_and_cover_minimum() {
        let mut config = GovernanceConfig::default();
        config.lifecycle.canary_sample_budget = 0;
        assert!(matches!(
            config.validate(),
            Err(GovernanceError::InvalidConfig(msg)) if msg.contains("canary_sample_budget")
        ));

        config.lifecycle.canary_sample_budget = 10;
        assert!(config.validate().is_err(), "budget below min_canary_outcomes");

        config.lifecycle.canary_sample_budget = 20;
        config.validate().unwrap();
    }

    #[test]
    fn test_negative_demotion_margin_rejected() {
        let config = GovernanceConfig::from_toml_str("[evaluator]\ndemotion_margin = -0.01\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(GovernanceError::InvalidConfig(msg)) if msg.contains("demotion_margin")
        ));

        let mut config = GovernanceConfig::default();
        config.evaluator.demotion_margin = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_federation_knobs_validated() {
        let mut config = GovernanceConfig::default();
        config.federation.drift_z_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = GovernanceConfig::default();
        config.federation.aggregator_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absorb.toml");
        std::fs::write(&path, "[control_loop]\nmax_concurrency = 8\n").unwrap();
        let config = GovernanceConfig::load(&path).unwrap();
        assert_eq!(config.control_loop.max_concurrency, 8);
    }
}
