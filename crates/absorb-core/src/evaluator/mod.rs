//! Experiment evaluator.
//!
//! Summarises a control arm against a variant arm: uplift point estimate,
//! Welch's t-test p-value, a stratified bootstrap interval, and cost/latency
//! deltas. Results are derived on demand and never stored.

pub mod bootstrap;
pub mod sampler;
pub mod stats;

use std::sync::Arc;

use absorb_ledger::{ArmId, OutcomeLedger, Sample};
use serde::{Deserialize, Serialize};

use crate::config::EvaluatorConfig;
use crate::domain::Result;

pub use bootstrap::{stratified_bootstrap, BootstrapInterval};
pub use sampler::required_samples;
pub use stats::{welch_t_test, WelchTest};

/// Summary statistics of variant vs control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub control_n: usize,
    pub variant_n: usize,
    /// mean(variant.score) - mean(control.score)
    pub uplift: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub p_value: f64,
    pub t_statistic: f64,
    pub degrees_of_freedom: f64,
    pub cost_delta: f64,
    pub latency_delta_ms: f64,
}

impl EvaluationResult {
    pub fn sample_count(&self) -> usize {
        self.control_n + self.variant_n
    }
}

/// Outcome of [`ExperimentEvaluator::summarize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Evaluation {
    /// One arm has fewer than the required samples: the configured minimum,
    /// raised for noisy domains when adaptive sampling is on.
    Insufficient {
        control_n: usize,
        variant_n: usize,
        required: usize,
    },
    Ready(EvaluationResult),
}

impl Evaluation {
    pub fn is_insufficient(&self) -> bool {
        matches!(self, Evaluation::Insufficient { .. })
    }

    pub fn result(&self) -> Option<&EvaluationResult> {
        match self {
            Evaluation::Ready(result) => Some(result),
            Evaluation::Insufficient { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Insufficient,
    Promote,
    Demote,
    Hold,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Verdict::Insufficient => "insufficient",
            Verdict::Promote => "promote",
            Verdict::Demote => "demote",
            Verdict::Hold => "hold",
        };
        f.write_str(s)
    }
}

impl EvaluatorConfig {
    /// Conservative promotion test: the whole interval must clear zero.
    pub fn is_promotable(&self, result: &EvaluationResult) -> bool {
        result.ci_lower > 0.0
            && result.p_value < self.significance_threshold
            && result.cost_delta <= self.cost_ceiling
    }

    pub fn is_demotable(&self, result: &EvaluationResult) -> bool {
        result.uplift < -self.demotion_margin
    }

    pub fn verdict(&self, evaluation: &Evaluation) -> Verdict {
        match evaluation {
            Evaluation::Insufficient { .. } => Verdict::Insufficient,
            Evaluation::Ready(result) if self.is_promotable(result) => Verdict::Promote,
            Evaluation::Ready(result) if self.is_demotable(result) => Verdict::Demote,
            Evaluation::Ready(_) => Verdict::Hold,
        }
    }
}

/// Per-arm sample counts marking the start of an evaluation window.
///
/// Samples before these positions belong to an earlier trial and are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmOffsets {
    pub control: usize,
    pub variant: usize,
}

/// Pure summary over in-memory samples.
pub fn summarize_samples(
    config: &EvaluatorConfig,
    control: &[Sample],
    variant: &[Sample],
) -> Evaluation {
    let required = sampler::required_samples(config, control)
        .max(sampler::required_samples(config, variant));
    if control.len() < required || variant.len() < required {
        return Evaluation::Insufficient {
            control_n: control.len(),
            variant_n: variant.len(),
            required,
        };
    }

    let scores = |xs: &[Sample]| xs.iter().map(|s| s.score).collect::<Vec<_>>();
    let costs = |xs: &[Sample]| xs.iter().map(|s| s.cost).collect::<Vec<_>>();
    let latencies = |xs: &[Sample]| xs.iter().map(|s| s.latency_ms).collect::<Vec<_>>();

    let (control_scores, variant_scores) = (scores(control), scores(variant));
    let welch = welch_t_test(&control_scores, &variant_scores);
    let interval = stratified_bootstrap(
        control,
        variant,
        config.bootstrap_resamples,
        config.confidence_level,
        config.bootstrap_seed,
    );

    Evaluation::Ready(EvaluationResult {
        control_n: control.len(),
        variant_n: variant.len(),
        uplift: stats::mean(&variant_scores) - stats::mean(&control_scores),
        ci_lower: interval.lower,
        ci_upper: interval.upper,
        p_value: welch.p_value,
        t_statistic: welch.t_statistic,
        degrees_of_freedom: welch.degrees_of_freedom,
        cost_delta: stats::mean(&costs(variant)) - stats::mean(&costs(control)),
        latency_delta_ms: stats::mean(&latencies(variant)) - stats::mean(&latencies(control)),
    })
}

/// Reads arms from the ledger and summarises them.
#[derive(Clone)]
pub struct ExperimentEvaluator {
    config: EvaluatorConfig,
    ledger: Arc<dyn OutcomeLedger>,
}

impl ExperimentEvaluator {
    pub fn new(config: EvaluatorConfig, ledger: Arc<dyn OutcomeLedger>) -> Self {
        Self { config, ledger }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    pub async fn summarize(&self, control: &ArmId, variant: &ArmId) -> Result<Evaluation> {
        self.summarize_since(control, variant, ArmOffsets::default())
            .await
    }

    /// Summarise only the samples recorded after `offsets`.
    pub async fn summarize_since(
        &self,
        control: &ArmId,
        variant: &ArmId,
        offsets: ArmOffsets,
    ) -> Result<Evaluation> {
        let control_samples = self.ledger.read(control).await?;
        let variant_samples = self.ledger.read(variant).await?;
        let tail = |xs: &[Sample], from: usize| xs.get(from..).unwrap_or_default().to_vec();
        Ok(summarize_samples(
            &self.config,
            &tail(&control_samples, offsets.control),
            &tail(&variant_samples, offsets.variant),
        ))
    }
}
