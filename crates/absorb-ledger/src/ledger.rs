//! Outcome ledger trait and sample types.
//!
//! Guarantees every implementation must uphold:
//! - `record` fails only when the arm was never opened or the sample carries
//!   a non-finite value; a rejected sample is never written.
//! - `read` returns samples in insertion order and can be replayed from the
//!   start any number of times.
//! - There is no way to delete or rewrite a sample.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Result type for ledger operations
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Identity of one experiment arm (e.g. `cap-42` / `variant`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArmId {
    pub experiment: String,
    pub arm: String,
}

impl ArmId {
    pub fn new(experiment: impl Into<String>, arm: impl Into<String>) -> Self {
        Self {
            experiment: experiment.into(),
            arm: arm.into(),
        }
    }
}

impl std::fmt::Display for ArmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.experiment, self.arm)
    }
}

/// One observed outcome. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Quality score reported by the evaluator of the request
    pub score: f64,
    /// Cost of serving the request
    pub cost: f64,
    /// Latency in milliseconds
    pub latency_ms: f64,
    /// Domain tag used for stratified resampling
    pub domain: String,
    /// When the outcome was observed
    pub recorded_at: DateTime<Utc>,
}

impl Sample {
    pub fn new(score: f64, cost: f64, latency_ms: f64, domain: impl Into<String>) -> Self {
        Self {
            score,
            cost,
            latency_ms,
            domain: domain.into(),
            recorded_at: Utc::now(),
        }
    }

    /// Reject NaN and infinite measurements. They have no JSON encoding and
    /// would poison every later read of the arm.
    pub fn validate(&self) -> LedgerResult<()> {
        let fields = [
            ("score", self.score),
            ("cost", self.cost),
            ("latency_ms", self.latency_ms),
        ];
        match fields.iter().find(|(_, v)| !v.is_finite()) {
            Some(&(field, value)) => Err(LedgerError::InvalidSample { field, value }),
            None => Ok(()),
        }
    }

    /// Override the observation timestamp (replay, federation import).
    pub fn at(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.recorded_at = recorded_at;
        self
    }
}

/// Append-only per-arm sample store.
#[async_trait]
pub trait OutcomeLedger: Send + Sync {
    /// Register an arm. Opening an existing arm is a no-op.
    async fn open_arm(&self, experiment: &str, arm: &str) -> LedgerResult<ArmId>;

    /// Append a sample, returning the arm's new sample count.
    async fn record(&self, arm: &ArmId, sample: Sample) -> LedgerResult<usize>;

    /// All samples for an arm in insertion order.
    async fn read(&self, arm: &ArmId) -> LedgerResult<Vec<Sample>>;

    /// Number of samples recorded against an arm.
    async fn len(&self, arm: &ArmId) -> LedgerResult<usize>;

    /// Arms registered under an experiment, sorted by arm name.
    async fn arms(&self, experiment: &str) -> LedgerResult<Vec<ArmId>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_id_display_joins_experiment_and_arm() {
        let id = ArmId::new("cap-1", "variant");
        assert_eq!(id.to_string(), "cap-1/variant");
    }

    #[test]
    fn sample_at_overrides_timestamp() {
        let ts = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let sample = Sample::new(0.9, 0.01, 120.0, "code").at(ts);
        assert_eq!(sample.recorded_at, ts);
        assert_eq!(sample.domain, "code");
    }

    #[test]
    fn non_finite_fields_fail_validation() {
        assert!(Sample::new(0.5, 0.1, 20.0, "code").validate().is_ok());
        let err = Sample::new(0.5, f64::NAN, 20.0, "code").validate().unwrap_err();
        assert!(matches!(err, LedgerError::InvalidSample { field: "cost", .. }));
        assert!(Sample::new(f64::NEG_INFINITY, 0.1, 20.0, "code").validate().is_err());
    }
}
