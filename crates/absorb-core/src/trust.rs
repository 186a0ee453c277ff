//! Trust scoring.
//!
//! Discovery trust comes from the supply-chain score of the integrity
//! report. Afterwards only the lifecycle moves it: promotions smooth it
//! toward 1.0, completed rollbacks multiply it down.

use serde::{Deserialize, Serialize};

use crate::domain::Severity;
use crate::integrity::IntegrityReport;

const SBOM_WEIGHT: f64 = 0.25;
const PROVENANCE_WEIGHT: f64 = 0.25;
const SIGNATURE_WEIGHT: f64 = 0.25;
const TRANSPARENCY_LOG_WEIGHT: f64 = 0.15;

impl Severity {
    pub fn penalty(self) -> f64 {
        match self {
            Severity::None => 0.0,
            Severity::Low => 0.05,
            Severity::Medium => 0.10,
            Severity::High => 0.20,
            Severity::Critical => 0.35,
        }
    }
}

/// Weighted attestation score minus the vulnerability penalty, in `[0, 1]`,
/// rounded to three decimals.
pub fn supply_chain_score(report: &IntegrityReport, max_vuln_severity: Severity) -> f64 {
    let flag = |ok: bool, weight: f64| if ok { weight } else { 0.0 };
    let raw = flag(report.sbom_ok, SBOM_WEIGHT)
        + flag(report.provenance_ok, PROVENANCE_WEIGHT)
        + flag(report.signature_ok, SIGNATURE_WEIGHT)
        + flag(report.transparency_log_ok, TRANSPARENCY_LOG_WEIGHT)
        - max_vuln_severity.penalty();
    (raw.clamp(0.0, 1.0) * 1000.0).round() / 1000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrustTier {
    A,
    B,
    C,
    D,
}

impl TrustTier {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.85 {
            TrustTier::A
        } else if score >= 0.70 {
            TrustTier::B
        } else if score >= 0.50 {
            TrustTier::C
        } else {
            TrustTier::D
        }
    }

    /// Multiplier applied to raw routing scores. Monotonic in tier.
    pub fn routing_modifier(self) -> f64 {
        match self {
            TrustTier::A => 1.1,
            TrustTier::B => 1.0,
            TrustTier::C => 0.8,
            TrustTier::D => 0.5,
        }
    }
}

/// Exponential step toward full trust.
pub fn promote_trust(current: f64, gain: f64) -> f64 {
    (current + gain * (1.0 - current)).clamp(0.0, 1.0)
}

/// Multiplicative penalty; strictly lowers any positive trust score.
pub fn penalize_trust(current: f64, penalty: f64) -> f64 {
    (current * (1.0 - penalty)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(sig: bool, sbom: bool, prov: bool, tlog: bool) -> IntegrityReport {
        IntegrityReport {
            digest_ok: true,
            signature_ok: sig,
            sbom_ok: sbom,
            provenance_ok: prov,
            transparency_log_ok: tlog,
        }
    }

    #[test]
    fn full_attestation_scores_point_nine() {
        let score = supply_chain_score(&report(true, true, true, true), Severity::None);
        assert_eq!(score, 0.9);
        assert_eq!(TrustTier::from_score(score), TrustTier::A);
    }

    #[test]
    fn severity_penalty_applies() {
        let score = supply_chain_score(&report(true, true, true, true), Severity::High);
        assert_eq!(score, 0.7);
        assert_eq!(TrustTier::from_score(score), TrustTier::B);
        let floor = supply_chain_score(&report(false, false, false, false), Severity::Critical);
        assert_eq!(floor, 0.0);
    }

    #[test]
    fn tier_boundaries() {
        assert_eq!(TrustTier::from_score(0.85), TrustTier::A);
        assert_eq!(TrustTier::from_score(0.8499), TrustTier::B);
        assert_eq!(TrustTier::from_score(0.5), TrustTier::C);
        assert_eq!(TrustTier::from_score(0.49), TrustTier::D);
    }

    #[test]
    fn penalty_strictly_lowers_positive_trust() {
        let before = 0.8;
        let after = penalize_trust(before, 0.25);
        assert!(after < before);
        assert!((after - 0.6).abs() < 1e-12);
    }

    #[test]
    fn promotion_approaches_one() {
        let mut trust = 0.5;
        for _ in 0..50 {
            trust = promote_trust(trust, 0.1);
        }
        assert!(trust > 0.99 && trust <= 1.0);
    }
}
