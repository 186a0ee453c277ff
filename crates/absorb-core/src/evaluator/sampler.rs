//! Variance-adaptive sample requirements.
//!
//! A domain whose scores swing widely needs more samples before its mean can
//! be trusted. The requirement for a domain is `base * max(1, var * scale)`
//! using the population variance of that domain's scores; a domain with a
//! single observation assumes a variance of 0.1.

use std::collections::BTreeMap;

use absorb_ledger::Sample;

use super::stats;
use crate::config::EvaluatorConfig;

const SINGLE_SAMPLE_VARIANCE: f64 = 0.1;

/// Samples required for one domain given its observed scores.
pub fn required_for_domain(base: usize, scores: &[f64], variance_scale: f64) -> usize {
    if scores.is_empty() {
        return base;
    }
    let variance = if scores.len() > 1 {
        let mean = stats::mean(scores);
        scores.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / scores.len() as f64
    } else {
        SINGLE_SAMPLE_VARIANCE
    };
    let factor = (variance * variance_scale).max(1.0);
    (base as f64 * factor).ceil() as usize
}

/// Per-domain requirements for an arm, keyed by domain tag.
pub fn domain_requirements(config: &EvaluatorConfig, samples: &[Sample]) -> BTreeMap<String, usize> {
    let mut by_domain: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for s in samples {
        by_domain.entry(s.domain.as_str()).or_default().push(s.score);
    }
    by_domain
        .into_iter()
        .map(|(domain, scores)| {
            let n = required_for_domain(config.min_samples_per_arm, &scores, config.variance_scale);
            (domain.to_string(), n)
        })
        .collect()
}

/// Minimum sample count for an arm: the configured floor, raised to the
/// noisiest domain's requirement when adaptive sampling is on, and capped at
/// `max_samples_per_arm`.
pub fn required_samples(config: &EvaluatorConfig, samples: &[Sample]) -> usize {
    let floor = config.min_samples_per_arm;
    if !config.adaptive_sampling {
        return floor;
    }
    domain_requirements(config, samples)
        .into_values()
        .max()
        .unwrap_or(floor)
        .clamp(floor, config.max_samples_per_arm.max(floor))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adaptive() -> EvaluatorConfig {
        EvaluatorConfig {
            adaptive_sampling: true,
            ..EvaluatorConfig::default()
        }
    }

    #[test]
    fn quiet_domain_keeps_the_base() {
        assert_eq!(required_for_domain(10, &[0.70, 0.72, 0.71, 0.70], 50.0), 10);
        assert_eq!(required_for_domain(10, &[], 50.0), 10);
    }

    #[test]
    fn noisy_domain_needs_more() {
        // population variance 0.25 -> factor 12.5
        assert_eq!(required_for_domain(10, &[0.0, 1.0, 0.0, 1.0], 50.0), 125);
        // a lone observation assumes variance 0.1 -> factor 5
        assert_eq!(required_for_domain(10, &[0.4], 50.0), 50);
    }

    #[test]
    fn arm_requirement_follows_noisiest_domain() {
        let samples: Vec<Sample> = (0..8)
            .map(|i| {
                if i % 2 == 0 {
                    Sample::new(0.7, 0.1, 100.0, "code")
                } else {
                    Sample::new((i % 4) as f64 / 3.0, 0.1, 100.0, "math")
                }
            })
            .collect();
        let per_domain = domain_requirements(&adaptive(), &samples);
        assert_eq!(per_domain["code"], 10);
        assert!(per_domain["math"] > 10);
        assert_eq!(required_samples(&adaptive(), &samples), per_domain["math"]);
    }

    #[test]
    fn disabled_or_capped() {
        let noisy: Vec<Sample> = (0..6)
            .map(|i| Sample::new((i % 2) as f64, 0.1, 100.0, "d"))
            .collect();
        assert_eq!(required_samples(&EvaluatorConfig::default(), &noisy), 10);

        let capped = EvaluatorConfig {
            max_samples_per_arm: 40,
            ..adaptive()
        };
        assert_eq!(required_samples(&capped, &noisy), 40);
    }
}
