//! Cross-cluster experiment aggregation.
//!
//! Each cluster forwards its samples tagged with cluster and tenant. The
//! aggregator produces a global control-vs-variant summary and flags
//! clusters whose mean score sits far from the global distribution.
//!
//! Only the most recent `capacity` samples are kept; older ones fall out of
//! the window as new ones arrive.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::config::FederationConfig;
use crate::evaluator::stats;
use crate::lifecycle::ArmRole;

/// Minimum samples per arm before a global summary is reported as ready.
pub const MIN_GLOBAL_SAMPLES: usize = 10;
/// Minimum samples in an arm before drift detection runs.
pub const MIN_DRIFT_SAMPLES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSample {
    pub cluster_id: String,
    pub tenant: String,
    pub arm: ArmRole,
    pub score: f64,
    pub cost: f64,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSummary {
    pub ready: bool,
    pub control_n: usize,
    pub variant_n: usize,
    pub uplift: Option<f64>,
    pub cost_delta: Option<f64>,
    pub latency_delta_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterDrift {
    pub cluster_id: String,
    pub mean_score: f64,
    pub z_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub enough_data: bool,
    pub global_mean: Option<f64>,
    /// Clusters beyond the threshold, sorted by cluster id.
    pub outliers: Vec<ClusterDrift>,
}

#[derive(Debug)]
pub struct FederatedAggregator {
    z_threshold: f64,
    capacity: usize,
    samples: RwLock<VecDeque<ClusterSample>>,
}

impl FederatedAggregator {
    pub fn new(z_threshold: f64, capacity: usize) -> Self {
        Self {
            z_threshold,
            capacity: capacity.max(1),
            samples: RwLock::new(VecDeque::new()),
        }
    }

    pub fn from_config(config: &FederationConfig) -> Self {
        Self::new(config.drift_z_threshold, config.aggregator_capacity)
    }

    pub fn ingest(&self, sample: ClusterSample) {
        let mut samples = self.samples.write().unwrap_or_else(|e| e.into_inner());
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tenants with at least one sample in the window, sorted.
    pub fn tenants(&self) -> Vec<String> {
        self.samples
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|s| s.tenant.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn select(&self, tenant: &str, arm: ArmRole) -> Vec<ClusterSample> {
        self.samples
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.tenant == tenant && s.arm == arm)
            .cloned()
            .collect()
    }

    pub fn summarize_global(&self, tenant: &str) -> GlobalSummary {
        let control = self.select(tenant, ArmRole::Control);
        let variant = self.select(tenant, ArmRole::Variant);
        let (control_n, variant_n) = (control.len(), variant.len());
        if control_n < MIN_GLOBAL_SAMPLES || variant_n < MIN_GLOBAL_SAMPLES {
            return GlobalSummary {
                ready: false,
                control_n,
                variant_n,
                uplift: None,
                cost_delta: None,
                latency_delta_ms: None,
            };
        }
        let delta = |f: fn(&ClusterSample) -> f64| {
            let v: Vec<f64> = variant.iter().map(f).collect();
            let c: Vec<f64> = control.iter().map(f).collect();
            stats::mean(&v) - stats::mean(&c)
        };
        GlobalSummary {
            ready: true,
            control_n,
            variant_n,
            uplift: Some(delta(|s| s.score)),
            cost_delta: Some(delta(|s| s.cost)),
            latency_delta_ms: Some(delta(|s| s.latency_ms)),
        }
    }

    /// z-score of each cluster's mean against the population of all samples.
    pub fn detect_cluster_drift(&self, tenant: &str, arm: ArmRole) -> DriftReport {
        let samples = self.select(tenant, arm);
        if samples.len() < MIN_DRIFT_SAMPLES {
            return DriftReport {
                enough_data: false,
                global_mean: None,
                outliers: Vec::new(),
            };
        }
        let scores: Vec<f64> = samples.iter().map(|s| s.score).collect();
        let global_mean = stats::mean(&scores);
        let pop_var = scores.iter().map(|x| (x - global_mean).powi(2)).sum::<f64>()
            / scores.len() as f64;
        let std = if pop_var > 0.0 { pop_var.sqrt() } else { 1e-6 };

        let mut by_cluster: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for s in &samples {
            by_cluster.entry(s.cluster_id.as_str()).or_default().push(s.score);
        }
        let outliers = by_cluster
            .into_iter()
            .filter_map(|(cluster, xs)| {
                let mean_score = stats::mean(&xs);
                let z_score = (mean_score - global_mean) / std;
                (z_score.abs() > self.z_threshold).then(|| ClusterDrift {
                    cluster_id: cluster.to_string(),
                    mean_score,
                    z_score,
                })
            })
            .collect();

        DriftReport {
            enough_data: true,
            global_mean: Some(global_mean),
            outliers,
        }
    }
}
