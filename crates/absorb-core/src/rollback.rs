//! Rollback controller: staged blast-radius reduction.
//!
//! A plan walks a non-increasing sequence of traffic fractions, one stage per
//! interval. A tick moves at most one stage, and each stage holds for a full
//! interval after it was entered, so a late tick never skips part of the
//! drain. The currently effective fraction is read by dispatch. Plans
//! exist only while a rollback is in progress; the lifecycle engine calls
//! [`RollbackController::finish`] once the final stage is reached.
//!
//! All mutating calls are made while the lifecycle engine holds the
//! capability's lock, so plan updates never race with evaluation.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::RollbackConfig;
use crate::domain::{CapabilityId, GovernanceError, Result};

/// Check that stage fractions are usable as a ramp-down.
pub fn validate_stages(stages: &[f64]) -> Result<()> {
    if stages.is_empty() {
        return Err(GovernanceError::InvalidRollbackPlan(
            "stage_fractions must not be empty".to_string(),
        ));
    }
    if let Some(bad) = stages.iter().find(|f| !(0.0..=1.0).contains(*f)) {
        return Err(GovernanceError::InvalidRollbackPlan(format!(
            "stage fraction {bad} outside 0.0..=1.0"
        )));
    }
    if stages.windows(2).any(|w| w[1] > w[0]) {
        return Err(GovernanceError::InvalidRollbackPlan(
            "stage_fractions must be non-increasing".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub capability_id: CapabilityId,
    pub stage_index: usize,
    pub stage_fractions: Vec<f64>,
    pub stage_interval_secs: u64,
    pub started_at: DateTime<Utc>,
    /// When the current stage became effective.
    pub stage_entered_at: DateTime<Utc>,
    /// Most recent trigger reason. Duplicate triggers overwrite it.
    pub reason: String,
    pub trigger_count: u32,
}

impl RollbackPlan {
    pub fn effective_fraction(&self) -> f64 {
        self.stage_fractions
            .get(self.stage_index)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn last_stage(&self) -> usize {
        self.stage_fractions.len().saturating_sub(1)
    }

    pub fn is_complete(&self) -> bool {
        self.stage_index >= self.last_stage()
    }

    fn next_stage_due(&self, now: DateTime<Utc>) -> bool {
        let elapsed = (now - self.stage_entered_at).num_seconds();
        !self.is_complete() && elapsed >= self.stage_interval_secs as i64
    }

    fn step(&mut self, now: DateTime<Utc>) {
        self.stage_index += 1;
        self.stage_entered_at = now;
    }

    fn tick_result(&self, advanced: bool) -> RollbackTick {
        RollbackTick {
            stage_index: self.stage_index,
            fraction: self.effective_fraction(),
            advanced,
            complete: self.is_complete(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A plan was already active; only its reason was updated.
    AlreadyActive,
}

/// Result of driving a plan forward.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollbackTick {
    pub stage_index: usize,
    pub fraction: f64,
    /// Stage index moved on this call.
    pub advanced: bool,
    pub complete: bool,
}

#[derive(Debug)]
pub struct RollbackController {
    config: RollbackConfig,
    plans: DashMap<CapabilityId, RollbackPlan>,
}

impl RollbackController {
    pub fn new(config: RollbackConfig) -> Result<Self> {
        validate_stages(&config.stage_fractions)?;
        if config.stage_interval_secs == 0 {
            return Err(GovernanceError::InvalidRollbackPlan(
                "stage_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            config,
            plans: DashMap::new(),
        })
    }

    pub fn config(&self) -> &RollbackConfig {
        &self.config
    }

    /// Create a plan, or record `reason` on the plan already running.
    pub fn start(&self, id: &CapabilityId, reason: &str, now: DateTime<Utc>) -> StartOutcome {
        match self.plans.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut plan) => {
                let plan = plan.get_mut();
                plan.reason = reason.to_string();
                plan.trigger_count += 1;
                tracing::info!(
                    capability_id = %id,
                    reason,
                    trigger_count = plan.trigger_count,
                    "rollback already active; duplicate trigger recorded"
                );
                StartOutcome::AlreadyActive
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(RollbackPlan {
                    capability_id: id.clone(),
                    stage_index: 0,
                    stage_fractions: self.config.stage_fractions.clone(),
                    stage_interval_secs: self.config.stage_interval_secs,
                    started_at: now,
                    stage_entered_at: now,
                    reason: reason.to_string(),
                    trigger_count: 1,
                });
                StartOutcome::Started
            }
        }
    }

    /// Move one stage forward if the current stage has held for a full
    /// interval at `now`. The stage index never moves backward.
    pub fn tick(&self, id: &CapabilityId, now: DateTime<Utc>) -> Option<RollbackTick> {
        let mut plan = self.plans.get_mut(id)?;
        let advanced = plan.next_stage_due(now);
        if advanced {
            plan.step(now);
        }
        Some(plan.tick_result(advanced))
    }

    /// Force exactly one stage forward regardless of elapsed time.
    pub fn advance(&self, id: &CapabilityId, now: DateTime<Utc>) -> Option<RollbackTick> {
        let mut plan = self.plans.get_mut(id)?;
        let advanced = !plan.is_complete();
        if advanced {
            plan.step(now);
        }
        Some(plan.tick_result(advanced))
    }

    pub fn effective_fraction(&self, id: &CapabilityId) -> Option<f64> {
        self.plans.get(id).map(|p| p.effective_fraction())
    }

    pub fn plan(&self, id: &CapabilityId) -> Option<RollbackPlan> {
        self.plans.get(id).map(|p| p.clone())
    }

    pub fn is_active(&self, id: &CapabilityId) -> bool {
        self.plans.contains_key(id)
    }

    pub fn active(&self) -> Vec<CapabilityId> {
        let mut ids: Vec<_> = self.plans.iter().map(|p| p.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Destroy the plan.
    pub fn finish(&self, id: &CapabilityId) -> Option<RollbackPlan> {
        self.plans.remove(id).map(|(_, plan)| plan)
    }
}
