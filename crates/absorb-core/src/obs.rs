//! Structured observability hooks for capability lifecycle events.
//!
//! This module provides:
//! - Capability-scoped tracing spans via the `CapabilitySpan` RAII guard
//! - One emission function per named governance event
//!
//! Events are emitted at `info!` level unless they describe a failure.
//! Output format is chosen by [`crate::telemetry::init_tracing`].

use tracing::{info, warn};

use crate::domain::{CapabilityId, LifecycleState};
use crate::policy::{Decision, Facts};

/// RAII guard that enters a capability-scoped span.
///
/// ```ignore
/// let _span = CapabilitySpan::enter(&id);
/// // every event below carries capability_id
/// ```
pub struct CapabilitySpan {
    _span: tracing::span::EnteredSpan,
}

impl CapabilitySpan {
    pub fn enter(capability_id: &CapabilityId) -> Self {
        let span = tracing::info_span!("absorb.capability", capability_id = %capability_id);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_capability_discovered(capability_id: &CapabilityId, name: &str, role: &str) {
    info!(
        event = "capability.discovered",
        capability_id = %capability_id,
        name = %name,
        role = %role,
    );
}

/// Emit event: lifecycle state transition with the facts that justified it.
pub fn emit_transition(
    capability_id: &CapabilityId,
    from: LifecycleState,
    to: LifecycleState,
    reason: &str,
    facts: &Facts,
) {
    info!(
        event = "lifecycle.transition",
        capability_id = %capability_id,
        from = %from,
        to = %to,
        reason = %reason,
        facts = %facts.to_json(),
    );
}

/// Emit event: evaluator verdict consulted for a canary or live capability.
pub fn emit_canary_decision(
    capability_id: &CapabilityId,
    state: LifecycleState,
    verdict: &str,
    facts: &Facts,
) {
    info!(
        event = "canary.decision",
        capability_id = %capability_id,
        state = %state,
        verdict = %verdict,
        facts = %facts.to_json(),
    );
}

pub fn emit_policy_decision(
    capability_id: &CapabilityId,
    decision: Decision,
    allowed: bool,
    facts: &Facts,
) {
    info!(
        event = "policy.decision",
        capability_id = %capability_id,
        decision = %decision,
        allowed = allowed,
        facts = %facts.to_json(),
    );
}

/// Gate errors are treated as deny.
pub fn emit_policy_error(capability_id: &CapabilityId, decision: Decision, error: &dyn std::fmt::Display) {
    warn!(
        event = "policy.error",
        capability_id = %capability_id,
        decision = %decision,
        error = %error,
    );
}

pub fn emit_integrity_failure(capability_id: &CapabilityId, reason: &str) {
    warn!(event = "integrity.failed", capability_id = %capability_id, reason = %reason);
}

pub fn emit_rollback_stage(capability_id: &CapabilityId, stage_index: usize, fraction: f64) {
    info!(
        event = "rollback.stage",
        capability_id = %capability_id,
        stage_index = stage_index,
        fraction = fraction,
    );
}

pub fn emit_adaptation_timeout(capability_id: &CapabilityId, timeout_ms: u64, consecutive: u32) {
    warn!(
        event = "adaptation.timeout",
        capability_id = %capability_id,
        timeout_ms = timeout_ms,
        consecutive = consecutive,
    );
}

pub fn emit_adaptation_failed(capability_id: &CapabilityId, error: &dyn std::fmt::Display) {
    warn!(event = "adaptation.failed", capability_id = %capability_id, error = %error);
}

pub fn emit_federation_merge(replica_id: &str, received: usize, applied: usize) {
    info!(
        event = "federation.merge",
        replica_id = %replica_id,
        received = received,
        applied = applied,
    );
}

pub fn emit_cluster_drift(tenant: &str, arm: &str, cluster_id: &str, mean_score: f64, z_score: f64) {
    warn!(
        event = "federation.drift",
        tenant = %tenant,
        arm = %arm,
        cluster_id = %cluster_id,
        mean_score = mean_score,
        z_score = z_score,
    );
}

pub fn emit_cycle_finished(evaluated: usize, transitioned: usize, timed_out: usize, duration_ms: u64) {
    info!(
        event = "control_loop.cycle",
        evaluated = evaluated,
        transitioned = transitioned,
        timed_out = timed_out,
        duration_ms = duration_ms,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_span_create() {
        let _span = CapabilitySpan::enter(&CapabilityId::from("cap-1"));
    }
}
