//! Observability tests: every lifecycle emit function logs without panicking
//! and carries the capability id.

use absorb_core::obs::{
    emit_adaptation_failed, emit_adaptation_timeout, emit_canary_decision, emit_capability_discovered,
    emit_cluster_drift, emit_cycle_finished, emit_federation_merge, emit_integrity_failure, emit_policy_decision,
    emit_policy_error, emit_rollback_stage, emit_transition, CapabilitySpan,
};
use absorb_core::{CapabilityId, Decision, Facts, LifecycleState};
use tracing_test::traced_test;

fn id() -> CapabilityId {
    CapabilityId::from("cap-obs-1")
}

#[traced_test]
#[test]
fn test_emit_capability_discovered() {
    emit_capability_discovered(&id(), "summarizer-v2", "writer");
    assert!(logs_contain("cap-obs-1"));
    assert!(logs_contain("summarizer-v2"));
}

#[traced_test]
#[test]
fn test_emit_transition() {
    let facts = Facts::new().with_number("uplift", 0.04);
    emit_transition(
        &id(),
        LifecycleState::Canary,
        LifecycleState::Promoted,
        "canary promoted",
        &facts,
    );
    assert!(logs_contain("promoted"));
    assert!(logs_contain("canary promoted"));
}

#[traced_test]
#[test]
fn test_emit_canary_decision() {
    let facts = Facts::new().with_bool("canary_passed", true);
    emit_canary_decision(&id(), LifecycleState::Canary, "promote", &facts);
    assert!(logs_contain("promote"));
}

#[traced_test]
#[test]
fn test_emit_policy_decision_and_error() {
    let facts = Facts::new().with_bool("ready_to_promote", false);
    emit_policy_decision(&id(), Decision::AllowPromoteFromQuarantine, false, &facts);
    emit_policy_error(&id(), Decision::AllowAutoAdopt, &"policy engine unreachable");
    assert!(logs_contain("allow_promote_from_quarantine"));
    assert!(logs_contain("policy engine unreachable"));
}

#[traced_test]
#[test]
fn test_emit_integrity_failure() {
    emit_integrity_failure(&id(), "signature missing");
    assert!(logs_contain("signature missing"));
}

#[traced_test]
#[test]
fn test_emit_rollback_stage() {
    emit_rollback_stage(&id(), 2, 0.25);
    assert!(logs_contain("cap-obs-1"));
}

#[traced_test]
#[test]
fn test_emit_adaptation_events() {
    emit_adaptation_timeout(&id(), 10_000, 2);
    emit_adaptation_failed(&id(), &"ledger unavailable");
    assert!(logs_contain("ledger unavailable"));
}

#[traced_test]
#[test]
fn test_emit_federation_and_cycle() {
    emit_federation_merge("eu-west", 12, 3);
    emit_cycle_finished(5, 2, 1, 42);
    assert!(logs_contain("eu-west"));
}

#[traced_test]
#[test]
fn test_emit_cluster_drift() {
    emit_cluster_drift("acme", "variant", "ap-south", 0.31, -3.2);
    assert!(logs_contain("federation.drift"));
    assert!(logs_contain("ap-south"));
}

#[traced_test]
#[test]
fn test_capability_span_scopes_events() {
    {
        let _span = CapabilitySpan::enter(&id());
        tracing::info!("inside capability span");
    }
    assert!(logs_contain("inside capability span"));
    assert!(logs_contain("cap-obs-1"));
}
