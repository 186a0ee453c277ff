//! Staged rollback plans: ordering, catch-up and configuration.

use absorb_core::rollback::StartOutcome;
use absorb_core::{CapabilityId, GovernanceConfig, GovernanceError, RollbackController};
use chrono::{Duration, Utc};

fn controller_from(toml: &str) -> RollbackController {
    let config = GovernanceConfig::from_toml_str(toml).unwrap();
    RollbackController::new(config.rollback).unwrap()
}

#[test]
fn custom_stages_from_config() {
    let rollback = controller_from(
        r#"
        [rollback]
        stage_fractions = [1.0, 0.3, 0.0]
        stage_interval_secs = 60
        "#,
    );
    let id = CapabilityId::from("cap-a");
    let t0 = Utc::now();
    assert_eq!(rollback.start(&id, "incident", t0), StartOutcome::Started);
    assert_eq!(rollback.effective_fraction(&id), Some(1.0));

    let tick = rollback.tick(&id, t0 + Duration::seconds(59)).unwrap();
    assert!(!tick.advanced);
    assert_eq!(tick.fraction, 1.0);

    let tick = rollback.tick(&id, t0 + Duration::seconds(60)).unwrap();
    assert!(tick.advanced);
    assert_eq!(tick.fraction, 0.3);
    assert!(!tick.complete);
}

#[test]
fn missed_ticks_still_drain_stage_by_stage() {
    let rollback = controller_from("");
    let id = CapabilityId::from("cap-b");
    let t0 = Utc::now();
    rollback.start(&id, "regression", t0);

    // A tick half an hour late still only reaches the next stage.
    let late = t0 + Duration::minutes(30);
    let mut fractions = Vec::new();
    let mut now = late;
    for _ in 0..4 {
        let tick = rollback.tick(&id, now).unwrap();
        fractions.push((tick.fraction, tick.complete));
        now += Duration::seconds(120);
    }
    assert_eq!(
        fractions,
        vec![(0.5, false), (0.25, false), (0.0, true), (0.0, true)]
    );
}

#[test]
fn stage_index_never_moves_backward() {
    let rollback = controller_from("");
    let id = CapabilityId::from("cap-c");
    let t0 = Utc::now();
    rollback.start(&id, "regression", t0);
    rollback.advance(&id, t0);
    rollback.advance(&id, t0);

    // A tick whose clock reading says "stage 0" must not undo forced stages.
    let tick = rollback.tick(&id, t0).unwrap();
    assert_eq!(tick.stage_index, 2);
    assert_eq!(tick.fraction, 0.25);
}

#[test]
fn plans_are_independent_per_capability() {
    let rollback = controller_from("");
    let (a, b) = (CapabilityId::from("cap-a"), CapabilityId::from("cap-b"));
    let t0 = Utc::now();
    rollback.start(&a, "a", t0);
    rollback.start(&b, "b", t0 + Duration::seconds(90));

    let now = t0 + Duration::seconds(125);
    assert_eq!(rollback.tick(&a, now).unwrap().fraction, 0.5);
    assert_eq!(rollback.tick(&b, now).unwrap().fraction, 1.0);
    assert_eq!(rollback.active(), vec![a.clone(), b.clone()]);

    assert!(rollback.finish(&a).is_some());
    assert!(!rollback.is_active(&a));
    assert!(rollback.tick(&a, now).is_none());
}

#[test]
fn increasing_stages_are_rejected() {
    let config = GovernanceConfig::from_toml_str(
        r#"
        [rollback]
        stage_fractions = [0.5, 1.0, 0.0]
        "#,
    )
    .unwrap();
    assert!(matches!(
        config.validate(),
        Err(GovernanceError::InvalidRollbackPlan(_))
    ));
    assert!(RollbackController::new(config.rollback).is_err());
}
