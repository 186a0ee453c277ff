//! Router weights driven by lifecycle transitions and published through the
//! federation store.

use std::sync::Arc;

use absorb_core::lifecycle::lifecycle_key;
use absorb_core::router_weights::bundle_key;
use absorb_core::{
    CapabilityKind, CapabilityManifest, DigestIntegrityVerifier, GovernanceConfig, GovernanceError,
    LifecycleEngine, LifecycleState, MemoryOutcomeLedger, ReplicatedStore, RouterConfig,
    RouterWeightAdapter, StaticPolicyGate, TransitionOutcome, TrustTier, WeightBundle,
};

fn adapter() -> RouterWeightAdapter {
    RouterWeightAdapter::new(RouterConfig::default())
}

#[test]
fn higher_trust_never_scores_lower() {
    let router = adapter();
    let scores: Vec<f64> = [0.1, 0.45, 0.65, 0.9]
        .iter()
        .enumerate()
        .map(|(i, trust)| {
            let candidate = format!("cand-{i}");
            router.set_trust(&candidate, *trust);
            router.apply_trust_modifier("coder", &candidate, 0.8)
        })
        .collect();
    assert!(scores.windows(2).all(|w| w[0] <= w[1]), "{scores:?}");
    assert_eq!(TrustTier::from_score(0.9), TrustTier::A);
}

#[test]
fn denied_candidate_scores_zero_for_that_role_only() {
    let router = adapter();
    router.set_trust("cand", 0.95);
    router.deny("coder", "cand");
    assert_eq!(router.apply_trust_modifier("coder", "cand", 1.0), 0.0);
    assert!(router.apply_trust_modifier("reviewer", "cand", 1.0) > 0.0);

    router.allow("coder", "cand");
    assert!(router.apply_trust_modifier("coder", "cand", 1.0) > 0.0);
}

#[test]
fn smoothing_converges_toward_repeated_outcome() {
    let router = adapter();
    let mut last = 0.0;
    for _ in 0..50 {
        last = router.update_weight("coder", "cand", 1.0);
    }
    assert!((last - 1.0).abs() < 1e-3);
    let bundle = router.bundle("coder");
    assert_eq!(bundle.weights.len(), 1);
    assert!((bundle.weights["cand"] - 1.0).abs() < 1e-12);
}

#[tokio::test]
async fn transitions_replicate_lifecycle_and_router_state() {
    let config = GovernanceConfig::default();
    let store = Arc::new(ReplicatedStore::new("us-east"));
    let router = Arc::new(RouterWeightAdapter::new(config.router.clone()));
    let engine = LifecycleEngine::builder(
        config,
        Arc::new(MemoryOutcomeLedger::new()),
        Arc::new(StaticPolicyGate::standard()),
        Arc::new(DigestIntegrityVerifier::new(|m| m.signature.is_some())),
    )
    .with_router(router.clone())
    .with_federation(store.clone())
    .build()
    .unwrap();

    let rejected_id = {
        let mut manifest = CapabilityManifest::new("slow-tool", CapabilityKind::Tool, "coder").sealed();
        manifest.signature = Some("sig".to_string());
        let id = engine.discover(manifest).await.unwrap();
        engine.evaluate(&id).await.unwrap();
        for consecutive in 1..=2u32 {
            match engine.note_timeout(&id, 10_000).await {
                Err(GovernanceError::AdaptationTimeout {
                    timeout_ms: 10_000,
                    consecutive: n,
                    ..
                }) => assert_eq!(n, consecutive),
                other => panic!("expected adaptation timeout, got {other:?}"),
            }
        }
        let forced = engine.note_timeout(&id, 10_000).await.unwrap();
        assert!(matches!(
            forced,
            TransitionOutcome::Transitioned {
                to: LifecycleState::Rejected,
                ..
            }
        ));
        id
    };

    let snapshot = store.get(&lifecycle_key(&rejected_id)).unwrap();
    assert_eq!(snapshot["record"]["state"], "rejected");

    // Rejection fed a zero outcome into the role's bundle and published it.
    let bundle = WeightBundle::from_value(store.get(&bundle_key("coder")).unwrap()).unwrap();
    assert_eq!(bundle.role, "coder");
    assert!(bundle.weights.contains_key(rejected_id.as_str()));
    assert!(router.is_denied("coder", rejected_id.as_str()));
    assert_eq!(
        router.weight("coder", rejected_id.as_str()),
        Some(0.1 + 0.2 * (0.0 - 0.1))
    );
}
