//! Control loop: bounded concurrency, deadlines and shutdown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use absorb_core::federation::ClusterSample;
use absorb_core::{
    ArmId, ArmRole, CapabilityKind, CapabilityManifest, ControlLoop, DigestIntegrityVerifier,
    FederatedAggregator, GovernanceConfig, LifecycleEngine, LifecycleState, MemoryOutcomeLedger,
    OutcomeLedger, Sample, StaticPolicyGate,
};
use absorb_ledger::LedgerResult;
use async_trait::async_trait;
use tokio::sync::watch;

/// Ledger that can be made to stall on length queries, and records the
/// peak number of queries in flight.
#[derive(Default)]
struct StallingLedger {
    inner: MemoryOutcomeLedger,
    stall: AtomicBool,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl OutcomeLedger for StallingLedger {
    async fn open_arm(&self, experiment: &str, arm: &str) -> LedgerResult<ArmId> {
        self.inner.open_arm(experiment, arm).await
    }

    async fn record(&self, arm: &ArmId, sample: Sample) -> LedgerResult<usize> {
        self.inner.record(arm, sample).await
    }

    async fn read(&self, arm: &ArmId) -> LedgerResult<Vec<Sample>> {
        self.inner.read(arm).await
    }

    async fn len(&self, arm: &ArmId) -> LedgerResult<usize> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let pause = if self.stall.load(Ordering::SeqCst) {
            Duration::from_secs(60)
        } else {
            Duration::from_millis(10)
        };
        tokio::time::sleep(pause).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.len(arm).await
    }

    async fn arms(&self, experiment: &str) -> LedgerResult<Vec<ArmId>> {
        self.inner.arms(experiment).await
    }
}

fn engine(config: GovernanceConfig, ledger: Arc<StallingLedger>) -> Arc<LifecycleEngine> {
    Arc::new(
        LifecycleEngine::builder(
            config,
            ledger,
            Arc::new(StaticPolicyGate::standard()),
            Arc::new(DigestIntegrityVerifier::accept_signed()),
        )
        .build()
        .unwrap(),
    )
}

fn manifest(name: &str, signed: bool) -> CapabilityManifest {
    let mut m = CapabilityManifest::new(name, CapabilityKind::Tool, "coder").sealed();
    if signed {
        m.signature = Some("sig".to_string());
    }
    m
}

#[tokio::test(start_paused = true)]
async fn cycle_respects_max_concurrency() {
    let mut config = GovernanceConfig::default();
    config.control_loop.max_concurrency = 2;
    let ledger = Arc::new(StallingLedger::default());
    let engine = engine(config, ledger.clone());
    for i in 0..8 {
        engine.discover(manifest(&format!("tool-{i}"), true)).await.unwrap();
    }
    let control = ControlLoop::new(engine.clone());

    let first = control.run_cycle().await;
    assert_eq!(first.evaluated, 8);
    assert_eq!(first.transitions.len(), 8);
    assert!(first
        .transitions
        .iter()
        .all(|(_, _, to)| *to == LifecycleState::ShadowTrial));

    ledger.peak.store(0, Ordering::SeqCst);
    let second = control.run_cycle().await;
    assert_eq!(second.held, 8);
    let peak = ledger.peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 2, "peak in-flight was {peak}");
}

#[tokio::test(start_paused = true)]
async fn repeated_timeouts_force_rejection() {
    let ledger = Arc::new(StallingLedger::default());
    let engine = engine(GovernanceConfig::default(), ledger.clone());
    let id = engine.discover(manifest("slow-tool", true)).await.unwrap();
    let control = ControlLoop::new(engine.clone());
    control.run_cycle().await;

    ledger.stall.store(true, Ordering::SeqCst);
    for round in 1..=3u32 {
        let report = control.run_cycle().await;
        assert_eq!(report.timed_out, vec![id.clone()]);
        let view = engine.snapshot(&id).await.unwrap();
        if round < 3 {
            assert_eq!(view.record.state, LifecycleState::ShadowTrial);
            assert_eq!(view.record.consecutive_timeouts, round);
        } else {
            assert_eq!(report.state_of(&id), Some(LifecycleState::Rejected));
        }
    }

    // Terminal capabilities are no longer visited.
    let report = control.run_cycle().await;
    assert_eq!(report.evaluated, 0);
}

#[tokio::test(start_paused = true)]
async fn completed_evaluation_clears_timeout_streak() {
    let ledger = Arc::new(StallingLedger::default());
    let engine = engine(GovernanceConfig::default(), ledger.clone());
    let id = engine.discover(manifest("flaky-tool", true)).await.unwrap();
    let control = ControlLoop::new(engine.clone());
    control.run_cycle().await;

    ledger.stall.store(true, Ordering::SeqCst);
    control.run_cycle().await;
    control.run_cycle().await;
    ledger.stall.store(false, Ordering::SeqCst);
    control.run_cycle().await;
    ledger.stall.store(true, Ordering::SeqCst);
    control.run_cycle().await;

    let view = engine.snapshot(&id).await.unwrap();
    assert_eq!(view.record.state, LifecycleState::ShadowTrial);
    assert_eq!(view.record.consecutive_timeouts, 1);
}

#[tokio::test]
async fn evaluation_errors_are_reported_per_capability() {
    let ledger = Arc::new(StallingLedger::default());
    let engine = engine(GovernanceConfig::default(), ledger);
    let good = engine.discover(manifest("good", true)).await.unwrap();
    let bad = engine.discover(manifest("unsigned", false)).await.unwrap();

    let report = ControlLoop::new(engine).run_cycle().await;
    assert_eq!(report.evaluated, 2);
    assert_eq!(report.state_of(&good), Some(LifecycleState::ShadowTrial));
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, bad);
}

#[tokio::test(start_paused = true)]
async fn run_stops_on_shutdown_signal() {
    let ledger = Arc::new(StallingLedger::default());
    let engine = engine(GovernanceConfig::default(), ledger);
    let id = engine.discover(manifest("looped", true)).await.unwrap();
    let control = Arc::new(ControlLoop::new(engine.clone()));

    let (tx, rx) = watch::channel(false);
    let handle = {
        let control = control.clone();
        tokio::spawn(async move { control.run(rx).await })
    };

    // The first tick fires immediately.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        engine.snapshot(&id).await.unwrap().record.state,
        LifecycleState::ShadowTrial
    );

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("loop did not stop")
        .unwrap();
}

#[tokio::test]
async fn cycle_reports_drifting_clusters() {
    let config = GovernanceConfig::default();
    let aggregator = Arc::new(FederatedAggregator::from_config(&config.federation));
    let engine = Arc::new(
        LifecycleEngine::builder(
            config,
            Arc::new(MemoryOutcomeLedger::new()),
            Arc::new(StaticPolicyGate::standard()),
            Arc::new(DigestIntegrityVerifier::accept_signed()),
        )
        .with_aggregator(aggregator.clone())
        .build()
        .unwrap(),
    );
    let id = engine.discover(manifest("drifty", true)).await.unwrap();

    // Local control samples sit well above what three remote clusters report.
    for _ in 0..10 {
        engine
            .record_sample(&id, ArmRole::Control, Sample::new(0.9, 0.1, 100.0, "code"))
            .await
            .unwrap();
    }
    for cluster in ["east", "west", "north"] {
        for _ in 0..30 {
            aggregator.ingest(ClusterSample {
                cluster_id: cluster.to_string(),
                tenant: "default".to_string(),
                arm: ArmRole::Control,
                score: 0.5,
                cost: 0.1,
                latency_ms: 100.0,
            });
        }
    }
    assert_eq!(aggregator.len(), 100);

    let report = ControlLoop::new(engine).run_cycle().await;
    assert_eq!(report.drift.len(), 1);
    let (tenant, arm, drift) = &report.drift[0];
    assert_eq!(tenant, "default");
    assert_eq!(*arm, ArmRole::Control);
    assert_eq!(drift.cluster_id, "local");
    assert!((drift.z_score - 3.0).abs() < 1e-6, "z = {}", drift.z_score);
}

#[tokio::test]
async fn cycle_without_aggregator_reports_no_drift() {
    let ledger = Arc::new(StallingLedger::default());
    let engine = engine(GovernanceConfig::default(), ledger);
    engine.discover(manifest("plain", true)).await.unwrap();
    let report = ControlLoop::new(engine.clone()).run_cycle().await;
    assert!(engine.aggregator().is_none());
    assert!(report.drift.is_empty());
}
