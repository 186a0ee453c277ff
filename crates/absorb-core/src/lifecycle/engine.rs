//! Lifecycle engine: drives capabilities through their trial.
//!
//! The engine owns one slot per capability. Periodic evaluation and rollback
//! ticks take the slot lock with `try_lock`; losing that race is reported as
//! [`TransitionOutcome::Conflict`] and retried on the next cycle. External
//! commands (incident rollback, forced rollback advance, re-submission,
//! timeout accounting) wait for the lock so they are never dropped.
//!
//! When an aggregator is attached, every sample written through the engine
//! is also forwarded to it, tagged with this replica and the manifest's
//! tenant.

use std::sync::Arc;

use absorb_ledger::{ArmId, OutcomeLedger, Sample};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::Instrument;

use super::canary::CanaryTap;
use super::events::{EventSink, LifecycleEvent, TracingEventSink};
use super::{ArmRole, CapabilityView, HoldReason, TransitionOutcome};
use crate::clock::{Clock, SystemClock};
use crate::config::{GovernanceConfig, LifecycleConfig};
use crate::domain::{
    Capability, CapabilityId, CapabilityManifest, GovernanceError, LifecycleRecord, LifecycleState,
    Result,
};
use crate::evaluator::{ArmOffsets, Evaluation, ExperimentEvaluator, Verdict};
use crate::federation::{ClusterSample, FederatedAggregator, ReplicatedStore};
use crate::integrity::{IntegrityReport, IntegrityVerifier};
use crate::metrics::METRICS;
use crate::obs::{self, CapabilitySpan};
use crate::policy::{Decision, Facts, PolicyGate};
use crate::redteam::{RedteamScan, RedteamScanner};
use crate::rollback::{RollbackController, RollbackTick};
use crate::router_weights::RouterWeightAdapter;
use crate::trust::{penalize_trust, promote_trust, supply_chain_score};

/// Tenant used for aggregation when the manifest names none.
pub const DEFAULT_TENANT: &str = "default";

/// Federation key for a capability's lifecycle snapshot.
pub fn lifecycle_key(id: &CapabilityId) -> String {
    format!("lifecycle/{id}")
}

struct SlotState {
    capability: Capability,
    record: LifecycleRecord,
    integrity: Option<IntegrityReport>,
    redteam: RedteamScan,
    /// Start of the evaluation window in each arm.
    window: ArmOffsets,
}

impl SlotState {
    /// Declared risk, raised to the red-team scan when that is higher.
    fn risk(&self) -> f64 {
        self.capability.manifest.risk_score.max(self.redteam.risk_score)
    }
}

struct CapabilitySlot {
    id: CapabilityId,
    role: String,
    tenant: String,
    control: ArmId,
    variant: ArmId,
    tap: CanaryTap,
    state: Mutex<SlotState>,
}

impl CapabilitySlot {
    fn arm(&self, role: ArmRole) -> &ArmId {
        match role {
            ArmRole::Control => &self.control,
            ArmRole::Variant => &self.variant,
        }
    }

    /// Copy live tap counters into the record.
    fn sync_counts(&self, st: &mut SlotState) {
        if st.record.state.counts_canary_outcomes() {
            let (successes, failures) = self.tap.counts();
            st.record.success_count = successes;
            st.record.failure_count = failures;
        }
    }
}

fn held(state: LifecycleState, reason: HoldReason) -> TransitionOutcome {
    TransitionOutcome::Held { state, reason }
}

fn ratios_ok(record: &LifecycleRecord, min_outcomes: u64, cfg: &LifecycleConfig) -> bool {
    record.total_outcomes() >= min_outcomes
        && record.success_ratio().unwrap_or(0.0) >= cfg.min_success_ratio
        && record.failure_ratio().unwrap_or(1.0) <= cfg.max_failure_ratio
}

fn evaluation_facts(evaluation: &Evaluation, verdict: Verdict) -> Facts {
    let facts = Facts::new().with_bool("insufficient", evaluation.is_insufficient());
    let facts = match evaluation.result() {
        Some(r) => facts
            .with_number("uplift", r.uplift)
            .with_number("ci_lower", r.ci_lower)
            .with_number("ci_upper", r.ci_upper)
            .with_number("p_value", r.p_value)
            .with_number("cost_delta", r.cost_delta)
            .with_number("sample_count", r.sample_count() as f64),
        None => facts,
    };
    facts.with_bool("promotable", verdict == Verdict::Promote)
        .with_bool("demotable", verdict == Verdict::Demote)
}

fn outcome_facts(record: &LifecycleRecord) -> Facts {
    Facts::new()
        .with_number("success_count", record.success_count as f64)
        .with_number("failure_count", record.failure_count as f64)
        .with_number("success_ratio", record.success_ratio().unwrap_or(0.0))
        .with_number("failure_ratio", record.failure_ratio().unwrap_or(0.0))
}

fn merge_facts(mut base: Facts, extra: Facts) -> Facts {
    for (k, v) in extra.iter() {
        base = match v {
            serde_json::Value::Bool(b) => base.with_bool(k.clone(), *b),
            other => match other.as_f64() {
                Some(n) => base.with_number(k.clone(), n),
                None => base,
            },
        };
    }
    base
}

pub struct LifecycleEngineBuilder {
    config: GovernanceConfig,
    ledger: Arc<dyn OutcomeLedger>,
    gate: Arc<dyn PolicyGate>,
    verifier: Arc<dyn IntegrityVerifier>,
    router: Option<Arc<RouterWeightAdapter>>,
    federation: Option<Arc<ReplicatedStore>>,
    aggregator: Option<Arc<FederatedAggregator>>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl LifecycleEngineBuilder {
    pub fn with_router(mut self, router: Arc<RouterWeightAdapter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_federation(mut self, store: Arc<ReplicatedStore>) -> Self {
        self.federation = Some(store);
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<FederatedAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<LifecycleEngine> {
        self.config.validate()?;
        let rollback = RollbackController::new(self.config.rollback.clone())?;
        let evaluator = ExperimentEvaluator::new(self.config.evaluator.clone(), self.ledger.clone());
        Ok(LifecycleEngine {
            config: self.config,
            ledger: self.ledger,
            evaluator,
            gate: self.gate,
            verifier: self.verifier,
            rollback,
            router: self.router,
            federation: self.federation,
            aggregator: self.aggregator,
            redteam: RedteamScanner::new(),
            events: self.events,
            clock: self.clock,
            slots: DashMap::new(),
        })
    }
}

pub struct LifecycleEngine {
    config: GovernanceConfig,
    ledger: Arc<dyn OutcomeLedger>,
    evaluator: ExperimentEvaluator,
    gate: Arc<dyn PolicyGate>,
    verifier: Arc<dyn IntegrityVerifier>,
    rollback: RollbackController,
    router: Option<Arc<RouterWeightAdapter>>,
    federation: Option<Arc<ReplicatedStore>>,
    aggregator: Option<Arc<FederatedAggregator>>,
    redteam: RedteamScanner,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    slots: DashMap<CapabilityId, Arc<CapabilitySlot>>,
}

impl LifecycleEngine {
    pub fn builder(
        config: GovernanceConfig,
        ledger: Arc<dyn OutcomeLedger>,
        gate: Arc<dyn PolicyGate>,
        verifier: Arc<dyn IntegrityVerifier>,
    ) -> LifecycleEngineBuilder {
        LifecycleEngineBuilder {
            config,
            ledger,
            gate,
            verifier,
            router: None,
            federation: None,
            aggregator: None,
            events: Arc::new(TracingEventSink),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    pub fn rollback_controller(&self) -> &RollbackController {
        &self.rollback
    }

    pub fn evaluator(&self) -> &ExperimentEvaluator {
        &self.evaluator
    }

    pub fn aggregator(&self) -> Option<&Arc<FederatedAggregator>> {
        self.aggregator.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn slot(&self, id: &CapabilityId) -> Result<Arc<CapabilitySlot>> {
        self.slots
            .get(id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| GovernanceError::CapabilityNotFound(id.clone()))
    }

    fn all_slots(&self) -> Vec<Arc<CapabilitySlot>> {
        self.slots.iter().map(|s| Arc::clone(s.value())).collect()
    }

    // -----------------------------------------------------------------------
    // Ingestion and request path
    // -----------------------------------------------------------------------

    /// Register a manifest. The capability starts in `Discovered` with zero
    /// trust; integrity is checked on its first evaluation.
    pub async fn discover(&self, manifest: CapabilityManifest) -> Result<CapabilityId> {
        let id = CapabilityId::new();
        let control = self.ledger.open_arm(id.as_str(), ArmRole::Control.as_str()).await?;
        let variant = self.ledger.open_arm(id.as_str(), ArmRole::Variant.as_str()).await?;
        let now = self.clock.now();
        let redteam = self.redteam.scan_manifest(&manifest);
        if !redteam.matches.is_empty() {
            tracing::warn!(
                capability_id = %id,
                risk_score = redteam.risk_score,
                matches = ?redteam.matches,
                "manifest matched red-team patterns"
            );
        }

        obs::emit_capability_discovered(&id, &manifest.name, &manifest.role);
        let slot = CapabilitySlot {
            id: id.clone(),
            role: manifest.role.clone(),
            tenant: manifest
                .tenant
                .clone()
                .unwrap_or_else(|| DEFAULT_TENANT.to_string()),
            control,
            variant,
            tap: CanaryTap::new(),
            state: Mutex::new(SlotState {
                capability: Capability {
                    id: id.clone(),
                    manifest,
                    trust_score: 0.0,
                    discovered_at: now,
                },
                record: LifecycleRecord {
                    state: LifecycleState::Discovered,
                    state_entered_at: now,
                    success_count: 0,
                    failure_count: 0,
                    canary_fraction: 0.0,
                    cooldown_until: None,
                    trial: 1,
                    consecutive_timeouts: 0,
                    integrity_failed: false,
                    last_rollback_reason: None,
                },
                integrity: None,
                redteam,
                window: ArmOffsets::default(),
            }),
        };
        self.slots.insert(id.clone(), Arc::new(slot));
        Ok(id)
    }

    /// Append a sample to one of the capability's arms.
    pub async fn record_sample(&self, id: &CapabilityId, arm: ArmRole, sample: Sample) -> Result<usize> {
        let slot = self.slot(id)?;
        let forwarded = self.cluster_sample(&slot, arm, &sample);
        let count = self.ledger.record(slot.arm(arm), sample).await?;
        self.forward(forwarded);
        Ok(count)
    }

    /// Record a live outcome served by the candidate: the sample goes to the
    /// variant arm and the pass/fail signal to the canary counters. Returns
    /// whether the signal was counted.
    pub async fn record_canary_outcome(
        &self,
        id: &CapabilityId,
        sample: Sample,
        passed: bool,
    ) -> Result<bool> {
        let slot = self.slot(id)?;
        let forwarded = self.cluster_sample(&slot, ArmRole::Variant, &sample);
        self.ledger.record(&slot.variant, sample).await?;
        self.forward(forwarded);
        Ok(slot.tap.record(passed))
    }

    fn cluster_sample(&self, slot: &CapabilitySlot, arm: ArmRole, sample: &Sample) -> Option<ClusterSample> {
        self.aggregator.as_ref().map(|_| ClusterSample {
            cluster_id: self.config.federation.replica_id.clone(),
            tenant: slot.tenant.clone(),
            arm,
            score: sample.score,
            cost: sample.cost,
            latency_ms: sample.latency_ms,
        })
    }

    fn forward(&self, sample: Option<ClusterSample>) {
        if let (Some(aggregator), Some(sample)) = (&self.aggregator, sample) {
            aggregator.ingest(sample);
        }
    }

    /// Per-request routing coin flip.
    pub fn should_route(&self, id: &CapabilityId) -> Result<bool> {
        self.should_route_with(id, &mut rand::rng())
    }

    pub fn should_route_with<R: Rng + ?Sized>(&self, id: &CapabilityId, rng: &mut R) -> Result<bool> {
        let routed = self.slot(id)?.tap.admit(rng);
        if routed {
            METRICS.inc_canary_routes();
        }
        Ok(routed)
    }

    /// Share of live traffic the capability currently receives.
    pub fn effective_fraction(&self, id: &CapabilityId) -> Result<f64> {
        Ok(self.slot(id)?.tap.fraction())
    }

    // -----------------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------------

    fn view(&self, slot: &CapabilitySlot, st: &SlotState) -> CapabilityView {
        let mut record = st.record.clone();
        if record.state.counts_canary_outcomes() {
            let (successes, failures) = slot.tap.counts();
            record.success_count = successes;
            record.failure_count = failures;
        }
        CapabilityView {
            capability: st.capability.clone(),
            record,
            integrity: st.integrity.clone(),
            rollback: self.rollback.plan(&slot.id),
            effective_fraction: slot.tap.fraction(),
        }
    }

    pub async fn snapshot(&self, id: &CapabilityId) -> Result<CapabilityView> {
        let slot = self.slot(id)?;
        let st = slot.state.lock().await;
        Ok(self.view(&slot, &st))
    }

    /// Every capability, oldest discovery first.
    pub async fn list(&self) -> Vec<CapabilityView> {
        let mut views = Vec::new();
        for slot in self.all_slots() {
            let st = slot.state.lock().await;
            views.push(self.view(&slot, &st));
        }
        views.sort_by(|a, b| {
            a.capability
                .discovered_at
                .cmp(&b.capability.discovered_at)
                .then_with(|| a.capability.id.cmp(&b.capability.id))
        });
        views
    }

    /// Capabilities the control loop should visit: everything not terminal.
    /// Capabilities locked by an in-flight action are included; their
    /// evaluation will report a conflict.
    pub fn eligible(&self) -> Vec<CapabilityId> {
        let mut ids: Vec<CapabilityId> = self
            .all_slots()
            .into_iter()
            .filter(|slot| match slot.state.try_lock() {
                Ok(st) => !st.record.state.is_terminal(),
                Err(_) => true,
            })
            .map(|slot| slot.id.clone())
            .collect();
        for id in self.rollback.active() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids.sort();
        ids
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// Evaluate one capability and apply at most one transition.
    pub async fn evaluate(&self, id: &CapabilityId) -> Result<TransitionOutcome> {
        let slot = self.slot(id)?;
        let Ok(mut st) = slot.state.try_lock() else {
            tracing::debug!(capability_id = %id, "evaluation skipped: capability busy");
            return Ok(TransitionOutcome::Conflict);
        };
        let outcome = self
            .step(&slot, &mut st)
            .instrument(tracing::info_span!("absorb.evaluate", capability_id = %id))
            .await;
        if outcome.is_ok() {
            st.record.consecutive_timeouts = 0;
        }
        outcome
    }

    async fn step(&self, slot: &CapabilitySlot, st: &mut SlotState) -> Result<TransitionOutcome> {
        let now = self.clock.now();
        slot.sync_counts(st);
        match st.record.state {
            LifecycleState::Discovered => self.step_discovered(slot, st, now).await,
            LifecycleState::ShadowTrial => self.step_shadow(slot, st, now).await,
            LifecycleState::Quarantined => self.step_quarantined(slot, st, now).await,
            LifecycleState::Canary => self.step_canary(slot, st, now).await,
            LifecycleState::Promoted => self.step_promoted(slot, st, now).await,
            LifecycleState::RollingBack => self.drive_rollback(slot, st, now, false).await,
            state @ (LifecycleState::Rejected | LifecycleState::RolledBack) => {
                Ok(held(state, HoldReason::Terminal))
            }
        }
    }

    async fn step_discovered(
        &self,
        slot: &CapabilitySlot,
        st: &mut SlotState,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        if st.record.integrity_failed {
            return Ok(held(LifecycleState::Discovered, HoldReason::IntegrityFailed));
        }
        let report = self.verifier.verify(&st.capability.manifest).await;
        if let Some(reason) = report.failure_reason() {
            st.record.integrity_failed = true;
            st.integrity = Some(report);
            obs::emit_integrity_failure(&slot.id, &reason);
            return Err(GovernanceError::IntegrityFailure {
                capability: slot.id.clone(),
                reason,
            });
        }

        st.capability.trust_score =
            supply_chain_score(&report, st.capability.manifest.max_vuln_severity);
        let facts = Facts::new()
            .with_bool("digest_ok", report.digest_ok)
            .with_bool("signature_ok", report.signature_ok)
            .with_bool("sbom_ok", report.sbom_ok)
            .with_bool("provenance_ok", report.provenance_ok)
            .with_number("trust_score", st.capability.trust_score)
            .with_number("redteam_risk", st.redteam.risk_score);
        st.integrity = Some(report);
        self.transition(slot, st, LifecycleState::ShadowTrial, "integrity verified", facts, now)
            .await
    }

    async fn step_shadow(
        &self,
        slot: &CapabilitySlot,
        st: &mut SlotState,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let recorded = self.ledger.len(&slot.variant).await?;
        let shadow_samples = recorded.saturating_sub(st.window.variant);
        if shadow_samples < self.config.lifecycle.min_shadow_samples {
            return Ok(held(LifecycleState::ShadowTrial, HoldReason::AwaitingSamples));
        }
        let evaluation = self
            .evaluator
            .summarize_since(&slot.control, &slot.variant, st.window)
            .await?;
        let verdict = self.config.evaluator.verdict(&evaluation);
        if verdict == Verdict::Insufficient {
            return Ok(held(LifecycleState::ShadowTrial, HoldReason::Insufficient));
        }
        let facts = evaluation_facts(&evaluation, verdict)
            .with_number("shadow_samples", shadow_samples as f64);
        self.transition(slot, st, LifecycleState::Quarantined, "shadow trial complete", facts, now)
            .await
    }

    async fn step_quarantined(
        &self,
        slot: &CapabilitySlot,
        st: &mut SlotState,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let lc = &self.config.lifecycle;
        if st.record.total_outcomes() < lc.min_quarantine_outcomes {
            return Ok(held(LifecycleState::Quarantined, HoldReason::AwaitingSamples));
        }
        let facts = outcome_facts(&st.record)
            .with_bool(
                "ready_to_promote",
                ratios_ok(&st.record, lc.min_quarantine_outcomes, lc),
            )
            .with_number("risk", st.risk())
            .with_number("trust_score", st.capability.trust_score);

        let decision = Decision::AllowPromoteFromQuarantine;
        if !self.ask_gate(&slot.id, decision, &facts, now).await {
            return Ok(TransitionOutcome::Denied {
                state: LifecycleState::Quarantined,
                decision,
            });
        }
        self.transition(slot, st, LifecycleState::Canary, "quarantine passed", facts, now)
            .await
    }

    async fn step_canary(
        &self,
        slot: &CapabilitySlot,
        st: &mut SlotState,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let lc = &self.config.lifecycle;
        let evaluation = self
            .evaluator
            .summarize_since(&slot.control, &slot.variant, st.window)
            .await?;
        let verdict = self.config.evaluator.verdict(&evaluation);
        let canary_passed = ratios_ok(&st.record, lc.min_canary_outcomes, lc);
        let timed_out = now - st.record.state_entered_at >= lc.canary_timeout();
        let budget_exhausted = st.record.total_outcomes() >= lc.canary_sample_budget;

        let facts = merge_facts(evaluation_facts(&evaluation, verdict), outcome_facts(&st.record))
            .with_bool("canary_passed", canary_passed)
            .with_bool("timed_out", timed_out)
            .with_bool("budget_exhausted", budget_exhausted);
        self.emit_canary_decision(&slot.id, LifecycleState::Canary, verdict, &facts, now);

        let expired = if timed_out {
            Some("canary timed out before promotion")
        } else if budget_exhausted {
            Some("canary sample budget exhausted")
        } else {
            None
        };

        match verdict {
            Verdict::Demote => {
                self.transition(slot, st, LifecycleState::Rejected, "evaluator demotion test", facts, now)
                    .await
            }
            Verdict::Promote => {
                let integrity = st.integrity.clone().unwrap_or_default();
                let gate_facts = Facts::new()
                    .with_bool("signature_ok", integrity.signature_ok)
                    .with_bool("sbom_ok", integrity.sbom_ok)
                    .with_bool("provenance_ok", integrity.provenance_ok)
                    .with_bool("canary_passed", canary_passed)
                    .with_number("risk", st.risk())
                    .with_number("trust_score", st.capability.trust_score);
                let decision = Decision::AllowAutoAdopt;
                if self.ask_gate(&slot.id, decision, &gate_facts, now).await {
                    let facts = merge_facts(facts, gate_facts);
                    return self
                        .transition(slot, st, LifecycleState::Promoted, "canary promoted", facts, now)
                        .await;
                }
                match expired {
                    Some(reason) => {
                        self.transition(slot, st, LifecycleState::Rejected, reason, facts, now)
                            .await
                    }
                    None => Ok(TransitionOutcome::Denied {
                        state: LifecycleState::Canary,
                        decision,
                    }),
                }
            }
            Verdict::Hold | Verdict::Insufficient => match expired {
                Some(reason) => {
                    self.transition(slot, st, LifecycleState::Rejected, reason, facts, now)
                        .await
                }
                None => Ok(held(
                    LifecycleState::Canary,
                    if verdict == Verdict::Hold {
                        HoldReason::Hold
                    } else {
                        HoldReason::Insufficient
                    },
                )),
            },
        }
    }

    /// Post-promotion monitoring against live traffic.
    async fn step_promoted(
        &self,
        slot: &CapabilitySlot,
        st: &mut SlotState,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let evaluation = self
            .evaluator
            .summarize_since(&slot.control, &slot.variant, st.window)
            .await?;
        let verdict = self.config.evaluator.verdict(&evaluation);
        let facts = evaluation_facts(&evaluation, verdict);
        self.emit_canary_decision(&slot.id, LifecycleState::Promoted, verdict, &facts, now);

        match (verdict, evaluation.result()) {
            (Verdict::Demote, Some(result)) => {
                let reason = format!("live regression: uplift {:.4}", result.uplift);
                self.begin_rollback(slot, st, &reason, facts, now).await
            }
            (Verdict::Insufficient, _) => Ok(held(LifecycleState::Promoted, HoldReason::Insufficient)),
            _ => Ok(held(LifecycleState::Promoted, HoldReason::Hold)),
        }
    }

    // -----------------------------------------------------------------------
    // Rollback
    // -----------------------------------------------------------------------

    async fn begin_rollback(
        &self,
        slot: &CapabilitySlot,
        st: &mut SlotState,
        reason: &str,
        facts: Facts,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        self.rollback.start(&slot.id, reason, now);
        st.record.last_rollback_reason = Some(reason.to_string());
        self.transition(slot, st, LifecycleState::RollingBack, reason, facts, now)
            .await
    }

    async fn drive_rollback(
        &self,
        slot: &CapabilitySlot,
        st: &mut SlotState,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<TransitionOutcome> {
        let tick = if force {
            self.rollback.advance(&slot.id, now)
        } else {
            self.rollback.tick(&slot.id, now)
        };
        let Some(RollbackTick {
            stage_index,
            fraction,
            advanced,
            complete,
        }) = tick
        else {
            tracing::warn!(capability_id = %slot.id, "rolling back without a plan; completing");
            return self
                .transition(slot, st, LifecycleState::RolledBack, "rollback plan missing", Facts::new(), now)
                .await;
        };

        if advanced {
            st.record.canary_fraction = fraction;
            slot.tap.set_fraction(fraction);
            obs::emit_rollback_stage(&slot.id, stage_index, fraction);
        }
        if complete {
            let facts = Facts::new()
                .with_number("stage_index", stage_index as f64)
                .with_number("fraction", fraction);
            return self
                .transition(slot, st, LifecycleState::RolledBack, "rollback complete", facts, now)
                .await;
        }
        Ok(held(LifecycleState::RollingBack, HoldReason::RollbackInProgress))
    }

    /// Incident trigger. Starts a staged rollback of a promoted capability;
    /// while one is already running, only the reason is recorded.
    pub async fn trigger_rollback(&self, id: &CapabilityId, reason: &str) -> Result<TransitionOutcome> {
        let slot = self.slot(id)?;
        let mut st = slot.state.lock().await;
        let now = self.clock.now();
        match st.record.state {
            LifecycleState::Promoted => {
                let facts = Facts::new().with_bool("incident", true);
                self.begin_rollback(&slot, &mut st, reason, facts, now).await
            }
            LifecycleState::RollingBack => {
                self.rollback.start(id, reason, now);
                st.record.last_rollback_reason = Some(reason.to_string());
                Ok(held(LifecycleState::RollingBack, HoldReason::RollbackInProgress))
            }
            from => Err(GovernanceError::InvalidTransition {
                capability: id.clone(),
                from,
                to: LifecycleState::RollingBack,
            }),
        }
    }

    /// Time-driven rollback tick, independent of the evaluation cycle.
    pub async fn tick_rollback(&self, id: &CapabilityId) -> Result<TransitionOutcome> {
        self.rollback_step(id, false).await
    }

    /// Advance the rollback by exactly one stage regardless of elapsed time.
    pub async fn advance_rollback(&self, id: &CapabilityId) -> Result<TransitionOutcome> {
        self.rollback_step(id, true).await
    }

    async fn rollback_step(&self, id: &CapabilityId, force: bool) -> Result<TransitionOutcome> {
        let slot = self.slot(id)?;
        let mut st = if force {
            slot.state.lock().await
        } else {
            let Ok(st) = slot.state.try_lock() else {
                return Ok(TransitionOutcome::Conflict);
            };
            st
        };
        if st.record.state != LifecycleState::RollingBack {
            return Ok(held(st.record.state, HoldReason::NoActiveRollback));
        }
        let now = self.clock.now();
        self.drive_rollback(&slot, &mut st, now, force).await
    }

    // -----------------------------------------------------------------------
    // External commands
    // -----------------------------------------------------------------------

    /// Explicit re-submission of a rejected, rolled-back or integrity-failed
    /// capability.
    pub async fn resubmit(&self, id: &CapabilityId) -> Result<TransitionOutcome> {
        let slot = self.slot(id)?;
        let mut st = slot.state.lock().await;
        let now = self.clock.now();
        let facts = Facts::new().with_bool("resubmitted", true);
        match st.record.state {
            LifecycleState::Rejected => {
                self.transition(&slot, &mut st, LifecycleState::ShadowTrial, "resubmitted", facts, now)
                    .await
            }
            LifecycleState::RolledBack => {
                if let Some(until) = st.record.cooldown_until.filter(|until| now < *until) {
                    return Err(GovernanceError::CooldownActive {
                        capability: id.clone(),
                        until,
                    });
                }
                self.transition(
                    &slot,
                    &mut st,
                    LifecycleState::Quarantined,
                    "resubmitted after rollback",
                    facts,
                    now,
                )
                .await
            }
            LifecycleState::Discovered if st.record.integrity_failed => {
                st.record.integrity_failed = false;
                st.integrity = None;
                self.step_discovered(&slot, &mut st, now).await
            }
            from => Err(GovernanceError::InvalidTransition {
                capability: id.clone(),
                from,
                to: LifecycleState::ShadowTrial,
            }),
        }
    }

    /// Account for an evaluation abandoned at its deadline. Pre-promotion
    /// capabilities are forced to `Rejected` after too many in a row; below
    /// that limit the timeout is returned as
    /// [`GovernanceError::AdaptationTimeout`].
    pub async fn note_timeout(&self, id: &CapabilityId, timeout_ms: u64) -> Result<TransitionOutcome> {
        let slot = self.slot(id)?;
        let mut st = slot.state.lock().await;
        let now = self.clock.now();
        st.record.consecutive_timeouts += 1;
        let consecutive = st.record.consecutive_timeouts;
        METRICS.inc_adaptation_timeouts();
        obs::emit_adaptation_timeout(id, timeout_ms, consecutive);

        let state = st.record.state;
        let forceable = matches!(
            state,
            LifecycleState::Discovered
                | LifecycleState::ShadowTrial
                | LifecycleState::Quarantined
                | LifecycleState::Canary
        );
        if forceable && consecutive >= self.config.control_loop.max_consecutive_timeouts {
            let facts = Facts::new().with_number("consecutive_timeouts", consecutive as f64);
            let reason = format!("{consecutive} consecutive adaptation timeouts");
            return self
                .transition(&slot, &mut st, LifecycleState::Rejected, &reason, facts, now)
                .await;
        }
        Err(GovernanceError::AdaptationTimeout {
            capability: id.clone(),
            timeout_ms,
            consecutive,
        })
    }

    // -----------------------------------------------------------------------
    // Gate, events and transitions
    // -----------------------------------------------------------------------

    async fn ask_gate(
        &self,
        id: &CapabilityId,
        decision: Decision,
        facts: &Facts,
        now: DateTime<Utc>,
    ) -> bool {
        let allowed = match self.gate.decide(decision, facts).await {
            Ok(allowed) => allowed,
            Err(e) => {
                obs::emit_policy_error(id, decision, &e);
                false
            }
        };
        self.events.emit(&LifecycleEvent::PolicyDecision {
            capability_id: id.clone(),
            decision,
            allowed,
            facts: facts.clone(),
            at: now,
        });
        allowed
    }

    fn emit_canary_decision(
        &self,
        id: &CapabilityId,
        state: LifecycleState,
        verdict: Verdict,
        facts: &Facts,
        now: DateTime<Utc>,
    ) {
        self.events.emit(&LifecycleEvent::CanaryDecision {
            capability_id: id.clone(),
            state,
            verdict: verdict.to_string(),
            facts: facts.clone(),
            at: now,
        });
    }

    async fn current_offsets(&self, slot: &CapabilitySlot) -> Result<ArmOffsets> {
        Ok(ArmOffsets {
            control: self.ledger.len(&slot.control).await?,
            variant: self.ledger.len(&slot.variant).await?,
        })
    }

    /// Apply `to` with its entry actions. The caller holds the slot lock.
    async fn transition(
        &self,
        slot: &CapabilitySlot,
        st: &mut SlotState,
        to: LifecycleState,
        reason: &str,
        facts: Facts,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let from = st.record.state;
        if !from.can_transition_to(to) {
            return Err(GovernanceError::InvalidTransition {
                capability: slot.id.clone(),
                from,
                to,
            });
        }
        // A fresh evaluation window opens with every new trial and at promotion.
        let fresh_window = matches!(
            (from, to),
            (_, LifecycleState::ShadowTrial)
                | (LifecycleState::RolledBack, LifecycleState::Quarantined)
                | (_, LifecycleState::Promoted)
        );
        if fresh_window {
            st.window = self.current_offsets(slot).await?;
        }
        self.apply_transition(slot, st, from, to, reason, facts, now);
        Ok(TransitionOutcome::Transitioned { from, to })
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_transition(
        &self,
        slot: &CapabilitySlot,
        st: &mut SlotState,
        from: LifecycleState,
        to: LifecycleState,
        reason: &str,
        facts: Facts,
        now: DateTime<Utc>,
    ) {
        let _span = CapabilitySpan::enter(&slot.id);
        let lc = &self.config.lifecycle;
        st.record.state = to;
        st.record.state_entered_at = now;

        match to {
            LifecycleState::Discovered => {}
            LifecycleState::ShadowTrial => {
                slot.tap.close();
                slot.tap.reset();
                st.record.canary_fraction = 0.0;
                if from == LifecycleState::Rejected {
                    st.record.trial += 1;
                }
            }
            LifecycleState::Quarantined => {
                slot.tap.open();
                st.record.canary_fraction = lc.quarantine_canary_rate;
                if from == LifecycleState::RolledBack {
                    st.record.trial += 1;
                }
            }
            LifecycleState::Canary => {
                slot.tap.open();
                st.record.canary_fraction = lc.initial_canary_fraction;
            }
            LifecycleState::Promoted => {
                slot.tap.close();
                st.record.canary_fraction = 1.0;
                st.capability.trust_score = promote_trust(st.capability.trust_score, lc.trust_gain);
                METRICS.inc_promotions();
            }
            LifecycleState::Rejected => {
                slot.tap.close();
                st.record.canary_fraction = 0.0;
                METRICS.inc_rejections();
            }
            LifecycleState::RollingBack => {
                slot.tap.close();
                st.record.canary_fraction = self.rollback.effective_fraction(&slot.id).unwrap_or(1.0);
            }
            LifecycleState::RolledBack => {
                slot.tap.close();
                st.record.canary_fraction = 0.0;
                st.record.cooldown_until = Some(now + self.config.rollback.cooldown());
                st.capability.trust_score =
                    penalize_trust(st.capability.trust_score, self.config.rollback.trust_penalty);
                if let Some(plan) = self.rollback.finish(&slot.id) {
                    st.record.last_rollback_reason = Some(plan.reason);
                }
                METRICS.inc_rollbacks();
            }
        }
        if to.counts_canary_outcomes() {
            st.record.success_count = 0;
            st.record.failure_count = 0;
        }
        slot.tap.set_fraction(st.record.canary_fraction);
        METRICS.inc_transitions();

        self.notify_router(slot, st, to);
        self.replicate(slot, st);
        self.events.emit(&LifecycleEvent::Transition {
            capability_id: slot.id.clone(),
            from,
            to,
            reason: reason.to_string(),
            facts,
            at: now,
        });
    }

    fn notify_router(&self, slot: &CapabilitySlot, st: &SlotState, to: LifecycleState) {
        let Some(router) = &self.router else {
            return;
        };
        let candidate = slot.id.as_str();
        router.set_trust(candidate, st.capability.trust_score);
        match to {
            LifecycleState::Rejected | LifecycleState::RolledBack => router.deny(&slot.role, candidate),
            LifecycleState::ShadowTrial | LifecycleState::Quarantined | LifecycleState::Promoted => {
                router.allow(&slot.role, candidate)
            }
            _ => {}
        }
        if router.record_lifecycle_outcome(&slot.role, candidate, to).is_some() {
            if let Some(store) = &self.federation {
                if let Err(e) = router.publish(&slot.role, store) {
                    tracing::warn!(role = %slot.role, error = %e, "router bundle publish failed");
                }
            }
        }
    }

    fn replicate(&self, slot: &CapabilitySlot, st: &SlotState) {
        let Some(store) = &self.federation else {
            return;
        };
        match serde_json::to_value(self.view(slot, st)) {
            Ok(value) => {
                store.put(lifecycle_key(&slot.id), value);
            }
            Err(e) => tracing::warn!(capability_id = %slot.id, error = %e, "lifecycle snapshot not replicated"),
        }
    }
}
