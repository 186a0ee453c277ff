//! Periodic adaptation loop.
//!
//! Each cycle visits every non-terminal capability (which includes every
//! active rollback) and runs one evaluation per capability. Evaluations run
//! concurrently but never more than `max_concurrency` at once, and each is
//! abandoned at `action_timeout`. An abandoned evaluation is counted against
//! the capability and simply retried on the next cycle.
//!
//! When the engine has an aggregator, each cycle ends with a drift check of
//! every tenant and arm it holds samples for.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{instrument, warn};

use crate::config::ControlLoopConfig;
use crate::domain::{CapabilityId, GovernanceError, LifecycleState};
use crate::federation::ClusterDrift;
use crate::lifecycle::{ArmRole, LifecycleEngine, TransitionOutcome};
use crate::metrics::METRICS;
use crate::obs;

/// What happened to one capability during a cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionResult {
    Completed(TransitionOutcome),
    Failed(String),
    /// Deadline exceeded; `forced` carries the outcome of timeout accounting.
    TimedOut { forced: Option<TransitionOutcome> },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub evaluated: usize,
    pub transitions: Vec<(CapabilityId, LifecycleState, LifecycleState)>,
    pub held: usize,
    pub denied: Vec<CapabilityId>,
    pub conflicts: Vec<CapabilityId>,
    pub timed_out: Vec<CapabilityId>,
    pub failed: Vec<(CapabilityId, String)>,
    /// Drifting clusters as `(tenant, arm, drift)`.
    pub drift: Vec<(String, ArmRole, ClusterDrift)>,
}

impl CycleReport {
    fn absorb(&mut self, id: CapabilityId, result: ActionResult) {
        self.evaluated += 1;
        match result {
            ActionResult::Completed(TransitionOutcome::Transitioned { from, to }) => {
                self.transitions.push((id, from, to))
            }
            ActionResult::Completed(TransitionOutcome::Held { .. }) => self.held += 1,
            ActionResult::Completed(TransitionOutcome::Denied { .. }) => self.denied.push(id),
            ActionResult::Completed(TransitionOutcome::Conflict) => self.conflicts.push(id),
            ActionResult::Failed(error) => self.failed.push((id, error)),
            ActionResult::TimedOut { forced } => {
                if let Some(TransitionOutcome::Transitioned { from, to }) = forced {
                    self.transitions.push((id.clone(), from, to));
                }
                self.timed_out.push(id);
            }
        }
    }

    pub fn state_of(&self, id: &CapabilityId) -> Option<LifecycleState> {
        self.transitions
            .iter()
            .rev()
            .find(|(t, _, _)| t == id)
            .map(|(_, _, to)| *to)
    }
}

pub struct ControlLoop {
    engine: Arc<LifecycleEngine>,
    config: ControlLoopConfig,
}

impl ControlLoop {
    pub fn new(engine: Arc<LifecycleEngine>) -> Self {
        let config = engine.config().control_loop.clone();
        Self { engine, config }
    }

    pub fn engine(&self) -> &Arc<LifecycleEngine> {
        &self.engine
    }

    /// Run a single cycle over all eligible capabilities.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();
        let sem = Arc::new(Semaphore::new(self.config.max_concurrency));
        let timeout = self.config.action_timeout();
        let timeout_ms = self.config.action_timeout_ms;

        let tasks = self.engine.eligible().into_iter().map(|id| {
            let engine = Arc::clone(&self.engine);
            let sem = Arc::clone(&sem);
            let task_id = id.clone();
            let handle = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                match tokio::time::timeout(timeout, engine.evaluate(&task_id)).await {
                    Ok(Ok(outcome)) => ActionResult::Completed(outcome),
                    Ok(Err(e)) => {
                        obs::emit_adaptation_failed(&task_id, &e);
                        ActionResult::Failed(e.to_string())
                    }
                    Err(_) => {
                        let forced = match engine.note_timeout(&task_id, timeout_ms).await {
                            Ok(outcome) => Some(outcome),
                            Err(GovernanceError::AdaptationTimeout { .. }) => None,
                            Err(e) => {
                                warn!(capability_id = %task_id, error = %e, "timeout accounting failed");
                                None
                            }
                        };
                        ActionResult::TimedOut { forced }
                    }
                }
            });
            async move { (id, handle.await) }
        });

        let mut report = CycleReport::default();
        for (id, joined) in futures::future::join_all(tasks).await {
            match joined {
                Ok(result) => report.absorb(id, result),
                Err(e) => report.absorb(id, ActionResult::Failed(format!("task panicked: {e}"))),
            }
        }
        report.drift = self.check_drift();

        obs::emit_cycle_finished(
            report.evaluated,
            report.transitions.len(),
            report.timed_out.len(),
            started.elapsed().as_millis() as u64,
        );
        METRICS.flush();
        report
    }

    fn check_drift(&self) -> Vec<(String, ArmRole, ClusterDrift)> {
        let Some(aggregator) = self.engine.aggregator() else {
            return Vec::new();
        };
        let mut drift = Vec::new();
        for tenant in aggregator.tenants() {
            for arm in [ArmRole::Control, ArmRole::Variant] {
                for outlier in aggregator.detect_cluster_drift(&tenant, arm).outliers {
                    obs::emit_cluster_drift(
                        &tenant,
                        arm.as_str(),
                        &outlier.cluster_id,
                        outlier.mean_score,
                        outlier.z_score,
                    );
                    drift.push((tenant.clone(), arm, outlier));
                }
            }
        }
        drift
    }

    /// Tick on a fixed interval until `shutdown` becomes true or its sender
    /// is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("control loop stopping");
                        break;
                    }
                }
            }
        }
    }
}
