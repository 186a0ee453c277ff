//! Absorb Core: capability lifecycle governance
//!
//! Moves candidate capabilities (agents, model backends, tools, playbook
//! variants) from untrusted discovery through statistically validated trial
//! into production, and rolls them back in stages when they regress.
//!
//! ## Layer 1 - Domain Logic
//!
//! - `evaluator`: Welch's t-test and stratified bootstrap over ledger samples
//! - `lifecycle`: per-capability state machine, canary tap, event sink seam
//! - `policy` / `integrity`: external decision and verification seams
//! - `redteam`: injection-pattern risk scan of manifest text
//! - `rollback`: staged blast-radius reduction
//! - `router_weights`: trust-aware routing weights with smoothing
//! - `federation`: last-writer-wins convergence across clusters
//! - `control_loop`: bounded, timed periodic adaptation

pub mod clock;
pub mod config;
pub mod control_loop;
pub mod domain;
pub mod evaluator;
pub mod federation;
pub mod integrity;
pub mod lifecycle;
pub mod metrics;
pub mod obs;
pub mod policy;
pub mod redteam;
pub mod rollback;
pub mod router_weights;
pub mod telemetry;
pub mod trust;

pub use absorb_ledger::{
    ArmId, JsonlOutcomeLedger, LedgerError, MemoryOutcomeLedger, OutcomeLedger, Sample,
};

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ControlLoopConfig, EvaluatorConfig, FederationConfig, GovernanceConfig, LifecycleConfig,
    RollbackConfig, RouterConfig, TelemetryConfig,
};
pub use control_loop::{ActionResult, ControlLoop, CycleReport};
pub use domain::{
    Capability, CapabilityId, CapabilityKind, CapabilityManifest, GovernanceError,
    LifecycleRecord, LifecycleState, Result, Severity,
};
pub use evaluator::{
    summarize_samples, ArmOffsets, Evaluation, EvaluationResult, ExperimentEvaluator, Verdict,
};
pub use federation::{
    ConvergentEntry, FederatedAggregator, LamportClock, LwwMap, ReplicatedStore,
};
pub use integrity::{Attestations, DigestIntegrityVerifier, IntegrityReport, IntegrityVerifier};
pub use lifecycle::{
    ArmRole, CapabilityView, EventSink, HoldReason, LifecycleEngine, LifecycleEvent, MultiSink,
    RecordingEventSink, TracingEventSink, TransitionOutcome,
};
pub use metrics::METRICS;
pub use policy::{Decision, Facts, PolicyGate, PolicyRule, StaticPolicyGate};
pub use redteam::{RedteamScan, RedteamScanner};
pub use rollback::{RollbackController, RollbackPlan};
pub use router_weights::{RouterWeightAdapter, WeightBundle};
pub use telemetry::{init_tracing, LogFormat};
pub use trust::TrustTier;
