//! Capability lifecycle state machine.
//!
//! ```text
//! Discovered -> ShadowTrial -> Quarantined -> Canary -> Promoted | Rejected
//! Promoted -> RollingBack -> RolledBack
//! RolledBack -> Quarantined    (explicit re-submission, after cooldown)
//! Rejected -> ShadowTrial      (explicit re-submission)
//! ```
//!
//! Every capability's record is mutated under its own lock. Request-path
//! canary admission and outcome counting go through a lock-free
//! [`CanaryTap`] instead.

pub mod canary;
pub mod engine;
pub mod events;

use serde::{Deserialize, Serialize};

use crate::domain::{Capability, CapabilityId, GovernanceError, LifecycleRecord, LifecycleState, Result};
use crate::integrity::IntegrityReport;
use crate::policy::Decision;
use crate::rollback::RollbackPlan;

pub use canary::CanaryTap;
pub use engine::{lifecycle_key, LifecycleEngine, LifecycleEngineBuilder};
pub use events::{EventSink, LifecycleEvent, MultiSink, RecordingEventSink, TracingEventSink};

/// Which side of a capability's experiment a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmRole {
    /// Incumbent baseline.
    Control,
    /// The candidate.
    Variant,
}

impl ArmRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArmRole::Control => "control",
            ArmRole::Variant => "variant",
        }
    }
}

/// Why an evaluation left the state unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    /// Evaluator reported too few samples.
    Insufficient,
    /// Not enough samples or outcomes to consult the evaluator or gate yet.
    AwaitingSamples,
    /// Evaluator found neither promotion nor demotion.
    Hold,
    /// Rejected or rolled back; only re-submission moves it.
    Terminal,
    /// Manifest failed integrity; only re-submission moves it.
    IntegrityFailed,
    RollbackInProgress,
    NoActiveRollback,
}

/// Result of one attempt to move a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransitionOutcome {
    Transitioned {
        from: LifecycleState,
        to: LifecycleState,
    },
    Held {
        state: LifecycleState,
        reason: HoldReason,
    },
    /// The policy gate refused; the capability stays put.
    Denied {
        state: LifecycleState,
        decision: Decision,
    },
    /// Another action held the capability's lock. Nothing was done.
    Conflict,
}

impl TransitionOutcome {
    pub fn is_transition(&self) -> bool {
        matches!(self, TransitionOutcome::Transitioned { .. })
    }

    /// Target state if this was a transition.
    pub fn to_state(&self) -> Option<LifecycleState> {
        match self {
            TransitionOutcome::Transitioned { to, .. } => Some(*to),
            _ => None,
        }
    }

    /// Surface a gate refusal as [`GovernanceError::PolicyDenied`].
    pub fn into_result(self, capability: &CapabilityId) -> Result<Self> {
        match self {
            TransitionOutcome::Denied { decision, .. } => Err(GovernanceError::PolicyDenied {
                capability: capability.clone(),
                decision: decision.to_string(),
            }),
            other => Ok(other),
        }
    }
}

/// Serialisable audit snapshot of one capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityView {
    pub capability: Capability,
    pub record: LifecycleRecord,
    pub integrity: Option<IntegrityReport>,
    pub rollback: Option<RollbackPlan>,
    /// Share of live traffic currently routed to the capability.
    pub effective_fraction: f64,
}
