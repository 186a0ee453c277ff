//! Domain-level error taxonomy for capability governance.
//!
//! Insufficient evaluator data and lock races are not errors: they surface as
//! `Verdict::Insufficient` and `TransitionOutcome::Conflict` respectively.

use chrono::{DateTime, Utc};

use crate::domain::capability::{CapabilityId, LifecycleState};

/// Capability governance errors.
#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    #[error("capability not found: {0}")]
    CapabilityNotFound(CapabilityId),

    #[error("integrity check failed for {capability}: {reason}")]
    IntegrityFailure {
        capability: CapabilityId,
        reason: String,
    },

    #[error("policy gate denied {decision} for {capability}")]
    PolicyDenied {
        capability: CapabilityId,
        decision: String,
    },

    #[error("adaptation for {capability} exceeded {timeout_ms}ms ({consecutive} in a row)")]
    AdaptationTimeout {
        capability: CapabilityId,
        timeout_ms: u64,
        consecutive: u32,
    },

    #[error("invalid transition for {capability}: {from} -> {to}")]
    InvalidTransition {
        capability: CapabilityId,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("capability {capability} is cooling down until {until}")]
    CooldownActive {
        capability: CapabilityId,
        until: DateTime<Utc>,
    },

    #[error("invalid rollback plan: {0}")]
    InvalidRollbackPlan(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("ledger error: {0}")]
    Ledger(#[from] absorb_ledger::LedgerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for governance operations.
pub type Result<T> = std::result::Result<T, GovernanceError>;
