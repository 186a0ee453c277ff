//! Domain models for capability absorption.
//!
//! Canonical definitions for the core entities:
//! - `CapabilityManifest`: signed description of a candidate capability
//! - `Capability`: a discovered candidate with its trust score
//! - `LifecycleState` / `LifecycleRecord`: where a candidate is in its trial

pub mod capability;
pub mod error;

pub use capability::{
    Capability, CapabilityId, CapabilityKind, CapabilityManifest, LifecycleRecord, LifecycleState,
    Severity,
};
pub use error::{GovernanceError, Result};
