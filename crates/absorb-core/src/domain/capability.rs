//! Capability identity, manifest and lifecycle record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Unique identifier for a candidate capability
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CapabilityId(pub String);

impl CapabilityId {
    /// Generate a new random CapabilityId
    pub fn new() -> Self {
        CapabilityId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CapabilityId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CapabilityId {
    fn from(s: &str) -> Self {
        CapabilityId(s.to_string())
    }
}

impl From<String> for CapabilityId {
    fn from(s: String) -> Self {
        CapabilityId(s)
    }
}

impl std::fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What sort of thing is being absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Agent,
    Model,
    Tool,
    PlaybookVariant,
}

/// Highest known vulnerability severity reported for a capability's artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

/// Signed description of a candidate capability, as submitted for discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityManifest {
    pub name: String,
    pub kind: CapabilityKind,
    pub version: String,
    /// Routing role the capability competes for (e.g. `coder`, `reviewer`).
    pub role: String,
    /// Declared cost per request.
    pub cost: f64,
    /// Declared latency envelope in milliseconds.
    pub latency_ms: f64,
    pub capabilities: Vec<String>,
    pub egress_scope: Vec<String>,
    /// Safety risk score in 0.0–1.0.
    pub risk_score: f64,
    #[serde(default)]
    pub max_vuln_severity: Severity,
    #[serde(default)]
    pub tenant: Option<String>,
    /// SHA-256 hex digest of [`CapabilityManifest::canonical_body`].
    #[serde(default)]
    pub content_digest: String,
    #[serde(default)]
    pub signature: Option<String>,
}

/// Fields covered by the content digest; excludes the digest and signature.
#[derive(Serialize)]
struct ManifestBody<'a> {
    name: &'a str,
    kind: CapabilityKind,
    version: &'a str,
    role: &'a str,
    cost: f64,
    latency_ms: f64,
    capabilities: &'a [String],
    egress_scope: &'a [String],
    risk_score: f64,
    max_vuln_severity: Severity,
    tenant: &'a Option<String>,
}

impl CapabilityManifest {
    /// Create an unsigned manifest with an empty cost envelope.
    pub fn new(name: impl Into<String>, kind: CapabilityKind, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            version: "0.1.0".to_string(),
            role: role.into(),
            cost: 0.0,
            latency_ms: 0.0,
            capabilities: Vec::new(),
            egress_scope: Vec::new(),
            risk_score: 0.0,
            max_vuln_severity: Severity::None,
            tenant: None,
            content_digest: String::new(),
            signature: None,
        }
    }

    pub fn with_envelope(mut self, cost: f64, latency_ms: f64) -> Self {
        self.cost = cost;
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_risk(mut self, risk_score: f64) -> Self {
        self.risk_score = risk_score;
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Canonical JSON bytes of the digest-covered fields.
    pub fn canonical_body(&self) -> Vec<u8> {
        let body = ManifestBody {
            name: &self.name,
            kind: self.kind,
            version: &self.version,
            role: &self.role,
            cost: self.cost,
            latency_ms: self.latency_ms,
            capabilities: &self.capabilities,
            egress_scope: &self.egress_scope,
            risk_score: self.risk_score,
            max_vuln_severity: self.max_vuln_severity,
            tenant: &self.tenant,
        };
        // Serializing a struct of plain fields cannot fail.
        serde_json::to_vec(&body).unwrap_or_default()
    }

    /// SHA-256 hex digest of the canonical body.
    pub fn compute_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_body());
        hex::encode(hasher.finalize())
    }

    /// Stamp `content_digest` with the digest of the current body.
    pub fn sealed(mut self) -> Self {
        self.content_digest = self.compute_digest();
        self
    }
}

/// A discovered candidate. Never deleted, only moved to a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub id: CapabilityId,
    pub manifest: CapabilityManifest,
    /// Trust in 0.0–1.0 derived from provenance and canary history.
    pub trust_score: f64,
    pub discovered_at: DateTime<Utc>,
}

/// Position of a capability in its trial lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Discovered,
    ShadowTrial,
    Quarantined,
    Canary,
    Promoted,
    Rejected,
    RollingBack,
    RolledBack,
}

impl LifecycleState {
    /// States that never advance without an explicit external re-submission.
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Rejected | LifecycleState::RolledBack)
    }

    /// Whether `self -> to` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Discovered, ShadowTrial)
                | (ShadowTrial, Quarantined)
                | (Quarantined, Canary)
                | (Canary, Promoted)
                | (Canary, Rejected)
                | (Promoted, RollingBack)
                | (RollingBack, RolledBack)
                // explicit re-submission
                | (RolledBack, Quarantined)
                | (Rejected, ShadowTrial)
                // forced after repeated adaptation timeouts
                | (Discovered, Rejected)
                | (ShadowTrial, Rejected)
                | (Quarantined, Rejected)
        )
    }

    /// Whether live canary outcomes are being counted in this state.
    pub fn counts_canary_outcomes(self) -> bool {
        matches!(self, LifecycleState::Quarantined | LifecycleState::Canary)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Discovered => "discovered",
            LifecycleState::ShadowTrial => "shadow_trial",
            LifecycleState::Quarantined => "quarantined",
            LifecycleState::Canary => "canary",
            LifecycleState::Promoted => "promoted",
            LifecycleState::Rejected => "rejected",
            LifecycleState::RollingBack => "rolling_back",
            LifecycleState::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// Audit view of one capability's lifecycle.
///
/// # Invariants
///
/// `canary_fraction` stays within 0.0–1.0. `success_count + failure_count`
/// only grows while the state counts canary outcomes; it restarts from zero on
/// entry to `Quarantined` and `Canary`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub state: LifecycleState,
    pub state_entered_at: DateTime<Utc>,
    pub success_count: u64,
    pub failure_count: u64,
    pub canary_fraction: f64,
    pub cooldown_until: Option<DateTime<Utc>>,
    /// 1 for the first trial, incremented on each re-submission.
    pub trial: u32,
    pub consecutive_timeouts: u32,
    pub integrity_failed: bool,
    pub last_rollback_reason: Option<String>,
}

impl LifecycleRecord {
    pub fn total_outcomes(&self) -> u64 {
        self.success_count + self.failure_count
    }

    pub fn success_ratio(&self) -> Option<f64> {
        let total = self.total_outcomes();
        (total > 0).then(|| self.success_count as f64 / total as f64)
    }

    pub fn failure_ratio(&self) -> Option<f64> {
        let total = self.total_outcomes();
        (total > 0).then(|| self.failure_count as f64 / total as f64)
    }
}
