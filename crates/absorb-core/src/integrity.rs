//! Manifest integrity seam.
//!
//! Signature and attestation checks are external predicates. The core
//! recomputes the manifest content digest itself and consumes everything
//! else as pass/fail flags.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::CapabilityManifest;

/// Pass/fail flags produced by an [`IntegrityVerifier`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Content digest matches the canonical manifest body.
    pub digest_ok: bool,
    pub signature_ok: bool,
    pub sbom_ok: bool,
    pub provenance_ok: bool,
    /// Artifact is recorded in a transparency log.
    pub transparency_log_ok: bool,
}

impl IntegrityReport {
    /// A manifest may leave `Discovered` only when digest and signature hold.
    pub fn passed(&self) -> bool {
        self.digest_ok && self.signature_ok
    }

    pub fn failure_reason(&self) -> Option<String> {
        match (self.digest_ok, self.signature_ok) {
            (true, true) => None,
            (false, _) => Some("content digest mismatch".to_string()),
            (true, false) => Some("signature rejected".to_string()),
        }
    }
}

#[async_trait]
pub trait IntegrityVerifier: Send + Sync {
    async fn verify(&self, manifest: &CapabilityManifest) -> IntegrityReport;
}

/// Supply-chain attestations other than the signature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestations {
    pub sbom_ok: bool,
    pub provenance_ok: bool,
    pub transparency_log_ok: bool,
}

impl Attestations {
    pub fn all() -> Self {
        Self {
            sbom_ok: true,
            provenance_ok: true,
            transparency_log_ok: true,
        }
    }
}

type ManifestPredicate<T> = Arc<dyn Fn(&CapabilityManifest) -> T + Send + Sync>;

/// Recomputes the SHA-256 content digest and delegates the signature and
/// attestation checks to caller-supplied closures.
///
/// Attestations default to "none present" until [`Self::with_attestations`]
/// supplies a source.
#[derive(Clone)]
pub struct DigestIntegrityVerifier {
    signature: ManifestPredicate<bool>,
    attestations: ManifestPredicate<Attestations>,
}

impl DigestIntegrityVerifier {
    pub fn new(signature: impl Fn(&CapabilityManifest) -> bool + Send + Sync + 'static) -> Self {
        Self {
            signature: Arc::new(signature),
            attestations: Arc::new(|_| Attestations::default()),
        }
    }

    pub fn with_attestations(
        mut self,
        attestations: impl Fn(&CapabilityManifest) -> Attestations + Send + Sync + 'static,
    ) -> Self {
        self.attestations = Arc::new(attestations);
        self
    }

    /// Accepts any manifest carrying a signature and reports every
    /// attestation as present.
    pub fn accept_signed() -> Self {
        Self::new(|m| m.signature.is_some()).with_attestations(|_| Attestations::all())
    }
}

impl std::fmt::Debug for DigestIntegrityVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestIntegrityVerifier").finish_non_exhaustive()
    }
}

#[async_trait]
impl IntegrityVerifier for DigestIntegrityVerifier {
    async fn verify(&self, manifest: &CapabilityManifest) -> IntegrityReport {
        let digest_ok =
            !manifest.content_digest.is_empty() && manifest.compute_digest() == manifest.content_digest;
        let att = (self.attestations)(manifest);
        IntegrityReport {
            digest_ok,
            signature_ok: (self.signature)(manifest),
            sbom_ok: att.sbom_ok,
            provenance_ok: att.provenance_ok,
            transparency_log_ok: att.transparency_log_ok,
        }
    }
}
