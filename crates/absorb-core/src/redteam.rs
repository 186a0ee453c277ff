//! Red-team risk scan of manifest text.
//!
//! Each injection pattern that matches anywhere in the scanned text adds
//! [`PATTERN_WEIGHT`] to the risk score, capped at 1.0. Matching is
//! case-insensitive.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::CapabilityManifest;

pub const PATTERN_WEIGHT: f64 = 0.25;

const INJECTION_PATTERNS: &[&str] = &[
    r"ignore\s+previous\s+instructions",
    r"system\s*prompt",
    r"exfiltrate|leak|steal",
    r"disable\s+safety|jailbreak",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RedteamScan {
    pub risk_score: f64,
    /// Patterns that matched, in scan order.
    pub matches: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RedteamScanner {
    patterns: Vec<(String, Regex)>,
}

impl Default for RedteamScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl RedteamScanner {
    pub fn new() -> Self {
        let patterns = INJECTION_PATTERNS
            .iter()
            .filter_map(|p| {
                Regex::new(&format!("(?i){p}"))
                    .ok()
                    .map(|re| (p.to_string(), re))
            })
            .collect();
        Self { patterns }
    }

    pub fn scan(&self, text: &str) -> RedteamScan {
        let matches: Vec<String> = self
            .patterns
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(p, _)| p.clone())
            .collect();
        RedteamScan {
            risk_score: (matches.len() as f64 * PATTERN_WEIGHT).min(1.0),
            matches,
        }
    }

    /// Scan the manifest's free-text fields: name, declared capabilities and
    /// egress scope.
    pub fn scan_manifest(&self, manifest: &CapabilityManifest) -> RedteamScan {
        let mut text = manifest.name.clone();
        for field in manifest.capabilities.iter().chain(&manifest.egress_scope) {
            text.push('\n');
            text.push_str(field);
        }
        self.scan(&text)
    }
}
