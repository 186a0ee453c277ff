//! Global atomic counters for capability governance.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a control-loop cycle).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lock-free counters.
pub struct Metrics {
    transitions: AtomicU64,
    canary_routes: AtomicU64,
    promotions: AtomicU64,
    rejections: AtomicU64,
    rollbacks: AtomicU64,
    adaptation_timeouts: AtomicU64,
    federation_merges: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            transitions: AtomicU64::new(0),
            canary_routes: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            adaptation_timeouts: AtomicU64::new(0),
            federation_merges: AtomicU64::new(0),
        }
    }

    pub fn inc_transitions(&self) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "transitions", "counter incremented");
    }

    /// One request routed to a candidate.
    pub fn inc_canary_routes(&self) {
        self.canary_routes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_promotions(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "promotions", "counter incremented");
    }

    pub fn inc_rejections(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "rejections", "counter incremented");
    }

    /// Completed rollbacks.
    pub fn inc_rollbacks(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "rollbacks", "counter incremented");
    }

    pub fn inc_adaptation_timeouts(&self) {
        self.adaptation_timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "adaptation_timeouts", "counter incremented");
    }

    /// Entries that changed local state during a federation merge.
    pub fn add_federation_merges(&self, n: u64) {
        self.federation_merges.fetch_add(n, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            transitions = self.transitions(),
            canary_routes = self.canary_routes(),
            promotions = self.promotions(),
            rejections = self.rejections(),
            rollbacks = self.rollbacks(),
            adaptation_timeouts = self.adaptation_timeouts(),
            federation_merges = self.federation_merges(),
        );
    }

    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    pub fn canary_routes(&self) -> u64 {
        self.canary_routes.load(Ordering::Relaxed)
    }

    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    pub fn adaptation_timeouts(&self) -> u64 {
        self.adaptation_timeouts.load(Ordering::Relaxed)
    }

    pub fn federation_merges(&self) -> u64 {
        self.federation_merges.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.transitions,
            &self.canary_routes,
            &self.promotions,
            &self.rejections,
            &self.rollbacks,
            &self.adaptation_timeouts,
            &self.federation_merges,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_transitions();
        m.inc_transitions();
        assert_eq!(m.transitions(), 2);

        m.inc_promotions();
        m.inc_rollbacks();
        m.add_federation_merges(3);
        assert_eq!(m.promotions(), 1);
        assert_eq!(m.rollbacks(), 1);
        assert_eq!(m.federation_merges(), 3);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_canary_routes();
        m.inc_rejections();
        m.inc_adaptation_timeouts();
        m.reset();
        assert_eq!(m.canary_routes(), 0);
        assert_eq!(m.rejections(), 0);
        assert_eq!(m.adaptation_timeouts(), 0);
    }
}
