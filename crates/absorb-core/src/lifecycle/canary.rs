//! Request-path canary admission.
//!
//! The tap sits outside the per-capability lock: routing is a coin flip
//! against an atomically published fraction, and outcome counting is two
//! atomic increments. The lifecycle engine republishes the fraction and
//! opens or closes counting on every transition.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rand::Rng;

#[derive(Debug, Default)]
pub struct CanaryTap {
    counting: AtomicBool,
    fraction_bits: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl CanaryTap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fraction(&self) -> f64 {
        f64::from_bits(self.fraction_bits.load(Ordering::Acquire))
    }

    pub fn set_fraction(&self, fraction: f64) {
        self.fraction_bits
            .store(fraction.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    /// Independent Bernoulli trial with probability [`Self::fraction`].
    pub fn admit<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        let p = self.fraction();
        if p <= 0.0 {
            return false;
        }
        if p >= 1.0 {
            return true;
        }
        rng.random::<f64>() < p
    }

    pub fn is_counting(&self) -> bool {
        self.counting.load(Ordering::Acquire)
    }

    /// Zero the counters and start accepting outcomes.
    pub fn open(&self) {
        self.reset();
        self.counting.store(true, Ordering::Release);
    }

    pub fn close(&self) {
        self.counting.store(false, Ordering::Release);
    }

    pub fn reset(&self) {
        self.successes.store(0, Ordering::Release);
        self.failures.store(0, Ordering::Release);
    }

    /// Count one pass/fail signal. Returns false when counting is closed.
    pub fn record(&self, passed: bool) -> bool {
        if !self.is_counting() {
            return false;
        }
        let counter = if passed {
            &self.successes
        } else {
            &self.failures
        };
        counter.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// `(successes, failures)`
    pub fn counts(&self) -> (u64, u64) {
        (
            self.successes.load(Ordering::Acquire),
            self.failures.load(Ordering::Acquire),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn closed_tap_ignores_outcomes() {
        let tap = CanaryTap::new();
        assert!(!tap.record(true));
        tap.open();
        assert!(tap.record(true));
        assert!(tap.record(false));
        assert_eq!(tap.counts(), (1, 1));
        tap.close();
        assert!(!tap.record(true));
        assert_eq!(tap.counts(), (1, 1));
    }

    #[test]
    fn reopen_resets_counts() {
        let tap = CanaryTap::new();
        tap.open();
        tap.record(true);
        tap.open();
        assert_eq!(tap.counts(), (0, 0));
    }

    #[test]
    fn admission_rate_tracks_fraction() {
        let tap = CanaryTap::new();
        let mut rng = StdRng::seed_from_u64(42);
        assert!(!tap.admit(&mut rng));

        tap.set_fraction(0.1);
        let admitted = (0..20_000).filter(|_| tap.admit(&mut rng)).count();
        let rate = admitted as f64 / 20_000.0;
        assert!((rate - 0.1).abs() < 0.01, "rate {rate}");

        tap.set_fraction(1.0);
        assert!(tap.admit(&mut rng));
    }

    #[test]
    fn fraction_is_clamped() {
        let tap = CanaryTap::new();
        tap.set_fraction(3.0);
        assert_eq!(tap.fraction(), 1.0);
    }
}
