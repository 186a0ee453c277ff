//! In-memory outcome ledger
//!
//! `MemoryOutcomeLedger` satisfies the `OutcomeLedger` contract without any
//! external storage. The critical section is a single `Vec::push`, so it is
//! safe to call from the live request path.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::LedgerError;
use crate::ledger::{ArmId, LedgerResult, OutcomeLedger, Sample};

/// In-memory ledger backed by a `BTreeMap<ArmId, Vec<Sample>>`.
#[derive(Debug, Default)]
pub struct MemoryOutcomeLedger {
    arms: Mutex<BTreeMap<ArmId, Vec<Sample>>>,
}

impl MemoryOutcomeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn arms(&self) -> MutexGuard<'_, BTreeMap<ArmId, Vec<Sample>>> {
        // A panic while holding the lock cannot leave a half-written Vec, so
        // the data is still consistent after poisoning.
        self.arms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn not_found(arm: &ArmId) -> LedgerError {
    LedgerError::ArmNotFound {
        arm: arm.to_string(),
    }
}

#[async_trait]
impl OutcomeLedger for MemoryOutcomeLedger {
    async fn open_arm(&self, experiment: &str, arm: &str) -> LedgerResult<ArmId> {
        let id = ArmId::new(experiment, arm);
        self.arms().entry(id.clone()).or_default();
        Ok(id)
    }

    async fn record(&self, arm: &ArmId, sample: Sample) -> LedgerResult<usize> {
        sample.validate()?;
        let mut arms = self.arms();
        let samples = arms.get_mut(arm).ok_or_else(|| not_found(arm))?;
        samples.push(sample);
        Ok(samples.len())
    }

    async fn read(&self, arm: &ArmId) -> LedgerResult<Vec<Sample>> {
        self.arms().get(arm).cloned().ok_or_else(|| not_found(arm))
    }

    async fn len(&self, arm: &ArmId) -> LedgerResult<usize> {
        self.arms()
            .get(arm)
            .map(Vec::len)
            .ok_or_else(|| not_found(arm))
    }

    async fn arms(&self, experiment: &str) -> LedgerResult<Vec<ArmId>> {
        Ok(self
            .arms()
            .keys()
            .filter(|id| id.experiment == experiment)
            .cloned()
            .collect())
    }
}
