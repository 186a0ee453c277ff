//! Absorb-Ledger: append-only outcome storage for capability experiments
//!
//! Every candidate capability is compared against a baseline through two
//! experiment arms. Each arm accumulates immutable [`Sample`]s (score, cost,
//! latency, domain tag) in insertion order.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: append-only semantics, replayability, no deletion API.
//! Retention and compaction are an external concern.
//!
//! ## Key Components
//!
//! - `OutcomeLedger`: async storage trait (open arm, record, read)
//! - `MemoryOutcomeLedger`: in-process implementation used by tests and the daemon
//! - `JsonlOutcomeLedger`: newline-delimited JSON files, one per arm

mod error;
pub mod fakes;
pub mod jsonl;
pub mod ledger;

pub use error::LedgerError;
pub use fakes::MemoryOutcomeLedger;
pub use jsonl::JsonlOutcomeLedger;
pub use ledger::{ArmId, LedgerResult, OutcomeLedger, Sample};
