//! Federated convergence layer.
//!
//! Clusters exchange [`ConvergentEntry`] snapshots over an external
//! transport and merge them with last-writer-wins semantics. Merges commute,
//! associate and are idempotent, so partitions and reordering are harmless.

pub mod aggregator;
pub mod lww;
pub mod store;

pub use aggregator::{ClusterDrift, ClusterSample, DriftReport, FederatedAggregator, GlobalSummary};
pub use lww::{merge_entries, ConvergentEntry, LamportClock, LwwMap};
pub use store::{decode_entries, encode_entries, ReplicatedStore};
