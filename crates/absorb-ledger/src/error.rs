//! Error types for absorb-ledger

use thiserror::Error;

/// Errors that can occur in the outcome ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Arm was never opened
    #[error("Arm not found: {arm}")]
    ArmNotFound { arm: String },

    /// Experiment or arm name cannot be used as a storage key
    #[error("Invalid arm name: {name}")]
    InvalidName { name: String },

    /// Sample carries a value with no stable encoding
    #[error("Invalid sample: {field} is {value}")]
    InvalidSample { field: &'static str, value: f64 },

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// A stored line could not be decoded
    #[error("Corrupt ledger entry in {arm} at line {line}: {reason}")]
    Corrupt {
        arm: String,
        line: usize,
        reason: String,
    },

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}
