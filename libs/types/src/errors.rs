//! Error types for snapshot construction
//!
//! Comprehensive error taxonomy using thiserror

use thiserror::Error;

/// Reasons a snapshot (or one of its parts) cannot be built
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("Invalid instrument name: {0:?}")]
    InvalidInstrument(String),

    #[error("Negative {field}: {value}")]
    Negative { field: &'static str, value: String },

    #[error("Unrepresentable {field}: {value}")]
    NotRepresentable { field: &'static str, value: String },

    #[error("Crossed book: bid {bid} above ask {ask}")]
    Crossed { bid: String, ask: String },
}
