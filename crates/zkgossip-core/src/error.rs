//! Error types for zkgossip

use crate::proof::ProofError;
use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// zkgossip error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Record failed structural validation
    #[error("invalid node record: {0}")]
    InvalidRecord(String),

    /// Field exceeds its size bound
    #[error("{field} too large: {size} bytes (max {max})")]
    TooLarge {
        field: &'static str,
        size: usize,
        max: usize,
    },

    /// Missing required field
    #[error("missing required field: {0}")]
    MissingField(String),

    /// Proof system failure
    #[error("proof error: {0}")]
    Proof(#[from] ProofError),
}
