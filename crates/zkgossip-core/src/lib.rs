//! zkgossip Core Library
//!
//! This crate provides the wire types, canonical encoding, identifiers and
//! proof-system capabilities shared by every zkgossip node.
//!
//! # Modules
//!
//! - [`types`]: Membership records, protocol messages, proof envelopes
//! - [`canonical`]: Deterministic serialization and input validation
//! - [`crypto`]: Domain-separated BLAKE3 identifiers
//! - [`proof`]: Circuit, prover and verifier capabilities
//! - [`error`]: Error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod proof;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
