//! Canonical encoding for zkgossip
//!
//! Every message on the wire is postcard-encoded. Decoding untrusted input
//! goes through the validators here before it reaches membership state.

use crate::crypto::PAYLOAD_BINDING_WORDS;
use crate::error::{Error, Result};
use crate::types::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Maximum size of delegate metadata carried in a NodeRecord
pub const META_MAX_SIZE: usize = 512;

/// Maximum length of a node name
pub const NODE_NAME_MAX_LEN: usize = 128;

/// Maximum proof size accepted from the network
pub const PROOF_MAX_SIZE: usize = 4096;

/// Maximum number of public inputs in an envelope, payload binding included
pub const PUBLIC_INPUTS_MAX: usize = 64;

/// Maximum application payload carried by one envelope
pub const PAYLOAD_MAX_SIZE: usize = 1024;

/// Serialize a value to canonical bytes using postcard.
///
/// This is the normative encoding for all hashing and wire operations.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Decode a value previously produced by [`canonical_bytes`].
pub fn from_canonical_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(Error::from)
}

/// Check a record received from a peer.
pub fn validate_record(record: &NodeRecord) -> Result<()> {
    if record.id.as_str().is_empty() {
        return Err(Error::InvalidRecord("empty node name".into()));
    }
    if record.id.as_str().len() > NODE_NAME_MAX_LEN {
        return Err(Error::TooLarge {
            field: "node name",
            size: record.id.as_str().len(),
            max: NODE_NAME_MAX_LEN,
        });
    }
    if record.meta.len() > META_MAX_SIZE {
        return Err(Error::TooLarge {
            field: "meta",
            size: record.meta.len(),
            max: META_MAX_SIZE,
        });
    }
    Ok(())
}

/// Check an envelope received from a peer before it reaches the verifier.
pub fn validate_envelope(envelope: &ProofEnvelope) -> Result<()> {
    if envelope.circuit_id.as_str().is_empty() {
        return Err(Error::MissingField("circuit_id".into()));
    }
    if envelope.proof.is_empty() {
        return Err(Error::MissingField("proof".into()));
    }
    if envelope.proof.len() > PROOF_MAX_SIZE {
        return Err(Error::TooLarge {
            field: "proof",
            size: envelope.proof.len(),
            max: PROOF_MAX_SIZE,
        });
    }
    if envelope.public_inputs.len() > PUBLIC_INPUTS_MAX {
        return Err(Error::TooLarge {
            field: "public_inputs",
            size: envelope.public_inputs.len(),
            max: PUBLIC_INPUTS_MAX,
        });
    }
    if envelope.public_inputs.len() < PAYLOAD_BINDING_WORDS {
        return Err(Error::MissingField("payload binding".into()));
    }
    if envelope.payload.len() > PAYLOAD_MAX_SIZE {
        return Err(Error::TooLarge {
            field: "payload",
            size: envelope.payload.len(),
            max: PAYLOAD_MAX_SIZE,
        });
    }
    Ok(())
}

/// Decode and validate an envelope in one step.
pub fn decode_envelope(bytes: &[u8]) -> Result<ProofEnvelope> {
    let envelope: ProofEnvelope = from_canonical_bytes(bytes)?;
    validate_envelope(&envelope)?;
    Ok(envelope)
}
