//! Hash derivations for zkgossip
//!
//! All hash derivations use BLAKE3 with domain separation prefixes.

use crate::canonical::canonical_bytes;
use crate::error::Result;
use crate::types::*;
use blake3::Hasher;

// =============================================================================
// DOMAIN SEPARATION PREFIXES
// =============================================================================

/// Domain prefix for application message ids
pub const DOMAIN_MESSAGE: &[u8] = b"message";
/// Domain prefix for proof statements
pub const DOMAIN_STATEMENT: &[u8] = b"statement";
/// Domain prefix for shared setup seeds
pub const DOMAIN_SETUP: &[u8] = b"setup";
/// Domain prefix for payload bindings
pub const DOMAIN_PAYLOAD: &[u8] = b"payload";

/// Trailing public inputs that bind a statement to its payload
pub const PAYLOAD_BINDING_WORDS: usize = 4;

// =============================================================================
// SETUP
// =============================================================================

/// Normalize a phrase: lowercase, trim, collapse whitespace to single hyphen.
pub fn normalize_phrase(phrase: &str) -> String {
    phrase
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Derive the shared setup seed from an operator phrase.
///
/// `seed = BLAKE3("setup" || phrase_norm)`
pub fn derive_setup_seed(phrase: &str) -> Bytes32 {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_SETUP);
    hasher.update(normalize_phrase(phrase).as_bytes());
    *hasher.finalize().as_bytes()
}

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Compute the id of an encoded application message.
///
/// `MessageId = BLAKE3("message" || bytes)`
pub fn message_id(bytes: &[u8]) -> MessageId {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_MESSAGE);
    hasher.update(bytes);
    MessageId(*hasher.finalize().as_bytes())
}

/// Compute the digest a proof attests to.
///
/// `statement = BLAKE3("statement" || canonical_bytes((circuit_id, public_inputs)))`
pub fn statement_digest(circuit_id: &CircuitId, public_inputs: &[u64]) -> Result<Bytes32> {
    let bytes = canonical_bytes(&(circuit_id, public_inputs))?;

    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_STATEMENT);
    hasher.update(&bytes);
    Ok(*hasher.finalize().as_bytes())
}

// =============================================================================
// PAYLOAD BINDING
// =============================================================================

/// Digest of an application payload as public input words.
///
/// `binding = BLAKE3("payload" || payload)`, split into little-endian u64s
pub fn payload_binding(payload: &[u8]) -> [u64; PAYLOAD_BINDING_WORDS] {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_PAYLOAD);
    hasher.update(payload);
    let digest = hasher.finalize();

    let mut words = [0u64; PAYLOAD_BINDING_WORDS];
    for (word, chunk) in words.iter_mut().zip(digest.as_bytes().chunks_exact(8)) {
        let mut le = [0u8; 8];
        le.copy_from_slice(chunk);
        *word = u64::from_le_bytes(le);
    }
    words
}

/// Append the payload binding to a circuit's public inputs
pub fn bind_payload(public_inputs: &[u64], payload: &[u8]) -> Vec<u64> {
    let mut bound = Vec::with_capacity(public_inputs.len() + PAYLOAD_BINDING_WORDS);
    bound.extend_from_slice(public_inputs);
    bound.extend_from_slice(&payload_binding(payload));
    bound
}

/// True if the trailing public inputs are the binding of `payload`
pub fn is_bound_to(public_inputs: &[u64], payload: &[u8]) -> bool {
    public_inputs.len() >= PAYLOAD_BINDING_WORDS
        && public_inputs[public_inputs.len() - PAYLOAD_BINDING_WORDS..] == payload_binding(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phrase_normalization() {
        assert_eq!(normalize_phrase("  Hello World  "), "hello-world");
        assert_eq!(normalize_phrase("ONE"), "one");
        assert_eq!(normalize_phrase("a  b   c"), "a-b-c");
    }

    #[test]
    fn test_setup_seed_derivation() {
        let seed = derive_setup_seed("shared cluster setup");
        assert_eq!(seed, derive_setup_seed("Shared   Cluster setup"));
        assert_ne!(seed, derive_setup_seed("other setup"));
    }

    #[test]
    fn test_message_id_deterministic() {
        assert_eq!(message_id(b"abc"), message_id(b"abc"));
        assert_ne!(message_id(b"abc"), message_id(b"abd"));
    }

    #[test]
    fn test_statement_binds_circuit_and_inputs() {
        let mul = CircuitId::new("mul");
        let add = CircuitId::new("add");

        let s1 = statement_digest(&mul, &[6]).unwrap();
        assert_eq!(s1, statement_digest(&mul, &[6]).unwrap());
        assert_ne!(s1, statement_digest(&mul, &[7]).unwrap());
        assert_ne!(s1, statement_digest(&add, &[6]).unwrap());
    }

    #[test]
    fn test_payload_binding() {
        let bound = bind_payload(&[6], b"hello");
        assert_eq!(bound.len(), 1 + PAYLOAD_BINDING_WORDS);
        assert_eq!(bound[0], 6);
        assert!(is_bound_to(&bound, b"hello"));
        assert!(!is_bound_to(&bound, b"hellO"));
        assert!(!is_bound_to(&[6], b"hello"));
        assert_ne!(payload_binding(b""), payload_binding(b"\0"));
    }
}
