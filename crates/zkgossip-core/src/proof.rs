//! Proof-system capabilities
//!
//! Nodes never embed circuit logic in membership or gossip code. They are
//! handed a [`Verifier`] (and, when they originate messages, a [`Prover`])
//! at construction time.
//!
//! The bundled backend is an ed25519 attestation scheme: setup produces a
//! proving key and a verifying key once, the verifying key is distributed to
//! every node, the prover refuses to attest to an unsatisfied witness, and a
//! proof is a signature over the statement digest. A zk-SNARK backend plugs in
//! through the same traits.
//!
//! Statement public inputs are the circuit's own inputs followed by
//! [`PAYLOAD_BINDING_WORDS`] words binding the payload (see
//! [`crate::crypto::payload_binding`]). The relation never reads them, but
//! the proof covers them, so a proof cannot be reused for another payload.

use crate::crypto::{bind_payload, statement_digest, PAYLOAD_BINDING_WORDS};
use crate::types::*;
use ed25519_dalek::{Signature, Signer, SigningKey};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Length of an attestation proof (an ed25519 signature)
pub const ATTESTATION_PROOF_LEN: usize = 64;

/// Proof system errors
#[derive(Debug, Error)]
pub enum ProofError {
    #[error("unknown circuit: {0}")]
    UnknownCircuit(CircuitId),
    #[error("witness does not satisfy circuit {0}")]
    Unsatisfied(CircuitId),
    #[error("witness shape mismatch for {circuit}: {reason}")]
    WitnessShape { circuit: CircuitId, reason: String },
    #[error("malformed proof: {0}")]
    MalformedProof(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("statement encoding failed: {0}")]
    Statement(String),
}

// =============================================================================
// CIRCUITS
// =============================================================================

/// A relation over a public and a secret assignment
pub trait Circuit: Send + Sync {
    fn id(&self) -> CircuitId;

    /// Number of public inputs the relation reads, payload binding excluded
    fn public_arity(&self) -> usize;

    /// Number of secret inputs
    fn secret_arity(&self) -> usize;

    /// Check the relation; the witness shape has already been validated
    fn is_satisfied(&self, witness: &Witness) -> bool;
}

/// `a * b == c` with secret `(a, b)` and public `c`
#[derive(Debug, Clone, Copy, Default)]
pub struct MulCircuit;

impl Circuit for MulCircuit {
    fn id(&self) -> CircuitId {
        CircuitId::new("mul")
    }

    fn public_arity(&self) -> usize {
        1
    }

    fn secret_arity(&self) -> usize {
        2
    }

    fn is_satisfied(&self, witness: &Witness) -> bool {
        witness.secret[0].checked_mul(witness.secret[1]) == Some(witness.public[0])
    }
}

/// `a + b == c` with secret `(a, b)` and public `c`
#[derive(Debug, Clone, Copy, Default)]
pub struct AddCircuit;

impl Circuit for AddCircuit {
    fn id(&self) -> CircuitId {
        CircuitId::new("add")
    }

    fn public_arity(&self) -> usize {
        1
    }

    fn secret_arity(&self) -> usize {
        2
    }

    fn is_satisfied(&self, witness: &Witness) -> bool {
        witness.secret[0].checked_add(witness.secret[1]) == Some(witness.public[0])
    }
}

/// Circuits known to a prover or verifier
#[derive(Clone, Default)]
pub struct CircuitRegistry {
    circuits: HashMap<CircuitId, Arc<dyn Circuit>>,
}

impl CircuitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the bundled `mul` and `add` circuits
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MulCircuit));
        registry.register(Arc::new(AddCircuit));
        registry
    }

    pub fn register(&mut self, circuit: Arc<dyn Circuit>) {
        self.circuits.insert(circuit.id(), circuit);
    }

    pub fn get(&self, id: &CircuitId) -> Result<&Arc<dyn Circuit>, ProofError> {
        self.circuits
            .get(id)
            .ok_or_else(|| ProofError::UnknownCircuit(id.clone()))
    }

    /// Check a witness against a circuit, shape first.
    ///
    /// The public part must carry the payload binding after the circuit's
    /// own inputs.
    pub fn check(&self, id: &CircuitId, witness: &Witness) -> Result<(), ProofError> {
        let circuit = self.get(id)?;
        let expected = circuit.public_arity() + PAYLOAD_BINDING_WORDS;
        if witness.public.len() != expected {
            return Err(ProofError::WitnessShape {
                circuit: id.clone(),
                reason: format!(
                    "expected {} public inputs, got {}",
                    expected,
                    witness.public.len()
                ),
            });
        }
        if witness.secret.len() != circuit.secret_arity() {
            return Err(ProofError::WitnessShape {
                circuit: id.clone(),
                reason: format!(
                    "expected {} secret inputs, got {}",
                    circuit.secret_arity(),
                    witness.secret.len()
                ),
            });
        }
        if !circuit.is_satisfied(witness) {
            return Err(ProofError::Unsatisfied(id.clone()));
        }
        Ok(())
    }
}

impl fmt::Debug for CircuitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.circuits.keys().collect();
        ids.sort();
        f.debug_struct("CircuitRegistry").field("circuits", &ids).finish()
    }
}

// =============================================================================
// CAPABILITIES
// =============================================================================

/// Produces proofs; only needed by nodes that originate messages
pub trait Prover: Send + Sync {
    fn prove(&self, circuit_id: &CircuitId, witness: &Witness) -> Result<Vec<u8>, ProofError>;
}

/// Checks proofs; every node holds one
pub trait Verifier: Send + Sync {
    /// `Ok(false)` for a well-formed but invalid proof, `Err` when the proof
    /// could not be checked at all
    fn verify(
        &self,
        circuit_id: &CircuitId,
        proof: &[u8],
        public_inputs: &[u64],
    ) -> Result<bool, ProofError>;
}

/// Prove `witness` bound to `payload` and wrap the result.
///
/// `witness.public` holds only the circuit's inputs; the payload binding is
/// appended here.
pub fn seal(
    prover: &dyn Prover,
    circuit_id: &CircuitId,
    witness: &Witness,
    payload: Vec<u8>,
) -> Result<ProofEnvelope, ProofError> {
    let bound = Witness::new(bind_payload(&witness.public, &payload), witness.secret.clone());
    let proof = prover.prove(circuit_id, &bound)?;
    Ok(ProofEnvelope {
        circuit_id: circuit_id.clone(),
        proof,
        public_inputs: bound.public,
        payload,
    })
}

// =============================================================================
// ATTESTATION BACKEND
// =============================================================================

/// Secret half of the setup output
#[derive(Clone)]
pub struct ProvingKey {
    signing_key: SigningKey,
}

/// Public half of the setup output, distributed to every verifier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifyingKey(ed25519_dalek::VerifyingKey);

impl ProvingKey {
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.signing_key.verifying_key())
    }
}

impl VerifyingKey {
    pub fn from_bytes(bytes: &Bytes32) -> Result<Self, ProofError> {
        ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| ProofError::InvalidKey(e.to_string()))
    }

    /// Parse a hex-encoded key as printed by [`VerifyingKey::to_hex`]
    pub fn from_hex(s: &str) -> Result<Self, ProofError> {
        let raw = hex::decode(s.trim()).map_err(|e| ProofError::InvalidKey(e.to_string()))?;
        let bytes: Bytes32 = raw
            .try_into()
            .map_err(|_| ProofError::InvalidKey("expected 32 bytes".into()))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> Bytes32 {
        self.0.to_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

/// Run setup once from a shared seed.
///
/// Every node that derives keys from the same seed ends up with the same
/// verifying key; nodes that only verify should be given the verifying key
/// instead of the seed.
pub fn setup(seed: &Bytes32) -> (ProvingKey, VerifyingKey) {
    let signing_key = SigningKey::from_bytes(seed);
    let proving_key = ProvingKey { signing_key };
    let verifying_key = proving_key.verifying_key();
    (proving_key, verifying_key)
}

/// Prover half of the attestation backend
pub struct AttestationProver {
    key: ProvingKey,
    circuits: CircuitRegistry,
}

impl AttestationProver {
    pub fn new(key: ProvingKey, circuits: CircuitRegistry) -> Self {
        Self { key, circuits }
    }
}

impl Prover for AttestationProver {
    fn prove(&self, circuit_id: &CircuitId, witness: &Witness) -> Result<Vec<u8>, ProofError> {
        self.circuits.check(circuit_id, witness)?;
        let statement = statement_digest(circuit_id, &witness.public)
            .map_err(|e| ProofError::Statement(e.to_string()))?;
        Ok(self.key.signing_key.sign(&statement).to_bytes().to_vec())
    }
}

/// Verifier half of the attestation backend
pub struct AttestationVerifier {
    key: VerifyingKey,
    circuits: CircuitRegistry,
}

impl AttestationVerifier {
    pub fn new(key: VerifyingKey, circuits: CircuitRegistry) -> Self {
        Self { key, circuits }
    }
}

impl Verifier for AttestationVerifier {
    fn verify(
        &self,
        circuit_id: &CircuitId,
        proof: &[u8],
        public_inputs: &[u64],
    ) -> Result<bool, ProofError> {
        let circuit = self.circuits.get(circuit_id)?;
        if public_inputs.len() != circuit.public_arity() + PAYLOAD_BINDING_WORDS {
            return Ok(false);
        }

        let sig_bytes: [u8; ATTESTATION_PROOF_LEN] = proof.try_into().map_err(|_| {
            ProofError::MalformedProof(format!(
                "expected {} bytes, got {}",
                ATTESTATION_PROOF_LEN,
                proof.len()
            ))
        })?;
        let signature = Signature::from_bytes(&sig_bytes);

        let statement = statement_digest(circuit_id, public_inputs)
            .map_err(|e| ProofError::Statement(e.to_string()))?;
        Ok(self.key.0.verify_strict(&statement, &signature).is_ok())
    }
}
