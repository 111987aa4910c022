//! Core protocol types for zkgossip
//!
//! All types here are designed for deterministic serialization via postcard.
//! Field order matters for canonical encoding.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::SocketAddr;

/// 32-byte fixed-size array used for hashes and identifiers.
pub type Bytes32 = [u8; 32];

/// Per-node counter ordering that node's own state claims.
pub type Incarnation = u32;

/// Probe sequence number.
pub type SeqNo = u32;

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

/// Unique node name within a cluster
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Application message identifier: BLAKE3("message" || encoded envelope)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub Bytes32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Name of the relation a proof is checked against
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CircuitId(pub String);

impl CircuitId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// MEMBERSHIP
// =============================================================================

/// Liveness state of a member.
///
/// The discriminant doubles as the tie-break rank when two claims carry the
/// same incarnation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeState {
    Alive = 0,
    Suspect = 1,
    Dead = 2,
    Left = 3,
}

impl NodeState {
    pub fn rank(self) -> u8 {
        self as u8
    }

    /// Alive or Suspect; counts towards cluster size
    pub fn is_live(self) -> bool {
        matches!(self, NodeState::Alive | NodeState::Suspect)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Alive => "alive",
            NodeState::Suspect => "suspect",
            NodeState::Dead => "dead",
            NodeState::Left => "left",
        };
        f.write_str(name)
    }
}

/// A claim about one node's liveness, as gossiped between members
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub addr: SocketAddr,
    /// Opaque delegate metadata
    pub meta: Vec<u8>,
    pub incarnation: Incarnation,
    pub state: NodeState,
}

impl NodeRecord {
    /// Create an alive record
    pub fn alive(id: NodeId, addr: SocketAddr, incarnation: Incarnation) -> Self {
        Self {
            id,
            addr,
            meta: Vec::new(),
            incarnation,
            state: NodeState::Alive,
        }
    }

    /// Copy of this record carrying a different claim
    pub fn with_claim(&self, state: NodeState, incarnation: Incarnation) -> Self {
        Self {
            state,
            incarnation,
            ..self.clone()
        }
    }

    /// Ordering key used to reconcile two claims about the same node
    pub fn precedence(&self) -> (Incarnation, u8) {
        (self.incarnation, self.state.rank())
    }

    /// Whether this claim wins over `other`.
    ///
    /// Conflicting claims of equal precedence are settled by address, then
    /// metadata, so every member keeps the same one whatever the arrival
    /// order.
    pub fn supersedes(&self, other: &NodeRecord) -> bool {
        match self.precedence().cmp(&other.precedence()) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => (&self.addr, &self.meta) > (&other.addr, &other.meta),
        }
    }
}

// =============================================================================
// PROTOCOL MESSAGES
// =============================================================================

/// Direct liveness probe
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Ping {
    pub seq_no: SeqNo,
    /// Intended recipient; a node that is not the target ignores the ping
    pub target: NodeId,
    pub source: NodeId,
    pub source_addr: SocketAddr,
}

/// Request for an intermediary to probe `target` on the sender's behalf
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IndirectPing {
    pub seq_no: SeqNo,
    pub target: NodeId,
    pub target_addr: SocketAddr,
    pub source: NodeId,
    pub source_addr: SocketAddr,
    /// Ask the intermediary to answer with a nack if the target stays silent
    pub nack: bool,
}

/// Positive probe response
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Ack {
    pub seq_no: SeqNo,
}

/// Intermediary could not reach the target
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Nack {
    pub seq_no: SeqNo,
}

/// Membership change disseminated through the broadcast queue
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MembershipUpdate {
    pub record: NodeRecord,
    /// Node that observed the change
    pub from: NodeId,
}

/// Full-state exchange used by anti-entropy and join
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PushPull {
    pub join: bool,
    pub source: NodeId,
    pub records: Vec<NodeRecord>,
    /// Delegate-provided application state
    pub user_state: Vec<u8>,
}

// =============================================================================
// PROOFS
// =============================================================================

/// Application payload together with the proof gating its acceptance
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProofEnvelope {
    pub circuit_id: CircuitId,
    pub proof: Vec<u8>,
    pub public_inputs: Vec<u64>,
    /// Plaintext handed to the application once the proof verifies
    pub payload: Vec<u8>,
}

/// Circuit assignment split into its public and secret parts
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Witness {
    pub public: Vec<u64>,
    pub secret: Vec<u64>,
}

impl Witness {
    pub fn new(public: Vec<u64>, secret: Vec<u64>) -> Self {
        Self { public, secret }
    }
}
