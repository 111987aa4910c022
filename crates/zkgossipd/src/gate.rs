//! Verification gate for inbound application messages
//!
//! Every user payload is decoded as a proof envelope and its proof checked
//! before the application sees it. Only verified messages are re-gossiped;
//! anything else is dropped and logged under the `zkgossip::security` target.
//! Verification runs on the blocking pool so a slow proof cannot stall
//! failure detection.

use crate::state::Cluster;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use zkgossip_core::canonical::decode_envelope;
use zkgossip_core::crypto::{is_bound_to, message_id};
use zkgossip_core::proof::Verifier;
use zkgossip_core::types::MessageId;

/// What happened to a submitted message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Proof verified; handed to the delegate and queued for re-gossip
    Delivered(MessageId),
    /// Already processed
    Duplicate,
    /// Not a valid envelope
    Malformed,
    /// Well-formed envelope with an invalid proof or a payload its proof
    /// does not cover
    Rejected,
    /// Proof could not be checked
    Failed,
    /// Gate closed while verifying
    Discarded,
}

/// Message ids seen recently, kept in two generations
#[derive(Debug, Default)]
struct SeenSet {
    current: HashSet<MessageId>,
    previous: HashSet<MessageId>,
    capacity: usize,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ..Self::default()
        }
    }

    /// Returns false if `id` was already present
    fn insert(&mut self, id: MessageId) -> bool {
        if self.previous.contains(&id) || !self.current.insert(id) {
            return false;
        }
        if self.current.len() >= self.capacity {
            self.previous = std::mem::take(&mut self.current);
        }
        true
    }
}

/// Gate counters
#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    delivered: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

/// Gate statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateStats {
    pub received: u64,
    pub delivered: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub rejected: u64,
    pub failed: u64,
}

/// Checks proofs before delivery
pub struct VerificationGate {
    verifier: Arc<dyn Verifier>,
    cluster: Arc<Cluster>,
    permits: Arc<Semaphore>,
    seen: Mutex<SeenSet>,
    closed: AtomicBool,
    counters: Counters,
}

impl VerificationGate {
    pub fn new(
        verifier: Arc<dyn Verifier>,
        cluster: Arc<Cluster>,
        max_concurrent: usize,
        seen_capacity: usize,
    ) -> Self {
        Self {
            verifier,
            cluster,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            seen: Mutex::new(SeenSet::new(seen_capacity)),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// Record a message we originated so its echoes are not re-processed
    pub fn mark_seen(&self, id: MessageId) -> bool {
        self.seen.lock().insert(id)
    }

    /// Verify in the background
    pub fn submit(self: &Arc<Self>, bytes: Vec<u8>, from: SocketAddr) {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            gate.process(bytes, from).await;
        });
    }

    /// Verify an encoded envelope and deliver it if the proof holds
    pub async fn process(&self, bytes: Vec<u8>, from: SocketAddr) -> GateOutcome {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let id = message_id(&bytes);
        if !self.mark_seen(id) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            return GateOutcome::Duplicate;
        }

        let envelope = match decode_envelope(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed message {} from {}: {}", id, from, e);
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                return GateOutcome::Malformed;
            }
        };

        if !is_bound_to(&envelope.public_inputs, &envelope.payload) {
            warn!(
                target: "zkgossip::security",
                "Rejected message {} from {}: payload does not match its {} statement",
                id, from, envelope.circuit_id
            );
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return GateOutcome::Rejected;
        }

        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return GateOutcome::Discarded;
        };
        let verifier = Arc::clone(&self.verifier);
        let verified = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let result = verifier.verify(&envelope.circuit_id, &envelope.proof, &envelope.public_inputs);
            (envelope, result)
        })
        .await;

        if self.closed.load(Ordering::Acquire) {
            debug!("Discarding verification of {} after shutdown", id);
            return GateOutcome::Discarded;
        }

        match verified {
            Ok((envelope, Ok(true))) => {
                debug!("Verified message {} from {} ({})", id, from, envelope.circuit_id);
                self.cluster.delegate().notify_msg(&envelope.payload);
                self.cluster.update(|s| s.enqueue_message(id, bytes));
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                GateOutcome::Delivered(id)
            }
            Ok((envelope, Ok(false))) => {
                warn!(
                    target: "zkgossip::security",
                    "Rejected message {} from {}: invalid {} proof",
                    id, from, envelope.circuit_id
                );
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                GateOutcome::Rejected
            }
            Ok((envelope, Err(e))) => {
                warn!(
                    target: "zkgossip::security",
                    "Could not verify message {} from {} ({}): {}",
                    id, from, envelope.circuit_id, e
                );
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                GateOutcome::Failed
            }
            Err(e) => {
                warn!("Verification task for {} failed: {}", id, e);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                GateOutcome::Failed
            }
        }
    }

    /// Stop delivering; in-flight results are discarded
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            received: self.counters.received.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastKey;
    use crate::config::NodeConfig;
    use crate::delegate::{ChannelDelegate, DelegateEvent};
    use crate::state::ClusterState;
    use std::time::Instant;
    use tokio::sync::mpsc;
    use zkgossip_core::canonical::canonical_bytes;
    use zkgossip_core::crypto::{bind_payload, derive_setup_seed};
    use zkgossip_core::proof::{seal, setup, AttestationProver, AttestationVerifier, CircuitRegistry};
    use zkgossip_core::types::{CircuitId, NodeId, ProofEnvelope, Witness};

    const FROM: &str = "127.0.0.1:9000";

    struct Harness {
        gate: VerificationGate,
        cluster: Arc<Cluster>,
        events: mpsc::UnboundedReceiver<DelegateEvent>,
        prover: AttestationProver,
    }

    fn harness() -> Harness {
        let (proving, verifying) = setup(&derive_setup_seed("gate tests"));
        let addr: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let config = Arc::new(NodeConfig::lan(NodeId::from("a"), addr));
        let state = ClusterState::new(config, addr, Vec::new(), Instant::now());
        let (delegate, events) = ChannelDelegate::new();
        let cluster = Arc::new(Cluster::new(state, Arc::new(delegate)));
        let verifier = Arc::new(AttestationVerifier::new(verifying, CircuitRegistry::builtin()));
        Harness {
            gate: VerificationGate::new(verifier, Arc::clone(&cluster), 2, 16),
            cluster,
            events,
            prover: AttestationProver::new(proving, CircuitRegistry::builtin()),
        }
    }

    fn mul_envelope(h: &Harness, payload: &[u8]) -> ProofEnvelope {
        let witness = Witness::new(vec![6], vec![2, 3]);
        seal(&h.prover, &CircuitId::new("mul"), &witness, payload.to_vec()).unwrap()
    }

    fn messages(events: &mut mpsc::UnboundedReceiver<DelegateEvent>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let DelegateEvent::Message(payload) = event {
                out.push(payload);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_valid_proof_delivered_once() {
        let mut h = harness();
        let bytes = canonical_bytes(&mul_envelope(&h, b"hello")).unwrap();
        let id = message_id(&bytes);

        let outcome = h.gate.process(bytes.clone(), FROM.parse().unwrap()).await;
        assert_eq!(outcome, GateOutcome::Delivered(id));
        assert_eq!(
            h.gate.process(bytes, FROM.parse().unwrap()).await,
            GateOutcome::Duplicate
        );

        assert_eq!(messages(&mut h.events), vec![b"hello".to_vec()]);
        assert!(h
            .cluster
            .read(|s| s.queue().contains(&BroadcastKey::Application(id))));
    }

    #[tokio::test]
    async fn test_invalid_proof_never_delivered_or_queued() {
        let mut h = harness();
        let mut envelope = mul_envelope(&h, b"forged");
        envelope.public_inputs[0] = 7;
        let bytes = canonical_bytes(&envelope).unwrap();
        let id = message_id(&bytes);

        assert_eq!(
            h.gate.process(bytes, FROM.parse().unwrap()).await,
            GateOutcome::Rejected
        );
        assert!(messages(&mut h.events).is_empty());
        assert!(!h
            .cluster
            .read(|s| s.queue().contains(&BroadcastKey::Application(id))));
        assert_eq!(h.gate.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_replayed_proof_with_swapped_payload_rejected() {
        let mut h = harness();
        let original = mul_envelope(&h, b"legit");
        let mut replay = original.clone();
        replay.payload = b"evil".to_vec();
        let bytes = canonical_bytes(&replay).unwrap();
        let id = message_id(&bytes);

        assert_eq!(
            h.gate.process(bytes, FROM.parse().unwrap()).await,
            GateOutcome::Rejected
        );
        assert!(messages(&mut h.events).is_empty());
        assert!(!h
            .cluster
            .read(|s| s.queue().contains(&BroadcastKey::Application(id))));

        // re-binding the inputs to the new payload breaks the proof instead
        let mut rebound = original.clone();
        rebound.public_inputs = bind_payload(&original.public_inputs[..1], b"evil");
        rebound.payload = b"evil".to_vec();
        assert_eq!(
            h.gate
                .process(canonical_bytes(&rebound).unwrap(), FROM.parse().unwrap())
                .await,
            GateOutcome::Rejected
        );
        assert!(messages(&mut h.events).is_empty());
        assert_eq!(h.gate.stats().rejected, 2);

        let outcome = h
            .gate
            .process(canonical_bytes(&original).unwrap(), FROM.parse().unwrap())
            .await;
        assert!(matches!(outcome, GateOutcome::Delivered(_)));
        assert_eq!(messages(&mut h.events), vec![b"legit".to_vec()]);
    }

    #[tokio::test]
    async fn test_proof_from_other_setup_rejected() {
        let mut h = harness();
        let (foreign, _) = setup(&derive_setup_seed("someone else"));
        let foreign = AttestationProver::new(foreign, CircuitRegistry::builtin());
        let envelope = seal(
            &foreign,
            &CircuitId::new("mul"),
            &Witness::new(vec![6], vec![2, 3]),
            b"spoof".to_vec(),
        )
        .unwrap();

        let outcome = h
            .gate
            .process(canonical_bytes(&envelope).unwrap(), FROM.parse().unwrap())
            .await;
        assert_eq!(outcome, GateOutcome::Rejected);
        assert!(messages(&mut h.events).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_and_unverifiable_dropped() {
        let mut h = harness();

        let outcome = h.gate.process(vec![0xff; 7], FROM.parse().unwrap()).await;
        assert_eq!(outcome, GateOutcome::Malformed);

        let mut envelope = mul_envelope(&h, b"short");
        envelope.proof.truncate(10);
        let outcome = h
            .gate
            .process(canonical_bytes(&envelope).unwrap(), FROM.parse().unwrap())
            .await;
        assert_eq!(outcome, GateOutcome::Failed);

        assert!(messages(&mut h.events).is_empty());
        let stats = h.gate.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test]
    async fn test_closed_gate_discards() {
        let mut h = harness();
        h.gate.close();
        let bytes = canonical_bytes(&mul_envelope(&h, b"late")).unwrap();
        assert_eq!(
            h.gate.process(bytes, FROM.parse().unwrap()).await,
            GateOutcome::Discarded
        );
        assert!(messages(&mut h.events).is_empty());
    }

    #[test]
    fn test_seen_set_rotates() {
        let mut seen = SeenSet::new(2);
        assert!(seen.insert(MessageId([1; 32])));
        assert!(seen.insert(MessageId([2; 32])));
        // rotated into the previous generation but still remembered
        assert!(!seen.insert(MessageId([1; 32])));
        assert!(seen.insert(MessageId([3; 32])));
        assert!(seen.insert(MessageId([4; 32])));
        // two rotations later the first id is forgotten
        assert!(seen.insert(MessageId([1; 32])));
    }
}
