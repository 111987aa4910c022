//! Cluster state: membership transitions behind a single lock
//!
//! [`ClusterState`] owns the registry, the broadcast queue and the suspicion
//! timers. Every mutation goes through [`Cluster::update`], so concurrent
//! probes and inbound packets never race on merges or transmit counters.
//! Methods take an explicit `now` and never touch the network.

use crate::broadcast::{BroadcastKey, BroadcastQueue};
use crate::config::NodeConfig;
use crate::delegate::Delegate;
use crate::membership::{MembershipStats, MergeOutcome, Registry};
use crate::suspicion::{confirmations_needed, suspicion_timeout, Suspicion};
use parking_lot::Mutex;
use rand::seq::{IteratorRandom, SliceRandom};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use zkgossip_core::canonical::validate_record;
use zkgossip_core::types::*;
use zkgossip_net::{Frame, FrameType};

/// A state change to report to the delegate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub id: NodeId,
    pub old: Option<NodeState>,
    pub new: NodeState,
}

/// Membership state of one node
#[derive(Debug)]
pub struct ClusterState {
    config: Arc<NodeConfig>,
    local: NodeId,
    local_addr: SocketAddr,
    incarnation: Incarnation,
    leaving: bool,
    registry: Registry,
    queue: BroadcastQueue,
    suspicions: HashMap<NodeId, Suspicion>,
    probe_order: Vec<NodeId>,
    probe_index: usize,
    seq_no: SeqNo,
    changes: Vec<MembershipChange>,
}

impl ClusterState {
    /// Create state containing only the local node, alive at incarnation 1
    pub fn new(config: Arc<NodeConfig>, local_addr: SocketAddr, meta: Vec<u8>, now: Instant) -> Self {
        let local = config.name.clone();
        let mut record = NodeRecord::alive(local.clone(), local_addr, 1);
        record.meta = meta;

        let mut registry = Registry::new();
        registry.merge_at(record.clone(), now);

        let mut state = Self {
            queue: BroadcastQueue::new(config.retransmit_mult),
            config,
            local,
            local_addr,
            incarnation: 1,
            leaving: false,
            registry,
            suspicions: HashMap::new(),
            probe_order: Vec::new(),
            probe_index: 0,
            seq_no: 0,
            changes: Vec::new(),
        };
        state.queue_update(record, None);
        state
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    pub fn is_leaving(&self) -> bool {
        self.leaving
    }

    /// Our own record as currently advertised
    pub fn local_record(&self) -> NodeRecord {
        self.registry
            .record(&self.local)
            .cloned()
            .unwrap_or_else(|| NodeRecord::alive(self.local.clone(), self.local_addr, self.incarnation))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn queue(&self) -> &BroadcastQueue {
        &self.queue
    }

    pub fn suspicion(&self, id: &NodeId) -> Option<&Suspicion> {
        self.suspicions.get(id)
    }

    /// Live members, the local node included
    pub fn cluster_size(&self) -> usize {
        self.registry.size()
    }

    pub fn next_seq_no(&mut self) -> SeqNo {
        self.seq_no = self.seq_no.wrapping_add(1);
        self.seq_no
    }

    /// Take the changes accumulated since the last call
    pub fn drain_changes(&mut self) -> Vec<MembershipChange> {
        std::mem::take(&mut self.changes)
    }

    // =========================================================================
    // MEMBERSHIP UPDATES
    // =========================================================================

    /// Apply a gossiped membership update; returns whether the view changed
    pub fn handle_update(&mut self, update: MembershipUpdate, now: Instant) -> bool {
        if let Err(e) = validate_record(&update.record) {
            warn!("Dropping invalid update from {}: {}", update.from, e);
            return false;
        }

        let MembershipUpdate { record, from } = update;
        match record.state {
            NodeState::Alive => self.handle_alive(record, now),
            NodeState::Suspect => self.handle_suspect(record, &from, now),
            NodeState::Dead | NodeState::Left => self.handle_dead(record, now),
        }
    }

    fn handle_alive(&mut self, record: NodeRecord, now: Instant) -> bool {
        if record.id == self.local {
            let echo = record.incarnation <= self.incarnation && record.addr == self.local_addr;
            if !echo && !self.leaving {
                if record.addr != self.local_addr {
                    warn!(
                        "Node {} at {} claims our identity (incarnation {})",
                        record.id, record.addr, record.incarnation
                    );
                }
                self.refute(record.incarnation, now);
            }
            return false;
        }

        let id = record.id.clone();
        match self.registry.merge_at(record.clone(), now) {
            MergeOutcome::Applied { previous } => {
                self.suspicions.remove(&id);
                self.record_change(&id, previous.map(|p| p.state), NodeState::Alive);
                self.queue_update(record, None);
                true
            }
            MergeOutcome::Ignored => false,
        }
    }

    fn handle_suspect(&mut self, record: NodeRecord, from: &NodeId, now: Instant) -> bool {
        if record.id == self.local {
            if !self.leaving && record.incarnation >= self.incarnation {
                self.refute(record.incarnation, now);
            }
            return false;
        }

        let Some(current) = self.registry.record(&record.id).cloned() else {
            debug!("Ignoring suspicion of unknown node {}", record.id);
            return false;
        };
        if record.incarnation < current.incarnation {
            return false;
        }

        // Another observer agreeing with a running timer
        if let Some(suspicion) = self.suspicions.get_mut(&record.id) {
            if suspicion.incarnation() == record.incarnation {
                if !suspicion.confirm(from) {
                    return false;
                }
                let confirmed = suspicion.is_confirmed();
                debug!(
                    "Suspicion of {} confirmed by {} ({}/{})",
                    record.id,
                    from,
                    suspicion.confirmations(),
                    suspicion.confirmations_needed()
                );
                let claim = current.with_claim(NodeState::Suspect, record.incarnation);
                self.queue_update_from(claim, from.clone(), None);
                if confirmed {
                    self.declare_dead(&record.id, record.incarnation, now);
                }
                return true;
            }
        }

        let fresh = match current.state {
            NodeState::Alive => true,
            NodeState::Suspect => record.incarnation > current.incarnation,
            NodeState::Dead | NodeState::Left => false,
        };
        if !fresh {
            return false;
        }

        let claim = current.with_claim(NodeState::Suspect, record.incarnation);
        self.registry.merge_at(claim.clone(), now);
        self.start_suspicion(claim.id.clone(), from.clone(), claim.incarnation, now);
        info!("Suspecting {} at incarnation {} (from {})", claim.id, claim.incarnation, from);
        self.record_change(&claim.id, Some(current.state), NodeState::Suspect);
        self.queue_update_from(claim, from.clone(), None);
        true
    }

    fn handle_dead(&mut self, record: NodeRecord, now: Instant) -> bool {
        if record.id == self.local {
            if !self.leaving && record.incarnation >= self.incarnation {
                self.refute(record.incarnation, now);
            }
            return false;
        }

        let Some(current) = self.registry.record(&record.id).cloned() else {
            debug!("Ignoring {} claim about unknown node {}", record.state, record.id);
            return false;
        };
        if record.incarnation < current.incarnation {
            return false;
        }

        let claim = current.with_claim(record.state, record.incarnation);
        match self.registry.merge_at(claim.clone(), now) {
            MergeOutcome::Applied { .. } => {
                self.suspicions.remove(&claim.id);
                info!("Node {} is {} at incarnation {}", claim.id, claim.state, claim.incarnation);
                self.record_change(&claim.id, Some(current.state), claim.state);
                self.queue_update(claim, None);
                true
            }
            MergeOutcome::Ignored => false,
        }
    }

    /// Bump our incarnation past `accused` and broadcast that we are alive
    fn refute(&mut self, accused: Incarnation, now: Instant) {
        self.incarnation = self.incarnation.max(accused).saturating_add(1);
        let record = self
            .local_record()
            .with_claim(NodeState::Alive, self.incarnation);
        info!("Refuting claim about {}, incarnation now {}", self.local, self.incarnation);
        self.registry.merge_at(record.clone(), now);
        self.queue_update(record, None);
    }

    fn start_suspicion(&mut self, id: NodeId, origin: NodeId, incarnation: Incarnation, now: Instant) {
        let n = self.registry.size();
        let k = confirmations_needed(self.config.suspicion_mult, n);
        let min = suspicion_timeout(self.config.suspicion_mult, n, self.config.probe_interval);
        let max = min * self.config.suspicion_max_timeout_mult;
        self.suspicions
            .insert(id, Suspicion::new(origin, incarnation, k, min, max, now));
    }

    fn declare_dead(&mut self, id: &NodeId, incarnation: Incarnation, now: Instant) -> bool {
        self.suspicions.remove(id);

        let Some(current) = self.registry.record(id).cloned() else {
            return false;
        };
        if current.state != NodeState::Suspect || current.incarnation != incarnation {
            return false;
        }

        let claim = current.with_claim(NodeState::Dead, incarnation);
        if !self.registry.merge_at(claim.clone(), now).is_applied() {
            return false;
        }
        info!("Declared {} dead at incarnation {}", id, incarnation);
        self.record_change(id, Some(NodeState::Suspect), NodeState::Dead);
        self.queue_update(claim, None);
        true
    }

    fn record_change(&mut self, id: &NodeId, old: Option<NodeState>, new: NodeState) {
        if old != Some(new) {
            self.changes.push(MembershipChange {
                id: id.clone(),
                old,
                new,
            });
        }
    }

    // =========================================================================
    // FAILURE DETECTION
    // =========================================================================

    /// Next member to probe.
    ///
    /// Walks a shuffled list of live peers; when a pass completes, departed
    /// members past their grace period are reaped and the list reshuffled.
    pub fn next_probe_target(&mut self, now: Instant) -> Option<NodeRecord> {
        for _ in 0..2 {
            while self.probe_index < self.probe_order.len() {
                let id = self.probe_order[self.probe_index].clone();
                self.probe_index += 1;
                match self.registry.record(&id) {
                    Some(record) if record.state.is_live() => return Some(record.clone()),
                    _ => continue,
                }
            }
            self.reset_probe_order(now);
            if self.probe_order.is_empty() {
                return None;
            }
        }
        None
    }

    fn reset_probe_order(&mut self, now: Instant) {
        for id in self.registry.reap(now, self.config.gossip_to_the_dead) {
            debug!("Reaped departed member {}", id);
            self.suspicions.remove(&id);
        }

        let mut order: Vec<NodeId> = self
            .registry
            .live_peers(&self.local)
            .into_iter()
            .map(|r| r.id)
            .collect();
        order.shuffle(&mut rand::thread_rng());
        self.probe_order = order;
        self.probe_index = 0;
    }

    /// No ack, direct or indirect, arrived for `target`
    pub fn probe_failed(&mut self, target: &NodeId, now: Instant) -> bool {
        let Some(current) = self.registry.record(target).cloned() else {
            return false;
        };
        if !current.state.is_live() {
            return false;
        }
        let claim = current.with_claim(NodeState::Suspect, current.incarnation);
        let local = self.local.clone();
        self.handle_suspect(claim, &local, now)
    }

    /// `target` answered a probe: it is alive as far as we can tell.
    ///
    /// Clears our timer and marks the node Alive locally at the same
    /// incarnation; only the node itself can broadcast a refutation.
    pub fn probe_acked(&mut self, target: &NodeId, now: Instant) {
        self.suspicions.remove(target);
        if self.registry.record(target).map(|r| r.state) == Some(NodeState::Suspect) {
            self.registry.set_state(target, NodeState::Alive, now);
            self.record_change(target, Some(NodeState::Suspect), NodeState::Alive);
        }
    }

    /// Fire every expired suspicion timer; returns the nodes declared dead
    pub fn expire_suspicions(&mut self, now: Instant) -> Vec<NodeId> {
        let expired: Vec<(NodeId, Incarnation)> = self
            .suspicions
            .iter()
            .filter(|(_, s)| s.is_expired(now))
            .map(|(id, s)| (id.clone(), s.incarnation()))
            .collect();

        expired
            .into_iter()
            .filter(|(id, incarnation)| self.declare_dead(id, *incarnation, now))
            .map(|(id, _)| id)
            .collect()
    }

    /// Up to `k` alive members, other than `target`, to probe on our behalf
    pub fn indirect_candidates(&self, target: &NodeId, k: usize) -> Vec<NodeRecord> {
        self.registry
            .peers_in_state(NodeState::Alive, &self.local)
            .into_iter()
            .filter(|r| &r.id != target)
            .choose_multiple(&mut rand::thread_rng(), k)
    }

    /// Up to `n` random gossip targets: live members plus recently departed ones
    pub fn gossip_targets(&self, n: usize, now: Instant) -> Vec<NodeRecord> {
        let mut candidates = self.registry.live_peers(&self.local);
        candidates.extend(
            self.registry
                .recently_departed(now, self.config.gossip_to_the_dead)
                .into_iter()
                .filter(|r| r.id != self.local),
        );
        candidates
            .into_iter()
            .choose_multiple(&mut rand::thread_rng(), n)
    }

    /// A random alive member for a full state exchange
    pub fn push_pull_target(&self) -> Option<NodeRecord> {
        self.registry
            .peers_in_state(NodeState::Alive, &self.local)
            .into_iter()
            .choose(&mut rand::thread_rng())
    }

    // =========================================================================
    // BROADCASTS
    // =========================================================================

    fn queue_update(&mut self, record: NodeRecord, notify: Option<oneshot::Sender<()>>) {
        let from = self.local.clone();
        self.queue_update_from(record, from, notify);
    }

    fn queue_update_from(
        &mut self,
        record: NodeRecord,
        from: NodeId,
        notify: Option<oneshot::Sender<()>>,
    ) {
        let key = BroadcastKey::Membership(record.id.clone());
        let update = MembershipUpdate { record, from };
        match Frame::encode_message(FrameType::Update, &update).and_then(|f| f.to_bytes()) {
            Ok(bytes) => {
                self.queue.enqueue(key, bytes, notify);
                self.queue.prune(self.config.max_queued_broadcasts);
            }
            Err(e) => warn!("Failed to encode membership update: {}", e),
        }
    }

    /// Queue a verified application message for re-gossip
    pub fn enqueue_message(&mut self, id: MessageId, envelope: Vec<u8>) {
        match Frame::new(FrameType::User, envelope).to_bytes() {
            Ok(bytes) => {
                self.queue.enqueue(BroadcastKey::Application(id), bytes, None);
                self.queue.prune(self.config.max_queued_broadcasts);
            }
            Err(e) => warn!("Failed to frame message {}: {}", id, e),
        }
    }

    /// Encoded frames to piggyback within `limit` bytes
    pub fn take_broadcasts(&mut self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let cluster_size = self.registry.size();
        self.queue.take(overhead, limit, cluster_size)
    }

    /// Drop every pending broadcast, releasing anyone waiting on them
    pub fn clear_broadcasts(&mut self) {
        self.queue.reset();
    }

    /// Mark ourselves as leaving and queue the Left record.
    ///
    /// The receiver fires once the record has been fully disseminated; `None`
    /// when there is nobody to tell.
    pub fn leave(&mut self, now: Instant) -> Option<oneshot::Receiver<()>> {
        self.leaving = true;
        let record = self
            .local_record()
            .with_claim(NodeState::Left, self.incarnation);
        self.registry.merge_at(record.clone(), now);

        let (tx, rx) = oneshot::channel();
        self.queue_update(record, Some(tx));
        if self.registry.live_peers(&self.local).is_empty() {
            None
        } else {
            Some(rx)
        }
    }

    // =========================================================================
    // ANTI-ENTROPY
    // =========================================================================

    /// Merge the records of a remote full state; returns how many changed
    /// the local view.
    ///
    /// A remote Dead verdict is downgraded to a suspicion so the node gets a
    /// chance to refute it.
    pub fn merge_remote(&mut self, records: &[NodeRecord], now: Instant) -> usize {
        let local = self.local.clone();
        let mut applied = 0;
        for record in records {
            if let Err(e) = validate_record(record) {
                warn!("Skipping invalid remote record for {}: {}", record.id, e);
                continue;
            }
            let changed = match record.state {
                NodeState::Alive => self.handle_alive(record.clone(), now),
                NodeState::Suspect | NodeState::Dead => {
                    let claim = record.with_claim(NodeState::Suspect, record.incarnation);
                    self.handle_suspect(claim, &local, now)
                }
                NodeState::Left => self.handle_dead(record.clone(), now),
            };
            if changed {
                applied += 1;
            }
        }
        applied
    }

    /// Point-in-time copy of every record
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        self.registry.snapshot()
    }

    /// Get cluster statistics
    pub fn stats(&self) -> ClusterStats {
        ClusterStats {
            membership: self.registry.stats(),
            incarnation: self.incarnation,
            queued_broadcasts: self.queue.len(),
            suspicions: self.suspicions.len(),
        }
    }
}

/// Cluster statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterStats {
    pub membership: MembershipStats,
    pub incarnation: Incarnation,
    pub queued_broadcasts: usize,
    pub suspicions: usize,
}

/// Shared handle to the cluster state and the delegate observing it
pub struct Cluster {
    state: Mutex<ClusterState>,
    delegate: Arc<dyn Delegate>,
}

impl Cluster {
    pub fn new(state: ClusterState, delegate: Arc<dyn Delegate>) -> Self {
        Self {
            state: Mutex::new(state),
            delegate,
        }
    }

    /// Mutate under the lock.
    ///
    /// Membership changes are reported to the delegate after the lock is
    /// released.
    pub fn update<R>(&self, f: impl FnOnce(&mut ClusterState) -> R) -> R {
        let (result, changes) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            (result, state.drain_changes())
        };
        for change in changes {
            self.delegate
                .notify_membership_change(&change.id, change.old, change.new);
        }
        result
    }

    pub fn read<R>(&self, f: impl FnOnce(&ClusterState) -> R) -> R {
        f(&self.state.lock())
    }

    pub fn delegate(&self) -> &Arc<dyn Delegate> {
        &self.delegate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::{ChannelDelegate, DelegateEvent};
    use std::time::Duration;
    use zkgossip_net::framing::decode_packet;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn peer(name: &str, port: u16, incarnation: Incarnation) -> NodeRecord {
        NodeRecord::alive(NodeId::from(name), addr(port), incarnation)
    }

    fn update(record: NodeRecord, from: &str) -> MembershipUpdate {
        MembershipUpdate {
            record,
            from: NodeId::from(from),
        }
    }

    /// Local node "a" knowing alive peers "b" and "c"
    fn three_node_state(now: Instant) -> ClusterState {
        let config = Arc::new(NodeConfig::lan(NodeId::from("a"), addr(7001)));
        let mut state = ClusterState::new(config, addr(7001), Vec::new(), now);
        state.handle_update(update(peer("b", 7002, 1), "b"), now);
        state.handle_update(update(peer("c", 7003, 1), "c"), now);
        state.drain_changes();
        state
    }

    /// Decode every queued membership update
    fn drain_updates(state: &mut ClusterState) -> Vec<MembershipUpdate> {
        state
            .take_broadcasts(0, usize::MAX)
            .iter()
            .flat_map(|bytes| decode_packet(bytes).unwrap())
            .filter(|f| f.frame_type == FrameType::Update)
            .map(|f| f.decode_message::<MembershipUpdate>().unwrap())
            .collect()
    }

    #[test]
    fn test_new_state_announces_self() {
        let now = Instant::now();
        let config = Arc::new(NodeConfig::lan(NodeId::from("a"), addr(7001)));
        let mut state = ClusterState::new(config, addr(7001), b"meta".to_vec(), now);

        assert_eq!(state.cluster_size(), 1);
        assert_eq!(state.local_record().meta, b"meta".to_vec());
        let updates = drain_updates(&mut state);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].record.id, NodeId::from("a"));
    }

    #[test]
    fn test_unreachable_node_declared_dead_once() {
        let start = Instant::now();
        let mut state = three_node_state(start);
        let c = NodeId::from("c");

        // three failed probe rounds; only the first starts a timer
        assert!(state.probe_failed(&c, start));
        assert!(!state.probe_failed(&c, start + Duration::from_secs(1)));
        assert!(!state.probe_failed(&c, start + Duration::from_secs(2)));
        assert_eq!(state.registry().record(&c).unwrap().state, NodeState::Suspect);

        // cluster of 3 needs one confirmation, so the timer runs at its max
        let deadline = state.suspicion(&c).unwrap().deadline();
        assert_eq!(deadline, start + Duration::from_secs(18));
        assert!(state.expire_suspicions(deadline - Duration::from_millis(1)).is_empty());

        assert_eq!(state.expire_suspicions(deadline), vec![c.clone()]);
        assert!(state.expire_suspicions(deadline + Duration::from_secs(1)).is_empty());
        assert_eq!(state.registry().record(&c).unwrap().state, NodeState::Dead);

        let dead: Vec<_> = drain_updates(&mut state)
            .into_iter()
            .filter(|u| u.record.id == c && u.record.state == NodeState::Dead)
            .collect();
        assert_eq!(dead.len(), 1);
    }

    #[test]
    fn test_confirmation_declares_dead_immediately() {
        let now = Instant::now();
        let mut state = three_node_state(now);
        let c = NodeId::from("c");

        state.probe_failed(&c, now);
        let suspect = state.registry().record(&c).unwrap().clone();
        assert!(state.handle_update(update(suspect, "b"), now));

        assert_eq!(state.registry().record(&c).unwrap().state, NodeState::Dead);
        assert!(state.suspicion(&c).is_none());
    }

    #[test]
    fn test_refutes_suspicion_of_self() {
        let now = Instant::now();
        let mut state = three_node_state(now);
        drain_updates(&mut state);

        let accusation = state.local_record().with_claim(NodeState::Suspect, 1);
        assert!(!state.handle_update(update(accusation, "b"), now));
        assert_eq!(state.incarnation(), 2);
        assert_eq!(state.local_record().state, NodeState::Alive);

        let about_self: Vec<_> = drain_updates(&mut state)
            .into_iter()
            .filter(|u| u.record.id == NodeId::from("a"))
            .collect();
        assert_eq!(about_self.len(), 1);
        assert_eq!(about_self[0].record.state, NodeState::Alive);
        assert_eq!(about_self[0].record.incarnation, 2);

        // a dead claim far ahead of us is skipped past
        let accusation = state.local_record().with_claim(NodeState::Dead, 7);
        state.handle_update(update(accusation, "c"), now);
        assert_eq!(state.incarnation(), 8);

        // stale claims are ignored
        let stale = state.local_record().with_claim(NodeState::Suspect, 3);
        state.handle_update(update(stale, "c"), now);
        assert_eq!(state.incarnation(), 8);
    }

    #[test]
    fn test_higher_incarnation_clears_suspicion() {
        let now = Instant::now();
        let mut state = three_node_state(now);
        let c = NodeId::from("c");

        state.probe_failed(&c, now);
        assert!(state.handle_update(update(peer("c", 7003, 2), "c"), now));

        assert_eq!(state.registry().record(&c).unwrap().state, NodeState::Alive);
        assert!(state.suspicion(&c).is_none());
        assert!(state.expire_suspicions(now + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_ack_clears_local_suspicion() {
        let now = Instant::now();
        let mut state = three_node_state(now);
        let c = NodeId::from("c");

        state.probe_failed(&c, now);
        state.probe_acked(&c, now);

        let record = state.registry().record(&c).unwrap();
        assert_eq!(record.state, NodeState::Alive);
        assert_eq!(record.incarnation, 1);
        assert!(state.suspicion(&c).is_none());
    }

    #[test]
    fn test_unknown_and_stale_claims_ignored() {
        let now = Instant::now();
        let mut state = three_node_state(now);

        let ghost = peer("ghost", 7009, 1).with_claim(NodeState::Suspect, 1);
        assert!(!state.handle_update(update(ghost.clone(), "b"), now));
        assert!(!state.handle_update(update(ghost.with_claim(NodeState::Dead, 1), "b"), now));
        assert!(!state.registry().contains(&"ghost".into()));

        state.handle_update(update(peer("b", 7002, 5), "b"), now);
        let stale = peer("b", 7002, 4).with_claim(NodeState::Dead, 4);
        assert!(!state.handle_update(update(stale, "c"), now));
        assert_eq!(state.registry().record(&"b".into()).unwrap().state, NodeState::Alive);
    }

    #[test]
    fn test_changes_reported_in_order() {
        let now = Instant::now();
        let mut state = three_node_state(now);
        state.handle_update(update(peer("d", 7004, 1), "d"), now);
        state.probe_failed(&"d".into(), now);

        assert_eq!(
            state.drain_changes(),
            vec![
                MembershipChange {
                    id: "d".into(),
                    old: None,
                    new: NodeState::Alive,
                },
                MembershipChange {
                    id: "d".into(),
                    old: Some(NodeState::Alive),
                    new: NodeState::Suspect,
                },
            ]
        );
        assert!(state.drain_changes().is_empty());
    }

    #[test]
    fn test_probe_order_covers_each_peer_per_round() {
        let now = Instant::now();
        let mut state = three_node_state(now);

        let mut round: Vec<NodeId> = (0..2)
            .map(|_| state.next_probe_target(now).unwrap().id)
            .collect();
        round.sort();
        assert_eq!(round, vec![NodeId::from("b"), NodeId::from("c")]);

        // dead members drop out of the next round
        state.handle_update(update(peer("c", 7003, 1).with_claim(NodeState::Dead, 1), "b"), now);
        for _ in 0..4 {
            assert_eq!(state.next_probe_target(now).unwrap().id, NodeId::from("b"));
        }
    }

    #[test]
    fn test_departed_members_reaped_after_grace() {
        let now = Instant::now();
        let mut state = three_node_state(now);
        state.handle_update(update(peer("c", 7003, 1).with_claim(NodeState::Left, 1), "c"), now);

        assert_eq!(state.gossip_targets(10, now).len(), 2);

        let later = now + Duration::from_secs(16);
        assert_eq!(state.gossip_targets(10, later).len(), 1);
        state.next_probe_target(later);
        assert!(!state.registry().contains(&"c".into()));
    }

    #[test]
    fn test_merge_remote_downgrades_dead_to_suspect() {
        let now = Instant::now();
        let mut state = three_node_state(now);

        let records = vec![
            peer("b", 7002, 1).with_claim(NodeState::Dead, 1),
            peer("d", 7004, 3),
            peer("e", 7005, 1).with_claim(NodeState::Suspect, 1),
        ];
        assert_eq!(state.merge_remote(&records, now), 2);
        assert_eq!(state.registry().record(&"b".into()).unwrap().state, NodeState::Suspect);
        assert_eq!(state.registry().record(&"d".into()).unwrap().incarnation, 3);
        assert!(!state.registry().contains(&"e".into()));
    }

    #[test]
    fn test_leave_marks_local_left() {
        let now = Instant::now();
        let mut state = three_node_state(now);

        let done = state.leave(now);
        assert!(done.is_some());
        assert!(state.is_leaving());
        assert_eq!(state.local_record().state, NodeState::Left);

        // accusations are no longer refuted
        let accusation = state.local_record().with_claim(NodeState::Dead, 1);
        state.handle_update(update(accusation, "b"), now);
        assert_eq!(state.incarnation(), 1);
    }

    #[test]
    fn test_clearing_broadcasts_releases_leave() {
        let now = Instant::now();
        let mut state = three_node_state(now);

        let mut done = state.leave(now).unwrap();
        assert!(done.try_recv().is_err());
        state.clear_broadcasts();
        assert!(done.try_recv().is_ok());
        assert!(state.queue().is_empty());
    }

    #[test]
    fn test_leave_alone_needs_no_wait() {
        let now = Instant::now();
        let config = Arc::new(NodeConfig::lan(NodeId::from("solo"), addr(7001)));
        let mut state = ClusterState::new(config, addr(7001), Vec::new(), now);
        assert!(state.leave(now).is_none());
    }

    #[test]
    fn test_cluster_notifies_delegate_after_update() {
        let now = Instant::now();
        let (delegate, mut events) = ChannelDelegate::new();
        let cluster = Cluster::new(three_node_state(now), Arc::new(delegate));

        cluster.update(|s| s.probe_failed(&"b".into(), now));
        assert_eq!(
            events.try_recv().unwrap(),
            DelegateEvent::MembershipChange {
                id: "b".into(),
                old: Some(NodeState::Alive),
                new: NodeState::Suspect,
            }
        );
        assert!(events.try_recv().is_err());
        assert_eq!(cluster.read(|s| s.stats().suspicions), 1);
    }
}
