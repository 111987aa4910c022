//! Node registry: the local view of cluster membership
//!
//! Pure data plus merge logic. Two claims about the same node are reconciled
//! by incarnation, then by state rank (`Left > Dead > Suspect > Alive`),
//! then by address and metadata.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;
use zkgossip_core::types::{NodeId, NodeRecord, NodeState};

/// Registry entry: the winning claim and when its state last changed
#[derive(Debug, Clone)]
pub struct Member {
    pub record: NodeRecord,
    pub state_changed: Instant,
}

/// Result of merging a claim into the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Local view changed; `previous` is the replaced record, if any
    Applied { previous: Option<NodeRecord> },
    /// Stale or identical claim
    Ignored,
}

impl MergeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MergeOutcome::Applied { .. })
    }
}

/// Authoritative local membership view
#[derive(Debug, Default)]
pub struct Registry {
    members: HashMap<NodeId, Member>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a claim, keeping whichever record has higher precedence
    pub fn merge(&mut self, incoming: NodeRecord) -> MergeOutcome {
        self.merge_at(incoming, Instant::now())
    }

    /// [`Registry::merge`] with an explicit clock
    pub fn merge_at(&mut self, incoming: NodeRecord, now: Instant) -> MergeOutcome {
        match self.members.get_mut(&incoming.id) {
            None => {
                self.members.insert(
                    incoming.id.clone(),
                    Member {
                        record: incoming,
                        state_changed: now,
                    },
                );
                MergeOutcome::Applied { previous: None }
            }
            Some(member) if incoming.supersedes(&member.record) => {
                if incoming.precedence() == member.record.precedence() {
                    debug!(
                        "Conflicting claim for {} at incarnation {}, {} replaces {}",
                        incoming.id, incoming.incarnation, incoming.addr, member.record.addr
                    );
                }
                if incoming.state != member.record.state {
                    member.state_changed = now;
                }
                let previous = std::mem::replace(&mut member.record, incoming);
                MergeOutcome::Applied {
                    previous: Some(previous),
                }
            }
            Some(_) => MergeOutcome::Ignored,
        }
    }

    /// Point-in-time copy of every record, ordered by identity
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        let mut records: Vec<NodeRecord> =
            self.members.values().map(|m| m.record.clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Number of Alive or Suspect members, the local node included
    pub fn size(&self) -> usize {
        self.members
            .values()
            .filter(|m| m.record.state.is_live())
            .count()
    }

    /// Number of records, dead ones included
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, id: &NodeId) -> Option<&Member> {
        self.members.get(id)
    }

    pub fn record(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.members.get(id).map(|m| &m.record)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.contains_key(id)
    }

    /// Live members other than `exclude`
    pub fn live_peers(&self, exclude: &NodeId) -> Vec<NodeRecord> {
        self.members
            .values()
            .filter(|m| m.record.state.is_live() && &m.record.id != exclude)
            .map(|m| m.record.clone())
            .collect()
    }

    /// Members in `state` other than `exclude`
    pub fn peers_in_state(&self, state: NodeState, exclude: &NodeId) -> Vec<NodeRecord> {
        self.members
            .values()
            .filter(|m| m.record.state == state && &m.record.id != exclude)
            .map(|m| m.record.clone())
            .collect()
    }

    /// Dead or departed members whose state changed within `window`
    pub fn recently_departed(&self, now: Instant, window: Duration) -> Vec<NodeRecord> {
        self.members
            .values()
            .filter(|m| {
                !m.record.state.is_live()
                    && now.saturating_duration_since(m.state_changed) < window
            })
            .map(|m| m.record.clone())
            .collect()
    }

    /// Overwrite the state of a known member from a local observation.
    ///
    /// Returns the previous state; unknown identities are a no-op.
    pub fn set_state(&mut self, id: &NodeId, state: NodeState, now: Instant) -> Option<NodeState> {
        let member = self.members.get_mut(id)?;
        let previous = member.record.state;
        if previous != state {
            member.record.state = state;
            member.state_changed = now;
        }
        Some(previous)
    }

    /// Remove Dead/Left members whose state is older than `grace`
    pub fn reap(&mut self, now: Instant, grace: Duration) -> Vec<NodeId> {
        let expired: Vec<NodeId> = self
            .members
            .values()
            .filter(|m| {
                !m.record.state.is_live()
                    && now.saturating_duration_since(m.state_changed) >= grace
            })
            .map(|m| m.record.id.clone())
            .collect();

        for id in &expired {
            self.members.remove(id);
        }
        expired
    }

    /// Get membership stats
    pub fn stats(&self) -> MembershipStats {
        let count = |state: NodeState| {
            self.members
                .values()
                .filter(|m| m.record.state == state)
                .count()
        };
        MembershipStats {
            total: self.members.len(),
            alive: count(NodeState::Alive),
            suspect: count(NodeState::Suspect),
            dead: count(NodeState::Dead),
            left: count(NodeState::Left),
        }
    }
}

/// Membership statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipStats {
    pub total: usize,
    pub alive: usize,
    pub suspect: usize,
    pub dead: usize,
    pub left: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use std::net::SocketAddr;
    use zkgossip_core::types::Incarnation;

    fn claim(name: &str, incarnation: Incarnation, state: NodeState) -> NodeRecord {
        let port = 7000 + name.len() as u16;
        NodeRecord::alive(NodeId::from(name), format!("127.0.0.1:{}", port).parse().unwrap(), 0)
            .with_claim(state, incarnation)
    }

    #[test]
    fn test_merge_outcomes() {
        let mut registry = Registry::new();

        assert_eq!(
            registry.merge(claim("a", 1, NodeState::Alive)),
            MergeOutcome::Applied { previous: None }
        );
        // identical
        assert_eq!(registry.merge(claim("a", 1, NodeState::Alive)), MergeOutcome::Ignored);
        // stale
        assert_eq!(registry.merge(claim("a", 0, NodeState::Dead)), MergeOutcome::Ignored);
        // newer
        assert_eq!(
            registry.merge(claim("a", 1, NodeState::Suspect)),
            MergeOutcome::Applied {
                previous: Some(claim("a", 1, NodeState::Alive))
            }
        );
        assert_eq!(registry.record(&"a".into()).unwrap().state, NodeState::Suspect);
    }

    #[test]
    fn test_higher_incarnation_revives_dead_node() {
        let mut registry = Registry::new();
        registry.merge(claim("a", 3, NodeState::Dead));
        assert!(registry.merge(claim("a", 4, NodeState::Alive)).is_applied());
        assert_eq!(registry.record(&"a".into()).unwrap().state, NodeState::Alive);
    }

    #[test]
    fn test_merge_commutative_and_idempotent() {
        let claims = vec![
            claim("a", 1, NodeState::Alive),
            claim("a", 2, NodeState::Alive),
            claim("a", 2, NodeState::Suspect),
            claim("a", 1, NodeState::Dead),
            claim("b", 5, NodeState::Left),
            claim("b", 5, NodeState::Dead),
            claim("b", 4, NodeState::Alive),
            claim("ccc", 0, NodeState::Suspect),
            claim("ccc", 0, NodeState::Alive),
        ];

        let mut reference = Registry::new();
        for c in &claims {
            reference.merge(c.clone());
        }
        let expected = reference.snapshot();
        assert_eq!(expected[0], claim("a", 2, NodeState::Suspect));
        assert_eq!(expected[1], claim("b", 5, NodeState::Left));
        assert_eq!(expected[2], claim("ccc", 0, NodeState::Suspect));

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let mut shuffled = claims.clone();
            shuffled.shuffle(&mut rng);

            let mut registry = Registry::new();
            for c in &shuffled {
                registry.merge(c.clone());
            }
            assert_eq!(registry.snapshot(), expected);

            // merging everything again changes nothing
            for c in &shuffled {
                assert_eq!(registry.merge(c.clone()), MergeOutcome::Ignored);
            }
            assert_eq!(registry.snapshot(), expected);
        }
    }

    #[test]
    fn test_conflicting_claims_merge_in_any_order() {
        let at = |port: u16, meta: &[u8]| {
            let mut record =
                NodeRecord::alive(NodeId::from("a"), SocketAddr::from(([127, 0, 0, 1], port)), 4);
            record.meta = meta.to_vec();
            record
        };
        let claims = vec![at(7001, b""), at(7003, b""), at(7002, b"x"), at(7003, b"x")];

        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..20 {
            let mut shuffled = claims.clone();
            shuffled.shuffle(&mut rng);

            let mut registry = Registry::new();
            for c in &shuffled {
                registry.merge(c.clone());
            }
            assert_eq!(registry.record(&"a".into()), Some(&at(7003, b"x")));
        }
    }

    #[test]
    fn test_size_counts_live_members() {
        let mut registry = Registry::new();
        registry.merge(claim("a", 1, NodeState::Alive));
        registry.merge(claim("bb", 1, NodeState::Suspect));
        registry.merge(claim("ccc", 1, NodeState::Dead));
        registry.merge(claim("dddd", 1, NodeState::Left));

        assert_eq!(registry.size(), 2);
        assert_eq!(registry.len(), 4);
        assert_eq!(
            registry.stats(),
            MembershipStats {
                total: 4,
                alive: 1,
                suspect: 1,
                dead: 1,
                left: 1,
            }
        );
    }

    #[test]
    fn test_set_state_unknown_is_noop() {
        let mut registry = Registry::new();
        assert_eq!(registry.set_state(&"ghost".into(), NodeState::Dead, Instant::now()), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reap_after_grace() {
        let mut registry = Registry::new();
        let start = Instant::now();
        registry.merge_at(claim("a", 1, NodeState::Alive), start);
        registry.merge_at(claim("bb", 1, NodeState::Dead), start);

        let grace = Duration::from_secs(15);
        assert!(registry.reap(start + Duration::from_secs(5), grace).is_empty());
        assert_eq!(
            registry.recently_departed(start + Duration::from_secs(5), grace).len(),
            1
        );

        let reaped = registry.reap(start + grace, grace);
        assert_eq!(reaped, vec![NodeId::from("bb")]);
        assert!(registry.contains(&"a".into()));
        assert!(!registry.contains(&"bb".into()));
    }
}
