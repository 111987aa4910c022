//! Retransmit-limited broadcast queue
//!
//! Pending broadcasts are piggybacked on outgoing packets. Each one is sent
//! `ceil(mult * log10(n + 1))` times before it is retired, so dissemination
//! cost grows logarithmically with cluster size.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::oneshot;
use zkgossip_core::types::{MessageId, NodeId};

/// Identity used to invalidate superseded broadcasts
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BroadcastKey {
    /// Latest claim about a node
    Membership(NodeId),
    /// Verified application message
    Application(MessageId),
}

/// Number of times each broadcast is sent in a cluster of `cluster_size`
pub fn retransmit_limit(multiplier: u32, cluster_size: usize) -> u32 {
    let scale = ((cluster_size + 1) as f64).log10();
    let limit = (f64::from(multiplier) * scale).ceil() as u32;
    limit.max(1)
}

/// A queued broadcast.
///
/// The optional notifier fires when the item leaves the queue, whether it
/// was retired, invalidated, or pruned.
#[derive(Debug)]
pub struct BroadcastItem {
    pub key: BroadcastKey,
    pub payload: Vec<u8>,
    transmits: u32,
    notify: Option<oneshot::Sender<()>>,
}

impl BroadcastItem {
    pub fn transmits(&self) -> u32 {
        self.transmits
    }
}

impl Drop for BroadcastItem {
    fn drop(&mut self) {
        if let Some(tx) = self.notify.take() {
            let _ = tx.send(());
        }
    }
}

/// Ordering position: fewest transmits first, then newest first
type Slot = (u32, Reverse<u64>);

/// Transmit-limited queue of pending broadcasts
#[derive(Debug)]
pub struct BroadcastQueue {
    retransmit_mult: u32,
    items: BTreeMap<Slot, BroadcastItem>,
    index: HashMap<BroadcastKey, Slot>,
    next_id: u64,
}

impl BroadcastQueue {
    pub fn new(retransmit_mult: u32) -> Self {
        Self {
            retransmit_mult,
            items: BTreeMap::new(),
            index: HashMap::new(),
            next_id: 0,
        }
    }

    /// Queue a broadcast, replacing any pending item with the same key.
    ///
    /// The replacement starts again at zero transmits.
    pub fn enqueue(&mut self, key: BroadcastKey, payload: Vec<u8>, notify: Option<oneshot::Sender<()>>) {
        if let Some(slot) = self.index.remove(&key) {
            self.items.remove(&slot);
        }

        self.next_id += 1;
        let slot = (0, Reverse(self.next_id));
        self.index.insert(key.clone(), slot);
        self.items.insert(
            slot,
            BroadcastItem {
                key,
                payload,
                transmits: 0,
                notify,
            },
        );
    }

    /// Select broadcasts to piggyback on a packet.
    ///
    /// Items are taken greedily in queue order while
    /// `used + overhead + len <= limit`; anything that does not fit stays
    /// queued. Every selected item counts one transmit and is retired once it
    /// reaches the retransmit limit for `cluster_size`.
    pub fn take(&mut self, overhead: usize, limit: usize, cluster_size: usize) -> Vec<Vec<u8>> {
        let max_transmits = retransmit_limit(self.retransmit_mult, cluster_size);
        let mut used = 0;
        let mut selected = Vec::new();
        let mut out = Vec::new();

        for (slot, item) in &self.items {
            if limit.saturating_sub(used) < overhead {
                break;
            }
            let cost = overhead + item.payload.len();
            if used + cost > limit {
                continue;
            }
            used += cost;
            out.push(item.payload.clone());
            selected.push(*slot);
        }

        for slot in selected {
            let Some(mut item) = self.items.remove(&slot) else {
                continue;
            };
            item.transmits += 1;
            if item.transmits >= max_transmits {
                self.index.remove(&item.key);
                continue;
            }
            let next = (item.transmits, slot.1);
            self.index.insert(item.key.clone(), next);
            self.items.insert(next, item);
        }

        out
    }

    /// Retransmit limit for a cluster of `cluster_size`
    pub fn retransmit_limit(&self, cluster_size: usize) -> u32 {
        retransmit_limit(self.retransmit_mult, cluster_size)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, key: &BroadcastKey) -> bool {
        self.index.contains_key(key)
    }

    /// Transmit count of a pending broadcast
    pub fn transmits(&self, key: &BroadcastKey) -> Option<u32> {
        self.index.get(key).map(|slot| slot.0)
    }

    /// Drop the most transmitted (then oldest) items until at most
    /// `max_retain` remain.
    pub fn prune(&mut self, max_retain: usize) {
        while self.items.len() > max_retain {
            let Some((_, item)) = self.items.pop_last() else {
                break;
            };
            self.index.remove(&item.key);
        }
    }

    /// Drop everything
    pub fn reset(&mut self) {
        self.index.clear();
        self.items.clear();
    }
}
