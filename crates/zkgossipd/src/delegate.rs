//! Application hooks
//!
//! A [`Delegate`] is how an application plugs into a node: it receives
//! verified messages and membership changes, and may contribute metadata,
//! broadcasts, and state for push/pull exchanges.

use tokio::sync::mpsc;
use tracing::info;
use zkgossip_core::types::{NodeId, NodeState};

/// Callbacks invoked by a running node.
///
/// Only `notify_msg` is required. Callbacks run on protocol tasks and must
/// not block.
pub trait Delegate: Send + Sync + 'static {
    /// Metadata advertised with the local record, at most `limit` bytes
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
    }

    /// A verified application payload
    fn notify_msg(&self, payload: &[u8]);

    /// Extra broadcasts to piggyback; each must fit `overhead + len <= limit`
    fn get_broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
        Vec::new()
    }

    /// Application state sent during push/pull
    fn local_state(&self, _join: bool) -> Vec<u8> {
        Vec::new()
    }

    /// Application state received during push/pull
    fn merge_remote_state(&self, _state: &[u8], _join: bool) {}

    /// A member changed state; `old` is `None` for a newly seen member
    fn notify_membership_change(&self, _id: &NodeId, _old: Option<NodeState>, _new: NodeState) {}
}

/// Delegate that writes everything to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDelegate;

impl Delegate for LoggingDelegate {
    fn notify_msg(&self, payload: &[u8]) {
        info!("Received message: {}", String::from_utf8_lossy(payload));
    }

    fn notify_membership_change(&self, id: &NodeId, old: Option<NodeState>, new: NodeState) {
        match old {
            None => info!("Member {} discovered ({})", id, new),
            Some(old) => info!("Member {} {} -> {}", id, old, new),
        }
    }
}

/// Event forwarded by [`ChannelDelegate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegateEvent {
    Message(Vec<u8>),
    MembershipChange {
        id: NodeId,
        old: Option<NodeState>,
        new: NodeState,
    },
}

/// Delegate that forwards events into a channel
#[derive(Debug, Clone)]
pub struct ChannelDelegate {
    tx: mpsc::UnboundedSender<DelegateEvent>,
}

impl ChannelDelegate {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DelegateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Delegate for ChannelDelegate {
    fn notify_msg(&self, payload: &[u8]) {
        let _ = self.tx.send(DelegateEvent::Message(payload.to_vec()));
    }

    fn notify_membership_change(&self, id: &NodeId, old: Option<NodeState>, new: NodeState) {
        let _ = self.tx.send(DelegateEvent::MembershipChange {
            id: id.clone(),
            old,
            new,
        });
    }
}
