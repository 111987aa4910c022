//! Anti-entropy: full state exchange over the stream transport
//!
//! Periodically, and when joining, a node sends its complete registry to one
//! peer and merges the peer's registry in return. This repairs anything the
//! epidemic broadcasts missed.

use crate::state::Cluster;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use zkgossip_core::types::*;
use zkgossip_net::{Frame, FrameError, FrameType, Transport, TransportError};

/// Sync protocol errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Unexpected {0:?} frame")]
    UnexpectedFrame(FrameType),
    #[error("Node name {id} is already in use by {addr}")]
    DuplicateIdentity { id: NodeId, addr: SocketAddr },
}

/// Sync statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Exchanges we initiated that completed
    pub exchanges: u64,
    /// Exchanges initiated by peers
    pub served: u64,
    pub failures: u64,
    /// Remote records that changed our view
    pub records_applied: u64,
}

/// Synchronization manager
pub struct SyncManager {
    cluster: Arc<Cluster>,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    stats: Mutex<SyncStats>,
}

impl SyncManager {
    pub fn new(cluster: Arc<Cluster>, transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            cluster,
            transport,
            timeout,
            stats: Mutex::new(SyncStats::default()),
        }
    }

    /// Build our side of an exchange
    pub fn create_request(&self, join: bool) -> Result<Frame, SyncError> {
        let user_state = self.cluster.delegate().local_state(join);
        let (source, records) = self
            .cluster
            .read(|s| (s.local_id().clone(), s.snapshot()));

        let message = PushPull {
            join,
            source,
            records,
            user_state,
        };
        Ok(Frame::encode_message(FrameType::PushPull, &message)?)
    }

    /// Serve an exchange initiated by `from`: reply with our state, then
    /// merge theirs
    pub fn handle_request(&self, from: SocketAddr, request: &Frame) -> Result<Frame, SyncError> {
        let remote = parse(request)?;
        let reply = self.create_request(false)?;
        let applied = self.merge(&remote);
        debug!("Served push/pull for {} at {} ({} updates)", remote.source, from, applied);
        self.stats.lock().served += 1;
        Ok(reply)
    }

    /// Exchange state with `addr`; returns how many records changed our view.
    ///
    /// When joining, a peer that already knows our name alive at another
    /// address is reported as [`SyncError::DuplicateIdentity`] and nothing is
    /// merged.
    pub async fn push_pull(&self, addr: SocketAddr, join: bool) -> Result<usize, SyncError> {
        let result = self.exchange(addr, join).await;
        let mut stats = self.stats.lock();
        match &result {
            Ok(_) => stats.exchanges += 1,
            Err(_) => stats.failures += 1,
        }
        result
    }

    async fn exchange(&self, addr: SocketAddr, join: bool) -> Result<usize, SyncError> {
        let request = self.create_request(join)?;
        let reply = self.transport.exchange(addr, request, self.timeout).await?;
        let remote = parse(&reply)?;
        if join {
            self.check_identity(&remote)?;
        }
        Ok(self.merge(&remote))
    }

    fn check_identity(&self, remote: &PushPull) -> Result<(), SyncError> {
        let (local, local_addr) = self.cluster.read(|s| (s.local_id().clone(), s.local_addr()));
        let conflict = remote
            .records
            .iter()
            .find(|r| r.id == local && r.state == NodeState::Alive && r.addr != local_addr);
        match conflict {
            Some(record) => Err(SyncError::DuplicateIdentity {
                id: record.id.clone(),
                addr: record.addr,
            }),
            None => Ok(()),
        }
    }

    fn merge(&self, remote: &PushPull) -> usize {
        let applied = self
            .cluster
            .update(|s| s.merge_remote(&remote.records, Instant::now()));
        if !remote.user_state.is_empty() {
            self.cluster
                .delegate()
                .merge_remote_state(&remote.user_state, remote.join);
        }
        self.stats.lock().records_applied += applied as u64;
        applied
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.lock().clone()
    }
}

fn parse(frame: &Frame) -> Result<PushPull, SyncError> {
    if frame.frame_type != FrameType::PushPull {
        warn!("Expected push/pull, got {:?}", frame.frame_type);
        return Err(SyncError::UnexpectedFrame(frame.frame_type));
    }
    Ok(frame.decode_message()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::delegate::Delegate;
    use crate::state::ClusterState;
    use zkgossip_net::{MemoryNetwork, TransportEvent};

    #[derive(Default)]
    struct StateDelegate {
        received: Mutex<Vec<(Vec<u8>, bool)>>,
    }

    impl Delegate for StateDelegate {
        fn notify_msg(&self, _payload: &[u8]) {}

        fn local_state(&self, join: bool) -> Vec<u8> {
            if join {
                b"joining".to_vec()
            } else {
                b"steady".to_vec()
            }
        }

        fn merge_remote_state(&self, state: &[u8], join: bool) {
            self.received.lock().push((state.to_vec(), join));
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    struct Side {
        sync: Arc<SyncManager>,
        cluster: Arc<Cluster>,
        delegate: Arc<StateDelegate>,
    }

    /// A sync manager named `name` at `port`, serving requests in the background
    fn side(network: &MemoryNetwork, name: &str, port: u16) -> Side {
        let (transport, mut events) = network.bind(addr(port));
        let config = Arc::new(NodeConfig::local(name, addr(port)));
        let state = ClusterState::new(config, addr(port), Vec::new(), Instant::now());
        let delegate = Arc::new(StateDelegate::default());
        let cluster = Arc::new(Cluster::new(state, delegate.clone()));
        let sync = Arc::new(SyncManager::new(cluster.clone(), transport, Duration::from_secs(1)));

        let server = sync.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let TransportEvent::Stream { from, request, reply } = event {
                    if let Ok(frame) = server.handle_request(from, &request) {
                        let _ = reply.send(frame);
                    }
                }
            }
        });

        Side {
            sync,
            cluster,
            delegate,
        }
    }

    #[tokio::test]
    async fn test_push_pull_merges_both_ways() {
        let network = MemoryNetwork::new();
        let a = side(&network, "a", 1);
        let b = side(&network, "b", 2);

        let applied = b.sync.push_pull(addr(1), true).await.unwrap();
        assert_eq!(applied, 1);

        for node in [&a, &b] {
            let ids: Vec<NodeId> = node.cluster.read(|s| s.snapshot()).into_iter().map(|r| r.id).collect();
            assert_eq!(ids, vec![NodeId::from("a"), NodeId::from("b")]);
        }

        assert_eq!(*a.delegate.received.lock(), vec![(b"joining".to_vec(), true)]);
        assert_eq!(*b.delegate.received.lock(), vec![(b"steady".to_vec(), false)]);
        assert_eq!(b.sync.stats().exchanges, 1);
        assert_eq!(a.sync.stats().served, 1);
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected_on_join() {
        let network = MemoryNetwork::new();
        let _a = side(&network, "a", 1);
        let imposter = side(&network, "a", 2);

        let result = imposter.sync.push_pull(addr(1), true).await;
        assert!(matches!(
            result,
            Err(SyncError::DuplicateIdentity { addr: conflict, .. }) if conflict == addr(1)
        ));
        assert_eq!(imposter.cluster.read(|s| s.snapshot()).len(), 1);
        assert_eq!(imposter.sync.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_an_error() {
        let network = MemoryNetwork::new();
        let a = side(&network, "a", 1);
        network.isolate(addr(9));

        assert!(matches!(
            a.sync.push_pull(addr(9), false).await,
            Err(SyncError::Transport(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_frame_type() {
        let frame = Frame::new(FrameType::Ping, vec![]);
        assert!(matches!(parse(&frame), Err(SyncError::UnexpectedFrame(FrameType::Ping))));
    }
}
