//! zkgossipd node - protocol loops and public API

use crate::config::NodeConfig;
use crate::delegate::Delegate;
use crate::detector::{AckEvent, FailureDetector, ProbeStats};
use crate::gate::{GateStats, VerificationGate};
use crate::messenger::Messenger;
use crate::state::{Cluster, ClusterState, ClusterStats};
use crate::sync::{SyncError, SyncManager, SyncStats};
use parking_lot::Mutex;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, MissedTickBehavior};
use tracing::{debug, info, warn};
use zkgossip_core::canonical::{canonical_bytes, validate_envelope, META_MAX_SIZE};
use zkgossip_core::crypto::message_id;
use zkgossip_core::proof::Verifier;
use zkgossip_core::types::*;
use zkgossip_net::framing::{decode_packet, FRAME_OVERHEAD};
use zkgossip_net::{Frame, FrameError, FrameType, Transport, TransportError, TransportEvent};

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] zkgossip_core::Error),
    #[error("Node metadata too large: {0} bytes (max {META_MAX_SIZE})")]
    MetaTooLarge(usize),
    #[error("Could not join any of {0} seeds")]
    JoinFailed(usize),
    #[error("Timed out waiting for the leave broadcast")]
    LeaveTimeout,
    #[error("Message frame of {size} bytes exceeds the broadcast capacity of {max}")]
    MessageTooLarge { size: usize, max: usize },
}

/// Components shared by the protocol loops
struct Inner {
    config: Arc<NodeConfig>,
    cluster: Arc<Cluster>,
    transport: Arc<dyn Transport>,
    messenger: Arc<Messenger>,
    detector: Arc<FailureDetector>,
    sync: SyncManager,
    gate: Arc<VerificationGate>,
}

/// A running cluster member
pub struct Node {
    inner: Arc<Inner>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Start the protocol loops on `transport`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
        verifier: Arc<dyn Verifier>,
        delegate: Arc<dyn Delegate>,
    ) -> Result<Self, NodeError> {
        let mut meta = delegate.node_meta(META_MAX_SIZE);
        if meta.is_empty() {
            meta = config.meta.clone();
        }
        if meta.len() > META_MAX_SIZE {
            return Err(NodeError::MetaTooLarge(meta.len()));
        }

        let config = Arc::new(config);
        let local_addr = transport.local_addr();
        let state = ClusterState::new(config.clone(), local_addr, meta, Instant::now());
        let cluster = Arc::new(Cluster::new(state, delegate));

        let messenger = Arc::new(Messenger::new(
            transport.clone(),
            cluster.clone(),
            config.packet_budget,
        ));
        let detector = Arc::new(FailureDetector::new(
            config.clone(),
            cluster.clone(),
            messenger.clone(),
        ));
        let sync = SyncManager::new(cluster.clone(), transport.clone(), config.stream_timeout);
        let gate = Arc::new(VerificationGate::new(
            verifier,
            cluster.clone(),
            config.max_concurrent_verifications,
            config.seen_cache_size,
        ));

        let inner = Arc::new(Inner {
            config,
            cluster,
            transport,
            messenger,
            detector,
            sync,
            gate,
        });

        info!("Starting {} on {}", inner.config.name, local_addr);

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = vec![
            tokio::spawn(dispatch_loop(inner.clone(), events, shutdown_tx.subscribe())),
            tokio::spawn(probe_loop(inner.clone(), shutdown_tx.subscribe())),
            tokio::spawn(sweep_loop(inner.clone(), shutdown_tx.subscribe())),
            tokio::spawn(gossip_loop(inner.clone(), shutdown_tx.subscribe())),
        ];
        if !inner.config.push_pull_interval.is_zero() {
            tasks.push(tokio::spawn(push_pull_loop(inner.clone(), shutdown_tx.subscribe())));
        }

        Ok(Self {
            inner,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    /// Join an existing cluster through any of `seeds`.
    ///
    /// Returns how many seeds answered. Fails if none did, or if the cluster
    /// already has a live member with our name.
    pub async fn join(&self, seeds: &[SocketAddr]) -> Result<usize, NodeError> {
        let local_addr = self.local_addr();
        let seeds: Vec<SocketAddr> = seeds.iter().copied().filter(|s| *s != local_addr).collect();
        if seeds.is_empty() {
            return Ok(0);
        }

        let mut joined = 0;
        for seed in &seeds {
            match self.inner.sync.push_pull(*seed, true).await {
                Ok(applied) => {
                    info!("Joined via {} ({} updates)", seed, applied);
                    joined += 1;
                }
                Err(e @ SyncError::DuplicateIdentity { .. }) => return Err(e.into()),
                Err(e) => warn!("Failed to join via {}: {}", seed, e),
            }
        }

        if joined == 0 {
            return Err(NodeError::JoinFailed(seeds.len()));
        }
        Ok(joined)
    }

    /// Queue a proof envelope for dissemination.
    ///
    /// The envelope is not verified locally; receivers verify it before
    /// delivering or relaying.
    pub fn broadcast(&self, envelope: &ProofEnvelope) -> Result<MessageId, NodeError> {
        validate_envelope(envelope)?;
        let bytes = canonical_bytes(envelope)?;
        let size = FRAME_OVERHEAD + bytes.len();
        let max = self.inner.messenger.broadcast_capacity();
        if size > max {
            return Err(NodeError::MessageTooLarge { size, max });
        }
        let id = message_id(&bytes);

        self.inner.gate.mark_seen(id);
        self.inner.cluster.update(|s| s.enqueue_message(id, bytes));
        debug!("Queued message {} ({})", id, envelope.circuit_id);
        Ok(id)
    }

    /// Live members, ourselves included
    pub fn members(&self) -> Vec<NodeRecord> {
        self.inner.cluster.read(|s| {
            s.snapshot()
                .into_iter()
                .filter(|r| r.state.is_live())
                .collect()
        })
    }

    pub fn num_members(&self) -> usize {
        self.inner.cluster.read(|s| s.cluster_size())
    }

    /// Our latest record for `id`, whatever its state
    pub fn member(&self, id: &NodeId) -> Option<NodeRecord> {
        self.inner.cluster.read(|s| s.registry().record(id).cloned())
    }

    pub fn local_record(&self) -> NodeRecord {
        self.inner.cluster.read(|s| s.local_record())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.transport.local_addr()
    }

    /// Broadcast that we are leaving and wait up to `timeout` for it to
    /// spread. The node keeps running; call [`Node::shutdown`] afterwards.
    pub async fn leave(&self, timeout: Duration) -> Result<(), NodeError> {
        let done = self.inner.cluster.update(|s| s.leave(Instant::now()));
        info!("{} leaving the cluster", self.inner.config.name);

        if let Some(done) = done {
            if tokio::time::timeout(timeout, done).await.is_err() {
                return Err(NodeError::LeaveTimeout);
            }
        }
        Ok(())
    }

    /// Stop every loop and release the transport.
    ///
    /// In-flight verifications finish but their results are discarded.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.inner.gate.close();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(self.inner.config.probe_interval, &mut task).await.is_err() {
                debug!("Task did not stop in time, aborting");
                task.abort();
            }
        }

        self.inner.cluster.update(|s| s.clear_broadcasts());
        self.inner.transport.shutdown().await;
        info!("{} shut down", self.inner.config.name);
    }

    /// Get node statistics
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            cluster: self.inner.cluster.read(|s| s.stats()),
            probes: self.inner.detector.stats(),
            sync: self.inner.sync.stats(),
            gate: self.inner.gate.stats(),
        }
    }
}

/// Node statistics
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub cluster: ClusterStats,
    pub probes: ProbeStats,
    pub sync: SyncStats,
    pub gate: GateStats,
}

// =============================================================================
// LOOPS
// =============================================================================

async fn dispatch_loop(
    inner: Arc<Inner>,
    mut events: mpsc::Receiver<TransportEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(TransportEvent::Packet { from, bytes }) => {
                        inner.handle_packet(from, bytes).await;
                    }
                    Some(TransportEvent::Stream { from, request, reply }) => {
                        match inner.sync.handle_request(from, &request) {
                            Ok(frame) => {
                                let _ = reply.send(frame);
                            }
                            Err(e) => warn!("Push/pull from {} failed: {}", from, e),
                        }
                    }
                    None => break,
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
}

async fn probe_loop(inner: Arc<Inner>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut ticker = interval(inner.config.probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.recv() => break,
        }
        tokio::select! {
            round = inner.detector.probe_round() => {
                if let Some((target, outcome)) = round {
                    debug!("Probed {}: {:?}", target, outcome);
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}

async fn sweep_loop(inner: Arc<Inner>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut ticker = interval(inner.config.suspicion_sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                inner.detector.sweep();
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}

async fn gossip_loop(inner: Arc<Inner>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut ticker = interval(inner.config.gossip_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let targets = inner
                    .cluster
                    .read(|s| s.gossip_targets(inner.config.gossip_nodes, Instant::now()));
                for target in targets {
                    match inner.messenger.gossip(target.addr).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => debug!("Gossip to {} failed: {}", target.id, e),
                    }
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}

async fn push_pull_loop(inner: Arc<Inner>, mut shutdown_rx: broadcast::Receiver<()>) {
    let period = inner.config.push_pull_interval;
    // stagger so members started together do not sync in lockstep
    let jitter = period.mul_f64(rand::thread_rng().gen_range(0.0..1.0));
    let mut ticker = interval_at(tokio::time::Instant::now() + jitter, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(target) = inner.cluster.read(|s| s.push_pull_target()) else {
                    continue;
                };
                match inner.sync.push_pull(target.addr, false).await {
                    Ok(applied) => debug!("Push/pull with {}: {} updates", target.id, applied),
                    Err(e) => debug!("Push/pull with {} failed: {}", target.id, e),
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}

// =============================================================================
// INBOUND
// =============================================================================

impl Inner {
    async fn handle_packet(&self, from: SocketAddr, bytes: Vec<u8>) {
        let frames = match decode_packet(&bytes) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("Dropping malformed packet from {}: {}", from, e);
                return;
            }
        };

        for frame in frames {
            let frame_type = frame.frame_type;
            if let Err(e) = self.handle_frame(from, frame).await {
                warn!("Dropping {:?} frame from {}: {}", frame_type, from, e);
            }
        }
    }

    async fn handle_frame(&self, from: SocketAddr, frame: Frame) -> Result<(), FrameError> {
        match frame.frame_type {
            FrameType::Ping => {
                let ping: Ping = frame.decode_message()?;
                self.detector.handle_ping(ping).await;
            }
            FrameType::IndirectPing => {
                let request: IndirectPing = frame.decode_message()?;
                let detector = self.detector.clone();
                tokio::spawn(async move {
                    detector.relay(request).await;
                });
            }
            FrameType::Ack => {
                let ack: Ack = frame.decode_message()?;
                if !self.detector.acks().resolve(ack.seq_no, AckEvent::Ack) {
                    debug!("Late ack {} from {}", ack.seq_no, from);
                }
            }
            FrameType::Nack => {
                let nack: Nack = frame.decode_message()?;
                self.detector.acks().resolve(nack.seq_no, AckEvent::Nack);
            }
            FrameType::Update => {
                let update: MembershipUpdate = frame.decode_message()?;
                let now = Instant::now();
                self.cluster.update(|s| s.handle_update(update, now));
            }
            FrameType::User => {
                self.gate.submit(frame.payload, from);
            }
            FrameType::PushPull => {
                debug!("Ignoring push/pull datagram from {}", from);
            }
        }
        Ok(())
    }
}
