//! Failure detector
//!
//! Each round probes one member directly, falls back to indirect probes
//! through a few random intermediaries, and reports the outcome to the
//! cluster state. Any ack, direct or relayed, counts.

use crate::config::NodeConfig;
use crate::messenger::Messenger;
use crate::state::Cluster;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use zkgossip_core::types::*;
use zkgossip_net::FrameType;

/// Response to an outstanding probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckEvent {
    Ack,
    Nack,
}

/// Outstanding probes keyed by sequence number
#[derive(Debug, Default)]
pub struct AckTracker {
    pending: Mutex<HashMap<SeqNo, mpsc::UnboundedSender<AckEvent>>>,
}

impl AckTracker {
    pub fn register(&self, seq_no: SeqNo) -> mpsc::UnboundedReceiver<AckEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().insert(seq_no, tx);
        rx
    }

    /// Route a response; false if nobody is waiting for it
    pub fn resolve(&self, seq_no: SeqNo, event: AckEvent) -> bool {
        match self.pending.lock().get(&seq_no) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn unregister(&self, seq_no: SeqNo) {
        self.pending.lock().remove(&seq_no);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// How a probe ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Direct,
    Indirect,
    Failed,
}

#[derive(Debug, Default)]
struct Counters {
    probes: AtomicU64,
    direct: AtomicU64,
    indirect: AtomicU64,
    failed: AtomicU64,
    relayed: AtomicU64,
}

/// Probe statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeStats {
    pub probes: u64,
    pub direct_acks: u64,
    pub indirect_acks: u64,
    pub failures: u64,
    pub relayed: u64,
}

pub struct FailureDetector {
    config: Arc<NodeConfig>,
    cluster: Arc<Cluster>,
    messenger: Arc<Messenger>,
    acks: AckTracker,
    counters: Counters,
}

impl FailureDetector {
    pub fn new(config: Arc<NodeConfig>, cluster: Arc<Cluster>, messenger: Arc<Messenger>) -> Self {
        Self {
            config,
            cluster,
            messenger,
            acks: AckTracker::default(),
            counters: Counters::default(),
        }
    }

    pub fn acks(&self) -> &AckTracker {
        &self.acks
    }

    /// Probe the next member in the rotation and apply the result
    pub async fn probe_round(&self) -> Option<(NodeId, ProbeOutcome)> {
        let target = self
            .cluster
            .update(|s| s.next_probe_target(Instant::now()))?;

        let outcome = self.probe(&target).await;
        let now = Instant::now();
        match outcome {
            ProbeOutcome::Failed => {
                self.cluster.update(|s| s.probe_failed(&target.id, now));
            }
            ProbeOutcome::Direct | ProbeOutcome::Indirect => {
                self.cluster.update(|s| s.probe_acked(&target.id, now));
            }
        }
        Some((target.id, outcome))
    }

    /// Probe `target`, directly first and then through intermediaries
    pub async fn probe(&self, target: &NodeRecord) -> ProbeOutcome {
        self.counters.probes.fetch_add(1, Ordering::Relaxed);
        let (seq_no, source, source_addr) = self
            .cluster
            .update(|s| (s.next_seq_no(), s.local_id().clone(), s.local_addr()));

        let mut rx = self.acks.register(seq_no);
        let deadline = tokio::time::Instant::now() + self.config.probe_interval;

        let ping = Ping {
            seq_no,
            target: target.id.clone(),
            source: source.clone(),
            source_addr,
        };
        if let Err(e) = self
            .messenger
            .send_message(target.addr, FrameType::Ping, &ping)
            .await
        {
            debug!("Failed to ping {}: {}", target.id, e);
        }

        let outcome = match timeout(self.config.probe_timeout, rx.recv()).await {
            Ok(Some(AckEvent::Ack)) => ProbeOutcome::Direct,
            _ => {
                self.probe_indirect(target, seq_no, source, source_addr, &mut rx, deadline)
                    .await
            }
        };
        self.acks.unregister(seq_no);

        let counter = match outcome {
            ProbeOutcome::Direct => &self.counters.direct,
            ProbeOutcome::Indirect => &self.counters.indirect,
            ProbeOutcome::Failed => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    async fn probe_indirect(
        &self,
        target: &NodeRecord,
        seq_no: SeqNo,
        source: NodeId,
        source_addr: std::net::SocketAddr,
        rx: &mut mpsc::UnboundedReceiver<AckEvent>,
        deadline: tokio::time::Instant,
    ) -> ProbeOutcome {
        let helpers = self
            .cluster
            .read(|s| s.indirect_candidates(&target.id, self.config.indirect_checks));

        let request = IndirectPing {
            seq_no,
            target: target.id.clone(),
            target_addr: target.addr,
            source,
            source_addr,
            nack: true,
        };
        for helper in &helpers {
            if let Err(e) = self
                .messenger
                .send_message(helper.addr, FrameType::IndirectPing, &request)
                .await
            {
                debug!("Failed to ask {} to probe {}: {}", helper.id, target.id, e);
            }
        }

        // a late direct ack still counts
        let mut nacks = 0;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(AckEvent::Ack)) => return ProbeOutcome::Indirect,
                Ok(Some(AckEvent::Nack)) => {
                    nacks += 1;
                    if nacks >= helpers.len() {
                        break;
                    }
                }
                _ => break,
            }
        }

        debug!(
            "Probe of {} failed ({} of {} intermediaries nacked)",
            target.id,
            nacks,
            helpers.len()
        );
        ProbeOutcome::Failed
    }

    /// Answer a direct probe addressed to us
    pub async fn handle_ping(&self, ping: Ping) {
        let is_target = self.cluster.read(|s| s.local_id() == &ping.target);
        if !is_target {
            debug!("Ignoring ping for {} from {}", ping.target, ping.source);
            return;
        }
        let ack = Ack { seq_no: ping.seq_no };
        if let Err(e) = self
            .messenger
            .send_message(ping.source_addr, FrameType::Ack, &ack)
            .await
        {
            debug!("Failed to ack {}: {}", ping.source, e);
        }
    }

    /// Probe `request.target` on behalf of another member and relay the result
    pub async fn relay(&self, request: IndirectPing) {
        self.counters.relayed.fetch_add(1, Ordering::Relaxed);
        let (seq_no, source, source_addr) = self
            .cluster
            .update(|s| (s.next_seq_no(), s.local_id().clone(), s.local_addr()));

        let mut rx = self.acks.register(seq_no);
        let ping = Ping {
            seq_no,
            target: request.target.clone(),
            source,
            source_addr,
        };
        if let Err(e) = self
            .messenger
            .send_message(request.target_addr, FrameType::Ping, &ping)
            .await
        {
            debug!("Failed to relay probe to {}: {}", request.target, e);
        }

        let acked = matches!(
            timeout(self.config.probe_timeout, rx.recv()).await,
            Ok(Some(AckEvent::Ack))
        );
        self.acks.unregister(seq_no);

        let result = if acked {
            self.messenger
                .send_message(request.source_addr, FrameType::Ack, &Ack { seq_no: request.seq_no })
                .await
        } else if request.nack {
            self.messenger
                .send_message(request.source_addr, FrameType::Nack, &Nack { seq_no: request.seq_no })
                .await
        } else {
            Ok(())
        };
        if let Err(e) = result {
            debug!("Failed to answer indirect probe from {}: {}", request.source, e);
        }
    }

    /// Fire expired suspicion timers
    pub fn sweep(&self) -> Vec<NodeId> {
        self.cluster
            .update(|s| s.expire_suspicions(Instant::now()))
    }

    pub fn stats(&self) -> ProbeStats {
        ProbeStats {
            probes: self.counters.probes.load(Ordering::Relaxed),
            direct_acks: self.counters.direct.load(Ordering::Relaxed),
            indirect_acks: self.counters.indirect.load(Ordering::Relaxed),
            failures: self.counters.failed.load(Ordering::Relaxed),
            relayed: self.counters.relayed.load(Ordering::Relaxed),
        }
    }
}
