//! Outgoing datagrams
//!
//! Every packet carries one primary frame followed by as many pending
//! broadcasts as fit in the packet budget.

use crate::state::Cluster;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use zkgossip_net::framing::{encode_packet, FRAME_OVERHEAD};
use zkgossip_net::{Frame, FrameType, Transport, TransportError};

/// Upper bound on the encoded size of a primary frame (an indirect ping
/// between two longest-named members)
pub const PRIMARY_FRAME_RESERVE: usize = 320;

pub struct Messenger {
    transport: Arc<dyn Transport>,
    cluster: Arc<Cluster>,
    packet_budget: usize,
}

impl Messenger {
    pub fn new(transport: Arc<dyn Transport>, cluster: Arc<Cluster>, packet_budget: usize) -> Self {
        Self {
            transport,
            cluster,
            packet_budget,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Largest broadcast frame that still fits next to any primary frame
    pub fn broadcast_capacity(&self) -> usize {
        self.packet_budget.saturating_sub(PRIMARY_FRAME_RESERVE)
    }

    /// Encode `message` and send it with piggybacked broadcasts
    pub async fn send_message<T: Serialize + Sync>(
        &self,
        to: SocketAddr,
        frame_type: FrameType,
        message: &T,
    ) -> Result<(), TransportError> {
        let frame = Frame::encode_message(frame_type, message)?;
        self.send(to, frame).await
    }

    /// Send `frame`, filling the rest of the packet with broadcasts
    pub async fn send(&self, to: SocketAddr, frame: Frame) -> Result<(), TransportError> {
        let budget = self.packet_budget.saturating_sub(frame.encoded_len());
        let piggyback = self.piggyback(budget);
        let packet = encode_packet(&frame, &piggyback)?;
        self.transport.send(to, &packet).await
    }

    /// Send a packet made only of broadcasts.
    ///
    /// Returns false when nothing was pending.
    pub async fn gossip(&self, to: SocketAddr) -> Result<bool, TransportError> {
        let piggyback = self.piggyback(self.packet_budget);
        if piggyback.is_empty() {
            return Ok(false);
        }
        self.transport.send(to, &piggyback.concat()).await?;
        Ok(true)
    }

    /// Pending broadcasts within `budget` bytes, queued ones first, then the
    /// delegate's
    fn piggyback(&self, budget: usize) -> Vec<Vec<u8>> {
        // queued items are complete frames already
        let mut frames = self.cluster.update(|s| s.take_broadcasts(0, budget));
        let mut used: usize = frames.iter().map(Vec::len).sum();

        let remaining = budget.saturating_sub(used);
        if remaining > FRAME_OVERHEAD {
            for payload in self.cluster.delegate().get_broadcasts(FRAME_OVERHEAD, remaining) {
                if used + FRAME_OVERHEAD + payload.len() > budget {
                    continue;
                }
                if let Ok(bytes) = Frame::new(FrameType::User, payload).to_bytes() {
                    used += bytes.len();
                    frames.push(bytes);
                }
            }
        }
        frames
    }
}
