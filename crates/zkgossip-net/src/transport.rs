//! Transport layer
//!
//! Best-effort datagrams for probes and gossip, plus a reliable
//! request/response stream for full state exchange. The membership layer only
//! sees the [`Transport`] trait and the [`TransportEvent`] channel.

use crate::framing::{Frame, FrameCodec, FrameError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Largest payload a UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Capacity of the inbound event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Timed out talking to {0}")]
    Timeout(SocketAddr),
    #[error("Peer unreachable: {0}")]
    Unreachable(SocketAddr),
    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),
}

/// Event from the transport layer
#[derive(Debug)]
pub enum TransportEvent {
    /// Datagram received
    Packet { from: SocketAddr, bytes: Vec<u8> },
    /// Stream request awaiting a single reply frame
    Stream {
        from: SocketAddr,
        request: Frame,
        reply: oneshot::Sender<Frame>,
    },
}

/// What the membership layer needs from the network
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Address other nodes reach us at
    fn local_addr(&self) -> SocketAddr;

    /// Fire-and-forget datagram
    async fn send(&self, to: SocketAddr, bytes: &[u8]) -> Result<(), TransportError>;

    /// Reliable request/response exchange, bounded by `timeout`
    async fn exchange(
        &self,
        to: SocketAddr,
        request: Frame,
        timeout: Duration,
    ) -> Result<Frame, TransportError>;

    /// Stop receiving and release network resources
    async fn shutdown(&self);
}

// =============================================================================
// UDP + TCP
// =============================================================================

/// Datagrams over UDP, state exchange over TCP on the same port
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    advertise_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind UDP and TCP listeners and start the receive loops.
    ///
    /// With port 0 the TCP listener takes whatever port UDP was assigned.
    pub async fn bind(
        bind_addr: SocketAddr,
        advertise_addr: Option<SocketAddr>,
        stream_timeout: Duration,
    ) -> Result<(Arc<Self>, mpsc::Receiver<TransportEvent>), TransportError> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let bound = socket.local_addr()?;
        let listener = TcpListener::bind(bound).await?;

        let advertise_addr = advertise_addr.unwrap_or_else(|| {
            if bound.ip().is_unspecified() {
                SocketAddr::from(([127, 0, 0, 1], bound.port()))
            } else {
                bound
            }
        });
        info!("Transport listening on {} (advertising {})", bound, advertise_addr);

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let packet_task = tokio::spawn(Self::packet_loop(socket.clone(), event_tx.clone()));
        let stream_task = tokio::spawn(Self::accept_loop(listener, event_tx, stream_timeout));

        let transport = Arc::new(Self {
            socket,
            advertise_addr,
            tasks: Mutex::new(vec![packet_task, stream_task]),
        });
        Ok((transport, event_rx))
    }

    async fn packet_loop(socket: Arc<UdpSocket>, event_tx: mpsc::Sender<TransportEvent>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    let event = TransportEvent::Packet {
                        from,
                        bytes: buf[..len].to_vec(),
                    };
                    if event_tx.try_send(event).is_err() {
                        debug!("Inbound queue full, dropping packet from {}", from);
                    }
                }
                Err(e) => {
                    // ICMP errors from earlier sends surface here on some platforms
                    debug!("UDP receive error: {}", e);
                }
            }
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        event_tx: mpsc::Sender<TransportEvent>,
        stream_timeout: Duration,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, from)) => {
                    let event_tx = event_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::serve_stream(stream, from, event_tx, stream_timeout).await
                        {
                            debug!("Stream from {} failed: {}", from, e);
                        }
                    });
                }
                Err(e) => warn!("Accept error: {}", e),
            }
        }
    }

    async fn serve_stream(
        stream: TcpStream,
        from: SocketAddr,
        event_tx: mpsc::Sender<TransportEvent>,
        stream_timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut framed = Framed::new(stream, FrameCodec::new());

        let request = tokio::time::timeout(stream_timeout, framed.next())
            .await
            .map_err(|_| TransportError::Timeout(from))?
            .ok_or(TransportError::ConnectionClosed)??;

        let (reply_tx, reply_rx) = oneshot::channel();
        event_tx
            .send(TransportEvent::Stream {
                from,
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        let reply = tokio::time::timeout(stream_timeout, reply_rx)
            .await
            .map_err(|_| TransportError::Timeout(from))?
            .map_err(|_| TransportError::ConnectionClosed)?;

        tokio::time::timeout(stream_timeout, framed.send(reply))
            .await
            .map_err(|_| TransportError::Timeout(from))??;
        Ok(())
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.advertise_addr
    }

    async fn send(&self, to: SocketAddr, bytes: &[u8]) -> Result<(), TransportError> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::PacketTooLarge(bytes.len()));
        }
        self.socket.send_to(bytes, to).await?;
        Ok(())
    }

    async fn exchange(
        &self,
        to: SocketAddr,
        request: Frame,
        timeout: Duration,
    ) -> Result<Frame, TransportError> {
        tokio::time::timeout(timeout, async {
            let stream = TcpStream::connect(to).await?;
            let mut framed = Framed::new(stream, FrameCodec::new());
            framed.send(request).await?;
            framed
                .next()
                .await
                .ok_or(TransportError::ConnectionClosed)?
                .map_err(TransportError::from)
        })
        .await
        .map_err(|_| TransportError::Timeout(to))?
    }

    async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Transport on {} shut down", self.advertise_addr);
    }
}

// =============================================================================
// IN-MEMORY
// =============================================================================

/// Shared medium connecting [`MemoryTransport`] endpoints.
///
/// Nodes can be isolated to simulate crashes, and individual links cut to
/// simulate partial partitions: affected packets are silently dropped and
/// exchanges fail.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<RwLock<MemoryNetworkInner>>,
}

#[derive(Default)]
struct MemoryNetworkInner {
    endpoints: HashMap<SocketAddr, mpsc::Sender<TransportEvent>>,
    isolated: HashSet<SocketAddr>,
    cut: HashSet<(SocketAddr, SocketAddr)>,
}

fn link(a: SocketAddr, b: SocketAddr) -> (SocketAddr, SocketAddr) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint at `addr`
    pub fn bind(&self, addr: SocketAddr) -> (Arc<MemoryTransport>, mpsc::Receiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.inner.write().endpoints.insert(addr, event_tx);
        let transport = Arc::new(MemoryTransport {
            addr,
            network: self.clone(),
        });
        (transport, event_rx)
    }

    /// Drop all traffic to and from `addr`
    pub fn isolate(&self, addr: SocketAddr) {
        self.inner.write().isolated.insert(addr);
    }

    /// Undo [`MemoryNetwork::isolate`]
    pub fn heal(&self, addr: SocketAddr) {
        self.inner.write().isolated.remove(&addr);
    }

    /// Drop traffic between `a` and `b` in both directions
    pub fn cut(&self, a: SocketAddr, b: SocketAddr) {
        self.inner.write().cut.insert(link(a, b));
    }

    /// Undo [`MemoryNetwork::cut`]
    pub fn mend(&self, a: SocketAddr, b: SocketAddr) {
        self.inner.write().cut.remove(&link(a, b));
    }

    fn route(&self, from: SocketAddr, to: SocketAddr) -> Option<mpsc::Sender<TransportEvent>> {
        let inner = self.inner.read();
        if inner.isolated.contains(&from)
            || inner.isolated.contains(&to)
            || inner.cut.contains(&link(from, to))
        {
            return None;
        }
        inner.endpoints.get(&to).cloned()
    }
}

/// Endpoint on a [`MemoryNetwork`]
pub struct MemoryTransport {
    addr: SocketAddr,
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send(&self, to: SocketAddr, bytes: &[u8]) -> Result<(), TransportError> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::PacketTooLarge(bytes.len()));
        }
        // Best effort, like UDP: unknown or unreachable peers swallow the packet
        if let Some(tx) = self.network.route(self.addr, to) {
            let _ = tx.try_send(TransportEvent::Packet {
                from: self.addr,
                bytes: bytes.to_vec(),
            });
        }
        Ok(())
    }

    async fn exchange(
        &self,
        to: SocketAddr,
        request: Frame,
        timeout: Duration,
    ) -> Result<Frame, TransportError> {
        let tx = self
            .network
            .route(self.addr, to)
            .ok_or(TransportError::Unreachable(to))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(TransportEvent::Stream {
            from: self.addr,
            request,
            reply: reply_tx,
        })
        .await
        .map_err(|_| TransportError::Unreachable(to))?;

        tokio::time::timeout(timeout, reply_rx)
            .await
            .map_err(|_| TransportError::Timeout(to))?
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn shutdown(&self) {
        self.network.inner.write().endpoints.remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameType;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_memory_packet_delivery() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = network.bind(addr(1));
        let (_b, mut b_rx) = network.bind(addr(2));

        a.send(addr(2), b"hello").await.unwrap();

        match b_rx.recv().await.unwrap() {
            TransportEvent::Packet { from, bytes } => {
                assert_eq!(from, addr(1));
                assert_eq!(bytes, b"hello");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_memory_isolation_drops_packets() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = network.bind(addr(1));
        let (_b, mut b_rx) = network.bind(addr(2));

        network.isolate(addr(2));
        a.send(addr(2), b"lost").await.unwrap();
        assert!(b_rx.try_recv().is_err());
        assert!(a
            .exchange(addr(2), Frame::new(FrameType::PushPull, vec![]), Duration::from_millis(50))
            .await
            .is_err());

        network.heal(addr(2));
        a.send(addr(2), b"found").await.unwrap();
        assert!(b_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_memory_cut_link() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = network.bind(addr(1));
        let (_b, mut b_rx) = network.bind(addr(2));
        let (c, _c_rx) = network.bind(addr(3));

        network.cut(addr(2), addr(1));
        a.send(addr(2), b"lost").await.unwrap();
        c.send(addr(2), b"relayed").await.unwrap();
        match b_rx.try_recv().unwrap() {
            TransportEvent::Packet { from, .. } => assert_eq!(from, addr(3)),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(b_rx.try_recv().is_err());

        network.mend(addr(1), addr(2));
        a.send(addr(2), b"found").await.unwrap();
        assert!(b_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_memory_exchange() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = network.bind(addr(1));
        let (_b, mut b_rx) = network.bind(addr(2));

        tokio::spawn(async move {
            if let Some(TransportEvent::Stream { request, reply, .. }) = b_rx.recv().await {
                let mut payload = request.payload;
                payload.reverse();
                let _ = reply.send(Frame::new(FrameType::PushPull, payload));
            }
        });

        let reply = a
            .exchange(
                addr(2),
                Frame::new(FrameType::PushPull, vec![1, 2, 3]),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(reply.payload, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_udp_transport_roundtrip() {
        let timeout = Duration::from_secs(2);
        let (a, _a_rx) = UdpTransport::bind(addr(0), None, timeout).await.unwrap();
        let (b, mut b_rx) = UdpTransport::bind(addr(0), None, timeout).await.unwrap();

        a.send(b.local_addr(), b"ping").await.unwrap();
        match tokio::time::timeout(timeout, b_rx.recv()).await.unwrap().unwrap() {
            TransportEvent::Packet { bytes, .. } => assert_eq!(bytes, b"ping"),
            other => panic!("unexpected event: {:?}", other),
        }

        tokio::spawn(async move {
            while let Some(event) = b_rx.recv().await {
                if let TransportEvent::Stream { request, reply, .. } = event {
                    let _ = reply.send(request);
                }
            }
        });

        let frame = Frame::new(FrameType::PushPull, vec![4, 5, 6]);
        let echoed = a.exchange(b.local_addr(), frame.clone(), timeout).await.unwrap();
        assert_eq!(echoed, frame);

        a.shutdown().await;
        b.shutdown().await;
    }
}
