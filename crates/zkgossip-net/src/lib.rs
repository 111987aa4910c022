//! Networking primitives for zkgossip
//!
//! This crate provides:
//! - Length-prefixed message framing, several frames per datagram
//! - The [`Transport`] abstraction the membership layer talks to
//! - A UDP (packets) + TCP (state exchange) transport
//! - An in-memory transport for tests and simulations

pub mod framing;
pub mod transport;

pub use framing::{Frame, FrameCodec, FrameError, FrameType};
pub use transport::{MemoryNetwork, Transport, TransportError, TransportEvent, UdpTransport};
