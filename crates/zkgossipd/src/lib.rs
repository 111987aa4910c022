//! zkgossipd - SWIM-style membership with proof-gated broadcasts
//!
//! Members discover each other, detect failures with direct and indirect
//! probes, and spread membership changes by piggybacking them on protocol
//! traffic. Application messages travel as proof envelopes and are only
//! delivered (and relayed) once their proof verifies.
//!
//! The [`Node`] ties the pieces together:
//! - [`Registry`] holds the merged view of every member
//! - [`BroadcastQueue`] schedules retransmissions
//! - [`SyncManager`] runs full state exchanges
//! - [`VerificationGate`] checks proofs before delivery

pub mod broadcast;
pub mod config;
pub mod delegate;
pub mod detector;
pub mod gate;
pub mod membership;
pub mod messenger;
pub mod server;
pub mod state;
pub mod suspicion;
pub mod sync;

pub use broadcast::BroadcastQueue;
pub use config::{Config, NodeConfig};
pub use delegate::{ChannelDelegate, Delegate, DelegateEvent, LoggingDelegate};
pub use gate::VerificationGate;
pub use membership::Registry;
pub use server::{Node, NodeError, NodeStats};
pub use sync::SyncManager;
