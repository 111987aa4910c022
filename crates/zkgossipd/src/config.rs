//! Configuration for zkgossipd

use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use zkgossip_core::crypto::derive_setup_seed;
use zkgossip_core::proof::{setup, ProvingKey, VerifyingKey};
use zkgossip_core::types::NodeId;

/// zkgossipd - gossip membership with proof-gated broadcasts
#[derive(Parser, Debug, Clone)]
#[command(name = "zkgossipd")]
#[command(about = "SWIM-style membership daemon that only relays verified messages")]
pub struct Config {
    /// Port for gossip traffic (UDP and TCP)
    #[arg(short, long, env = "ZKGOSSIP_PORT", default_value = "7946")]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "ZKGOSSIP_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Address other members should use to reach us
    #[arg(long, env = "ZKGOSSIP_ADVERTISE")]
    pub advertise: Option<SocketAddr>,

    /// Node name (defaults to node-<port>)
    #[arg(long, env = "ZKGOSSIP_NAME")]
    pub name: Option<String>,

    /// Message to prove and broadcast after joining
    #[arg(short, long)]
    pub message: Option<String>,

    /// Circuit the broadcast message is proven against
    #[arg(long, default_value = "mul")]
    pub circuit: String,

    /// Public inputs of the broadcast statement
    #[arg(long, value_delimiter = ',', default_value = "1")]
    pub public_inputs: Vec<u64>,

    /// Secret witness values of the broadcast statement
    #[arg(long, value_delimiter = ',', default_value = "1,1")]
    pub secret_inputs: Vec<u64>,

    /// Shared setup phrase; every member derives the same keys from it
    #[arg(long, env = "ZKGOSSIP_SETUP_PHRASE")]
    pub setup_phrase: Option<String>,

    /// Hex verifying key for verify-only members
    #[arg(long, env = "ZKGOSSIP_VERIFYING_KEY")]
    pub verifying_key: Option<String>,

    /// Probe interval in milliseconds
    #[arg(long, default_value = "1000")]
    pub probe_interval_ms: u64,

    /// Direct probe timeout in milliseconds
    #[arg(long, default_value = "200")]
    pub probe_timeout_ms: u64,

    /// Intermediaries asked to probe on our behalf
    #[arg(long, default_value = "1")]
    pub indirect_checks: usize,

    /// Retransmit multiplier for broadcasts
    #[arg(long, default_value = "3")]
    pub retransmit_mult: u32,

    /// Suspicion timeout multiplier
    #[arg(long, default_value = "3")]
    pub suspicion_mult: u32,

    /// Full state exchange interval in seconds (0 disables)
    #[arg(long, default_value = "15")]
    pub push_pull_interval_secs: u64,

    /// Gossip interval in milliseconds
    #[arg(long, default_value = "100")]
    pub gossip_interval_ms: u64,

    /// Members gossiped to per interval
    #[arg(long, default_value = "3")]
    pub gossip_nodes: usize,

    /// Seconds to wait for the leave broadcast on shutdown
    #[arg(long, default_value = "5")]
    pub leave_timeout_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Seed members to join (host:port)
    pub peers: Vec<String>,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.log_format != "pretty" && self.log_format != "json" {
            anyhow::bail!("Unknown log format: {}", self.log_format);
        }
        if self.setup_phrase.is_none() && self.verifying_key.is_none() {
            anyhow::bail!("Either --setup-phrase or --verifying-key is required");
        }
        if self.message.is_some() && self.setup_phrase.is_none() {
            anyhow::bail!("Broadcasting a message requires --setup-phrase");
        }
        if self.probe_interval_ms == 0 || self.gossip_interval_ms == 0 {
            anyhow::bail!("Intervals must be non-zero");
        }
        if self.probe_timeout_ms >= self.probe_interval_ms {
            anyhow::bail!("Probe timeout must be shorter than the probe interval");
        }
        Ok(())
    }

    /// Node name, defaulting to node-<port>
    pub fn node_name(&self) -> NodeId {
        match &self.name {
            Some(name) => NodeId::new(name.clone()),
            None => NodeId::new(format!("node-{}", self.port)),
        }
    }

    /// Resolve proof keys.
    ///
    /// A setup phrase yields both keys. A verifying key alone makes a
    /// verify-only member; if both are given they must agree.
    pub fn keys(&self) -> anyhow::Result<(Option<ProvingKey>, VerifyingKey)> {
        let configured = match &self.verifying_key {
            Some(hex) => Some(VerifyingKey::from_hex(hex)?),
            None => None,
        };

        match (&self.setup_phrase, configured) {
            (Some(phrase), configured) => {
                let (proving, verifying) = setup(&derive_setup_seed(phrase));
                if let Some(expected) = configured {
                    if expected != verifying {
                        anyhow::bail!("--verifying-key does not match the setup phrase");
                    }
                }
                Ok((Some(proving), verifying))
            }
            (None, Some(verifying)) => Ok((None, verifying)),
            (None, None) => anyhow::bail!("No proof keys configured"),
        }
    }

    /// Runtime configuration for the node
    pub fn node_config(&self) -> NodeConfig {
        let mut config = NodeConfig::lan(self.node_name(), SocketAddr::new(self.bind, self.port));
        config.advertise_addr = self.advertise;
        config.probe_interval = Duration::from_millis(self.probe_interval_ms);
        config.probe_timeout = Duration::from_millis(self.probe_timeout_ms);
        config.indirect_checks = self.indirect_checks;
        config.retransmit_mult = self.retransmit_mult;
        config.suspicion_mult = self.suspicion_mult;
        config.push_pull_interval = Duration::from_secs(self.push_pull_interval_secs);
        config.gossip_interval = Duration::from_millis(self.gossip_interval_ms);
        config.gossip_nodes = self.gossip_nodes;
        config
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_secs(self.leave_timeout_secs)
    }
}

/// Runtime tunables of a node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique node name
    pub name: NodeId,
    pub bind_addr: SocketAddr,
    pub advertise_addr: Option<SocketAddr>,
    /// Opaque metadata advertised with our record
    pub meta: Vec<u8>,

    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub indirect_checks: usize,

    pub retransmit_mult: u32,
    pub suspicion_mult: u32,
    pub suspicion_max_timeout_mult: u32,
    /// How often expired suspicion timers are swept
    pub suspicion_sweep_interval: Duration,

    /// Full state exchange interval; zero disables the loop
    pub push_pull_interval: Duration,
    pub gossip_interval: Duration,
    pub gossip_nodes: usize,
    /// Dead members keep receiving gossip, and stay in the registry, this long
    pub gossip_to_the_dead: Duration,

    /// Byte budget of one outgoing datagram
    pub packet_budget: usize,
    /// Timeout for stream exchanges (push/pull)
    pub stream_timeout: Duration,
    /// Pending broadcasts kept before the oldest are pruned
    pub max_queued_broadcasts: usize,

    pub max_concurrent_verifications: usize,
    /// Message ids remembered for de-duplication
    pub seen_cache_size: usize,
}

impl NodeConfig {
    /// Defaults tuned for a local area network
    pub fn lan(name: NodeId, bind_addr: SocketAddr) -> Self {
        Self {
            name,
            bind_addr,
            advertise_addr: None,
            meta: Vec::new(),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(200),
            indirect_checks: 1,
            retransmit_mult: 3,
            suspicion_mult: 3,
            suspicion_max_timeout_mult: 6,
            suspicion_sweep_interval: Duration::from_millis(100),
            push_pull_interval: Duration::from_secs(15),
            gossip_interval: Duration::from_millis(100),
            gossip_nodes: 3,
            gossip_to_the_dead: Duration::from_secs(15),
            packet_budget: 1400,
            stream_timeout: Duration::from_secs(10),
            max_queued_broadcasts: 1024,
            max_concurrent_verifications: 4,
            seen_cache_size: 4096,
        }
    }

    /// Fast timings for nodes on a single host
    pub fn local(name: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            probe_interval: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(50),
            suspicion_sweep_interval: Duration::from_millis(20),
            push_pull_interval: Duration::from_secs(1),
            gossip_interval: Duration::from_millis(20),
            gossip_to_the_dead: Duration::from_secs(2),
            stream_timeout: Duration::from_secs(1),
            ..Self::lan(NodeId::new(name), bind_addr)
        }
    }

    /// Unspecified bind address on the default port
    pub fn default_bind() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7946)
    }
}
