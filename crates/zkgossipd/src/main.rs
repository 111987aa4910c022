//! zkgossipd - gossip membership daemon
//!
//! Joins a cluster, keeps track of its members, and relays only those
//! application messages whose proofs verify.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zkgossip_core::proof::{seal, AttestationProver, AttestationVerifier, CircuitRegistry};
use zkgossip_core::types::{CircuitId, Witness};
use zkgossip_net::UdpTransport;
use zkgossipd::config::Config;
use zkgossipd::delegate::LoggingDelegate;
use zkgossipd::server::Node;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    if let Err(e) = init_logging(&config) {
        eprintln!("Failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    info!("zkgossipd v{}", env!("CARGO_PKG_VERSION"));

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let level = if config.verbose { "zkgossipd=debug" } else { "zkgossipd=info" };
    let filter = EnvFilter::from_default_env().add_directive(level.parse()?);

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    let (proving, verifying) = config.keys()?;
    info!("Verifying key: {}", verifying.to_hex());

    let node_config = config.node_config();
    let (transport, events) = UdpTransport::bind(
        node_config.bind_addr,
        node_config.advertise_addr,
        node_config.stream_timeout,
    )
    .await
    .with_context(|| format!("Failed to bind {}", node_config.bind_addr))?;

    let verifier = Arc::new(AttestationVerifier::new(verifying, CircuitRegistry::builtin()));
    let node = Node::start(node_config, transport, events, verifier, Arc::new(LoggingDelegate))?;

    let seeds = resolve_peers(&config.peers).await?;
    if !seeds.is_empty() {
        let joined = node.join(&seeds).await.context("Failed to join the cluster")?;
        info!("Joined cluster via {} seeds, {} members", joined, node.num_members());
    }

    if let (Some(message), Some(proving)) = (&config.message, proving) {
        let prover = AttestationProver::new(proving, CircuitRegistry::builtin());
        let witness = Witness::new(config.public_inputs.clone(), config.secret_inputs.clone());
        let envelope = seal(
            &prover,
            &CircuitId::new(config.circuit.clone()),
            &witness,
            message.as_bytes().to_vec(),
        )?;
        let id = node.broadcast(&envelope)?;
        info!("Broadcasting message {}", id);
    }

    wait_for_signal().await;
    info!("Received shutdown signal");

    if let Err(e) = node.leave(config.leave_timeout()).await {
        warn!("Leave incomplete: {}", e);
    }
    node.shutdown().await;
    Ok(())
}

async fn resolve_peers(peers: &[String]) -> anyhow::Result<Vec<SocketAddr>> {
    let mut seeds = Vec::new();
    for peer in peers {
        let addrs = tokio::net::lookup_host(peer.as_str())
            .await
            .with_context(|| format!("Failed to resolve peer {}", peer))?;
        seeds.extend(addrs);
    }
    Ok(seeds)
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
