// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Replicated chat log peer.
//!
//! Each process is both a server (accepting connections from other peers
//! and clients) and a client (submitting chat text through the leader).
//!
//! # Usage
//!
//! ```bash
//! # First peer in a new cluster, scanning a local port range for others
//! chat-peer --peer-id 1 --port 6001 --scan-port-range 6001:6010
//!
//! # Join a known seed
//! chat-peer --peer-id 2 --port 6002 --seed 127.0.0.1:6001
//!
//! # Load settings from a file, override the log level from the CLI
//! chat-peer --peer-id 3 --port 6003 --config peer3.yaml --log-level debug
//! ```

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chat_peer::config::{PeerConfig, PortRange, SeedAddr};
use chat_peer::ChatPeer;

#[derive(Parser, Debug)]
#[command(name = "chat-peer")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Unique, totally ordered peer identifier (higher wins elections).
    #[arg(long)]
    peer_id: Option<u64>,

    /// Bind address.
    #[arg(long)]
    host: Option<IpAddr>,

    /// TCP port to listen on.
    #[arg(long)]
    port: Option<u16>,

    /// Directory holding this peer's append-only log file.
    #[arg(long)]
    log_dir: Option<String>,

    /// JSON or YAML configuration file; CLI flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seed peer address for bootstrap, `host:port`. Repeatable.
    #[arg(long = "seed")]
    seeds: Vec<String>,

    /// Port range to scan for an existing cluster, `start:end`.
    #[arg(long)]
    scan_port_range: Option<String>,

    #[arg(long)]
    heartbeat_interval_ms: Option<u64>,

    #[arg(long)]
    leader_timeout_ms: Option<u64>,

    #[arg(long)]
    election_timeout_ms: Option<u64>,

    #[arg(long)]
    max_failures: Option<u32>,

    /// Chat room id carried on every message (no isolation between rooms).
    #[arg(long)]
    room_id: Option<String>,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_seed(raw: &str) -> Result<SeedAddr> {
    let (host, port) = raw
        .rsplit_once(':')
        .context("seed must be in host:port form")?;
    Ok(SeedAddr {
        host: host.to_string(),
        port: port.parse().context("invalid seed port")?,
    })
}

fn parse_port_range(raw: &str) -> Result<PortRange> {
    let (start, end) = raw
        .split_once(':')
        .context("scan-port-range must be in start:end form")?;
    Ok(PortRange {
        start: start.parse().context("invalid scan range start")?,
        end: end.parse().context("invalid scan range end")?,
    })
}

/// Merge CLI flags over a loaded config file, or build one from flags alone.
/// CLI flags always win; file values win over built-in defaults.
fn resolve_config(args: &Args) -> Result<PeerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!(?path, "loading config file");
            PeerConfig::from_file(path).map_err(|e| anyhow::anyhow!(e))?
        }
        None => PeerConfig {
            peer_id: args.peer_id.context("--peer-id is required without --config")?,
            host: "0.0.0.0".parse().unwrap(),
            port: args.port.context("--port is required without --config")?,
            log_dir: "./data/logs".to_string(),
            heartbeat_interval_ms: 800,
            leader_timeout_ms: 2500,
            election_timeout_ms: 2000,
            max_failures: 3,
            seeds: Vec::new(),
            scan_port_range: None,
            room_id: "general".to_string(),
        },
    };

    if let Some(peer_id) = args.peer_id {
        config.peer_id = peer_id;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(log_dir) = &args.log_dir {
        config.log_dir = log_dir.clone();
    }
    if !args.seeds.is_empty() {
        config.seeds = args
            .seeds
            .iter()
            .map(|s| parse_seed(s))
            .collect::<Result<Vec<_>>>()?;
    }
    if let Some(range) = &args.scan_port_range {
        config.scan_port_range = Some(parse_port_range(range)?);
    }
    if let Some(v) = args.heartbeat_interval_ms {
        config.heartbeat_interval_ms = v;
    }
    if let Some(v) = args.leader_timeout_ms {
        config.leader_timeout_ms = v;
    }
    if let Some(v) = args.election_timeout_ms {
        config.election_timeout_ms = v;
    }
    if let Some(v) = args.max_failures {
        config.max_failures = v;
    }
    if let Some(room_id) = &args.room_id {
        config.room_id = room_id.clone();
    }

    config.validate().map_err(|e| anyhow::anyhow!(e))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let config = resolve_config(&args)?;

    info!("+----------------------------------------------------+");
    info!("|  chat-peer v{:<40}|", env!("CARGO_PKG_VERSION"));
    info!("+----------------------------------------------------+");
    info!("|  peer_id: {:<41}|", config.peer_id);
    info!("|  addr:    {:<41}|", format!("{}:{}", config.host, config.port));
    info!("|  room:    {:<41}|", config.room_id);
    info!("+----------------------------------------------------+");

    let peer = ChatPeer::new(config).await?;

    peer.set_message_callback(|msg| {
        println!("[seq={}] <peer_{}>: {}", msg.seq_no, msg.sender_id, msg.text);
    })
    .await;

    let shutdown_peer = peer.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received, stopping peer...");
        shutdown_peer.shutdown();
    });

    peer.run().await?;

    info!("chat-peer stopped");
    Ok(())
}
