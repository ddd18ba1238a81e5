// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! BP daemon binary.
//!
//! Owns the wireless interface and emits one beacon per jittered period,
//! multiplexing the payloads of registered client protocols.
//!
//! ```bash
//! # Default configuration on wlan0
//! dcp-bp-daemon
//!
//! # Custom configuration file and interface override
//! dcp-bp-daemon --config /etc/dcp/bp.json --interface wlp3s0
//! ```

use clap::Parser;
use dcp::bp::transport::BeaconTransport;
use dcp::bp::BpDaemon;
use dcp::cmdsock::CommandServer;
use dcp::config::{BpDaemonConfig, ConfigError};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

mod logging;
mod packet;

use packet::PacketTransport;

/// Beaconing Protocol daemon for drone swarm middleware.
#[derive(Parser, Debug)]
#[command(name = "dcp-bp-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured wireless interface
    #[arg(short, long)]
    interface: Option<String>,

    /// Override the configured command socket path
    #[arg(long)]
    socket: Option<String>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BpDaemonConfig::from_file(path)?,
        None => BpDaemonConfig::default(),
    };
    if let Some(interface) = args.interface {
        config.bp.interface_name = interface;
    }
    if let Some(socket) = args.socket {
        config.bp.command_socket_path = socket;
    }
    if let Some(level) = args.log_level {
        config.logging.severity_level = level;
    }
    config.validate()?;

    logging::init(&config.logging, "bp")?;

    let (tx, mtu) = PacketTransport::open(
        &config.bp.interface_name,
        config.bp.interface_ether_type,
    )?;
    if u32::from(config.bp.interface_mtu_size) > mtu {
        return Err(ConfigError(format!(
            "interface_mtuSize {} exceeds actual MTU {mtu} of {}",
            config.bp.interface_mtu_size, config.bp.interface_name
        ))
        .into());
    }
    let (rx, _) = PacketTransport::open(
        &config.bp.interface_name,
        config.bp.interface_ether_type,
    )?;
    let node_id = tx.node_id();

    info!("dcp-bp-daemon v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "interface {} node {node_id} beacon {}ms±{:.0}% maxBeacon {}B",
        config.bp.interface_name,
        config.bp.avg_beacon_period_ms,
        config.bp.jitter_factor * 100.0,
        config.bp.max_beacon_size,
    );

    let server = CommandServer::bind(
        Path::new(&config.bp.command_socket_path),
        Duration::from_millis(config.bp.command_socket_timeout_ms as u64),
    )?;
    info!("command socket at {}", config.bp.command_socket_path);

    let daemon = BpDaemon::new(config.bp, node_id);
    dcp::signals::install_exit_handler(daemon.exit_flag());

    let handles = daemon.run(tx, rx, server);
    for handle in handles {
        if handle.join().is_err() {
            return Err("daemon thread panicked".into());
        }
    }

    info!("clean shutdown");
    Ok(())
}
