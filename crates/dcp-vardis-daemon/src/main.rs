// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Vardis daemon binary.
//!
//! Registers the Vardis protocol with a running BP daemon, owns the
//! variable store, and serves client applications.
//!
//! ```bash
//! # Against the default BP command socket
//! dcp-vardis-daemon
//!
//! # Custom configuration
//! dcp-vardis-daemon --config /etc/dcp/vardis.json
//! ```

use clap::Parser;
use dcp::cmdsock::CommandServer;
use dcp::config::VardisDaemonConfig;
use dcp::vardis::VardisDaemon;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

mod logging;

/// Variable Dissemination daemon for drone swarm middleware.
#[derive(Parser, Debug)]
#[command(name = "dcp-vardis-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the BP daemon's command socket path
    #[arg(long)]
    bp_socket: Option<String>,

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
        Some(path) => VardisDaemonConfig::from_file(path)?,
        None => VardisDaemonConfig::default(),
    };
    if let Some(bp_socket) = args.bp_socket {
        config.vardis.bp_command_socket_path = bp_socket;
    }
    if let Some(socket) = args.socket {
        config.vardis.command_socket_path = socket;
    }
    if let Some(level) = args.log_level {
        config.logging.severity_level = level;
    }
    config.logging.validate()?;

    logging::init(&config.logging, "vardis")?;

    info!("dcp-vardis-daemon v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "registering with BP at {} (payload {}B, queue depth {})",
        config.vardis.bp_command_socket_path,
        config.vardis.max_payload_size,
        config.vardis.queue_max_entries,
    );

    let server = CommandServer::bind(
        Path::new(&config.vardis.command_socket_path),
        Duration::from_millis(config.vardis.command_socket_timeout_ms as u64),
    )?;
    info!("command socket at {}", config.vardis.command_socket_path);

    let daemon = VardisDaemon::new(config.vardis)?;
    info!("node {} - variable store ready", daemon.node_id());
    dcp::signals::install_exit_handler(daemon.exit_flag());

    let handles = daemon.run(server);
    for handle in handles {
        if handle.join().is_err() {
            return Err("daemon thread panicked".into());
        }
    }

    info!("clean shutdown");
    Ok(())
}
