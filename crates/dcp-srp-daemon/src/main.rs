// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SRP daemon binary.
//!
//! Registers the State Reporting Protocol with a running BP daemon,
//! broadcasts the own node's safety data while fresh, and maintains the
//! scrubbed neighbour table that applications read through shared memory.

use clap::Parser;
use dcp::config::SrpDaemonConfig;
use dcp::srp::SrpDaemon;
use std::error::Error;
use std::path::PathBuf;
use tracing::info;

mod logging;

/// State Reporting daemon for drone swarm middleware.
#[derive(Parser, Debug)]
#[command(name = "dcp-srp-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the BP daemon's command socket path
    #[arg(long)]
    bp_socket: Option<String>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SrpDaemonConfig::from_file(path)?,
        None => SrpDaemonConfig::default(),
    };
    if let Some(bp_socket) = args.bp_socket {
        config.srp.bp_command_socket_path = bp_socket;
    }
    if let Some(level) = args.log_level {
        config.logging.severity_level = level;
    }
    config.srp.validate()?;
    config.logging.validate()?;

    logging::init(&config.logging, "srp")?;

    info!("dcp-srp-daemon v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "registering with BP at {} (generation {}ms, keepalive {}ms)",
        config.srp.bp_command_socket_path,
        config.srp.generation_period_ms,
        config.srp.keepalive_timeout_ms,
    );

    let daemon = SrpDaemon::new(config.srp)?;
    dcp::signals::install_exit_handler(daemon.exit_flag());

    let handles = daemon.run();
    for handle in handles {
        if handle.join().is_err() {
            return Err("daemon thread panicked".into());
        }
    }

    info!("clean shutdown");
    Ok(())
}
