// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logging bootstrap from the shared logging configuration block.

use dcp::config::LoggingConfig;
use std::error::Error;
use std::sync::Arc;
use tracing::Level;

pub fn init(config: &LoggingConfig, daemon_tag: &str) -> Result<(), Box<dyn Error>> {
    let level = match config.severity_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warning" => Level::WARN,
        "error" | "fatal" => Level::ERROR,
        _ => Level::INFO,
    };
    if config.logging_to_console {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(true)
            .init();
    } else {
        let path = format!("{}-{daemon_tag}.log", config.filename_prefix);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(Arc::new(file))
            .with_ansi(false)
            .init();
    }
    Ok(())
}
