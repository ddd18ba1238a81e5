// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Beaconing Protocol (BP).
//!
//! BP owns the wireless interface and emits one beacon frame per jittered
//! period, multiplexing the payloads of its registered client protocols.
//! Inbound frames are parsed and demultiplexed back into the clients'
//! shared-memory indication queues.
//!
//! - [`daemon::BpDaemon`]: the engine behind the `dcp-bp-daemon` binary
//! - [`client::BpClient`]: library for client protocols (Vardis, SRP, ...)
//! - [`control`]: the per-client shared-memory control segment
//! - [`transport`]: the medium seam and the in-process test hub

pub mod client;
pub mod control;
pub mod daemon;
pub mod messages;
pub mod queueing;
pub mod stats;
pub mod transport;
pub mod wire;

pub use client::{BpClient, BpClientConfig, BpClientError};
pub use daemon::BpDaemon;
pub use queueing::QueueingMode;
pub use wire::BpProtocolId;
