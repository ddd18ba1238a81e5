// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SRP: State Reporting Protocol.
//!
//! Periodically broadcasts the own node's safety data (position and
//! velocity) as a ONCE-mode BP payload and keeps a scrubbed table of
//! everything heard from the neighbourhood.

pub mod client;
pub mod daemon;
pub mod store;
pub mod wire;

pub use client::SrpClient;
pub use daemon::SrpDaemon;
pub use store::{NeighbourInfo, SrpStore};
pub use wire::{ExtendedSafetyData, SafetyData};
