// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SRP client library.
//!
//! SRP applications need no registration handshake: they attach the
//! daemon's store segment directly, write their safety data under the
//! own-slot lock, and read the neighbour table under its lock.

use crate::shm::{self, ShmError};
use crate::srp::store::{NeighbourInfo, SrpStore};
use crate::srp::wire::SafetyData;
use crate::wire::{NodeId, TimeStamp};

/// Attached SRP application handle.
pub struct SrpClient {
    store: SrpStore,
}

impl SrpClient {
    /// Attach to a running SRP daemon's store.
    pub fn attach(store_shm_name: &str) -> Result<Self, ShmError> {
        Ok(Self {
            store: SrpStore::attach(store_shm_name)?,
        })
    }

    /// Publish fresh safety data; re-arms the keepalive.
    pub fn set_safety_data(&self, safety_data: SafetyData) -> shm::Result<()> {
        self.store.with_own(|own| {
            own.safety_data = safety_data;
            own.timestamp_us = TimeStamp::now().micros();
            own.written = 1;
        })
    }

    /// The daemon's node identifier.
    pub fn node_id(&self) -> shm::Result<NodeId> {
        self.store.with_own(|own| own.node_id())
    }

    /// Snapshot of the neighbour table.
    pub fn neighbours(&self) -> shm::Result<Vec<NeighbourInfo>> {
        self.store.with_neighbours(|table| table.list())
    }

    /// Look up one neighbour.
    pub fn neighbour(&self, node_id: NodeId) -> shm::Result<Option<NeighbourInfo>> {
        self.store.with_neighbours(|table| table.get(node_id))
    }
}
