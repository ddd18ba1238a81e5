// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SRP neighbour store in shared memory.
//!
//! Two independently locked halves: the own-node slot (written by the
//! client application, read by the transmitter) and the neighbour table
//! (written by the receiver/scrubber, read by applications). When both
//! locks are needed the order is own slot first, then neighbour table.

use crate::shm::{self, ShmMutex, ShmSegment};
use crate::srp::wire::SafetyData;
use crate::wire::{NodeId, TimeStamp};
use std::cell::UnsafeCell;
use std::mem::size_of;
use std::ptr::addr_of_mut;

/// Fixed capacity of the neighbour table.
pub const MAX_NEIGHBOURS: usize = 128;

/// The own-node half.
#[repr(C)]
pub struct OwnState {
    pub node_id: [u8; 6],
    pub active: u8,
    /// Set when the application wrote safety data that has not yet aged
    /// past the keepalive timeout.
    pub written: u8,
    pub seqno: u32,
    pub timestamp_us: u64,
    pub safety_data: SafetyData,
}

impl OwnState {
    #[inline]
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        NodeId(self.node_id)
    }

    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active != 0
    }

    #[inline]
    #[must_use]
    pub fn is_written(&self) -> bool {
        self.written != 0
    }
}

/// One neighbour table slot.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NeighbourSlot {
    pub used: u8,
    pub node_id: [u8; 6],
    pub seqno: u32,
    pub timestamp_us: u64,
    pub safety_data: SafetyData,
}

/// Owned snapshot of one neighbour, for application consumption.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighbourInfo {
    pub node_id: NodeId,
    pub seqno: u32,
    pub timestamp: TimeStamp,
    pub safety_data: SafetyData,
}

/// The neighbour-table half.
#[repr(C)]
pub struct NeighbourTable {
    slots: [NeighbourSlot; MAX_NEIGHBOURS],
}

impl NeighbourTable {
    /// Insert or refresh a neighbour. A full table drops the oldest entry.
    pub fn upsert(&mut self, node_id: NodeId, safety_data: SafetyData, seqno: u32, now: TimeStamp) {
        let idx = self
            .slots
            .iter()
            .position(|s| s.used != 0 && s.node_id == node_id.0)
            .or_else(|| {
                // Fresh entry: free slot, or evict the stalest.
                self.slots.iter().position(|s| s.used == 0).or_else(|| {
                    self.slots
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, s)| s.timestamp_us)
                        .map(|(i, _)| i)
                })
            });
        if let Some(slot) = idx.map(|i| &mut self.slots[i]) {
            slot.used = 1;
            slot.node_id = node_id.0;
            slot.seqno = seqno;
            slot.timestamp_us = now.micros();
            slot.safety_data = safety_data;
        }
    }

    /// Look up one neighbour.
    #[must_use]
    pub fn get(&self, node_id: NodeId) -> Option<NeighbourInfo> {
        self.slots
            .iter()
            .find(|s| s.used != 0 && s.node_id == node_id.0)
            .map(|s| NeighbourInfo {
                node_id,
                seqno: s.seqno,
                timestamp: TimeStamp(s.timestamp_us),
                safety_data: s.safety_data,
            })
    }

    /// Snapshot of every live neighbour.
    #[must_use]
    pub fn list(&self) -> Vec<NeighbourInfo> {
        self.slots
            .iter()
            .filter(|s| s.used != 0)
            .map(|s| NeighbourInfo {
                node_id: NodeId(s.node_id),
                seqno: s.seqno,
                timestamp: TimeStamp(s.timestamp_us),
                safety_data: s.safety_data,
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.used != 0).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries last heard before `cutoff`. Returns the number removed.
    pub fn remove_older_than(&mut self, cutoff: TimeStamp) -> usize {
        let mut removed = 0;
        for slot in &mut self.slots {
            if slot.used != 0 && slot.timestamp_us < cutoff.micros() {
                slot.used = 0;
                removed += 1;
            }
        }
        removed
    }
}

/// The POD at offset 0 of the SRP store segment.
#[repr(C)]
pub struct SrpStoreSegment {
    own_lock: ShmMutex,
    own: UnsafeCell<OwnState>,
    table_lock: ShmMutex,
    table: UnsafeCell<NeighbourTable>,
}

// SAFETY: each UnsafeCell is serialized by its adjacent robust mutex.
unsafe impl Send for SrpStoreSegment {}
unsafe impl Sync for SrpStoreSegment {}

/// Handle on the SRP store: owning (daemon) or attached (applications).
pub struct SrpStore {
    shm: ShmSegment,
}

impl SrpStore {
    /// Create and initialize the store (daemon side).
    pub fn create(name: &str, own_node_id: NodeId) -> shm::Result<Self> {
        let shm = ShmSegment::create(name, size_of::<SrpStoreSegment>())?;
        let segment = shm.as_ptr().cast::<SrpStoreSegment>();
        // SAFETY: fresh zeroed mapping, exclusively ours until return.
        unsafe {
            ShmMutex::init(addr_of_mut!((*segment).own_lock))?;
            ShmMutex::init(addr_of_mut!((*segment).table_lock))?;
            let own = &mut *(*segment).own.get();
            own.node_id = own_node_id.0;
            own.active = 1;
        }
        Ok(Self { shm })
    }

    /// Attach to an existing store (application side).
    pub fn attach(name: &str) -> shm::Result<Self> {
        let shm = ShmSegment::attach(name, size_of::<SrpStoreSegment>())?;
        Ok(Self { shm })
    }

    fn segment(&self) -> &SrpStoreSegment {
        // SAFETY: the mapping holds an initialized SrpStoreSegment for the
        // whole lifetime of self.
        unsafe { &*self.shm.as_ptr().cast::<SrpStoreSegment>() }
    }

    /// Run `f` under the own-slot lock.
    pub fn with_own<R>(&self, f: impl FnOnce(&mut OwnState) -> R) -> shm::Result<R> {
        let segment = self.segment();
        let guard = segment.own_lock.lock()?;
        // SAFETY: the held guard serializes access to the own slot.
        let own = unsafe { &mut *segment.own.get() };
        let result = f(own);
        drop(guard);
        Ok(result)
    }

    /// Run `f` under the neighbour-table lock.
    pub fn with_neighbours<R>(&self, f: impl FnOnce(&mut NeighbourTable) -> R) -> shm::Result<R> {
        let segment = self.segment();
        let guard = segment.table_lock.lock()?;
        // SAFETY: the held guard serializes access to the table.
        let table = unsafe { &mut *segment.table.get() };
        let result = f(table);
        drop(guard);
        Ok(result)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.shm.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/dcp_srp_{tag}_{ts}")
    }

    fn node(n: u8) -> NodeId {
        NodeId([n, 0, 0, 0, 0, 9])
    }

    fn sd(x: f64) -> SafetyData {
        SafetyData {
            position_x: x,
            ..Default::default()
        }
    }

    #[test]
    fn test_own_state_shared_between_handles() {
        let name = unique_name("own");
        let store = SrpStore::create(&name, node(1)).expect("create failed");
        let peer = SrpStore::attach(&name).expect("attach failed");

        store
            .with_own(|own| {
                assert_eq!(own.node_id(), node(1));
                own.safety_data = sd(7.0);
                own.timestamp_us = 123;
                own.written = 1;
            })
            .unwrap();

        peer.with_own(|own| {
            assert!(own.is_written());
            assert_eq!(own.safety_data.position_x, 7.0);
        })
        .unwrap();
    }

    #[test]
    fn test_upsert_and_refresh() {
        let name = unique_name("upsert");
        let store = SrpStore::create(&name, node(1)).expect("create failed");
        store
            .with_neighbours(|table| {
                table.upsert(node(2), sd(1.0), 1, TimeStamp(100));
                table.upsert(node(3), sd(2.0), 1, TimeStamp(110));
                assert_eq!(table.len(), 2);

                // Refresh, not duplicate.
                table.upsert(node(2), sd(9.0), 2, TimeStamp(120));
                assert_eq!(table.len(), 2);
                let info = table.get(node(2)).expect("neighbour expected");
                assert_eq!(info.seqno, 2);
                assert_eq!(info.safety_data.position_x, 9.0);
            })
            .unwrap();
    }

    #[test]
    fn test_full_table_evicts_stalest() {
        let name = unique_name("full");
        let store = SrpStore::create(&name, node(0)).expect("create failed");
        store
            .with_neighbours(|table| {
                for i in 0..MAX_NEIGHBOURS {
                    table.upsert(
                        NodeId([i as u8, 1, 0, 0, 0, 0]),
                        sd(0.0),
                        1,
                        TimeStamp(1000 + i as u64),
                    );
                }
                assert_eq!(table.len(), MAX_NEIGHBOURS);
                // One more evicts the entry with timestamp 1000.
                table.upsert(NodeId([0xff; 6]), sd(0.0), 1, TimeStamp(9999));
                assert_eq!(table.len(), MAX_NEIGHBOURS);
                assert!(table.get(NodeId([0, 1, 0, 0, 0, 0])).is_none());
                assert!(table.get(NodeId([0xff; 6])).is_some());
            })
            .unwrap();
    }

    #[test]
    fn test_scrubbing_removes_aged_entries() {
        let name = unique_name("scrub");
        let store = SrpStore::create(&name, node(0)).expect("create failed");
        store
            .with_neighbours(|table| {
                table.upsert(node(2), sd(0.0), 1, TimeStamp(1_000_000));
                table.upsert(node(3), sd(0.0), 1, TimeStamp(5_000_000));
                assert_eq!(table.remove_older_than(TimeStamp(2_000_000)), 1);
                assert!(table.get(node(2)).is_none());
                assert!(table.get(node(3)).is_some());
            })
            .unwrap();
    }
}
