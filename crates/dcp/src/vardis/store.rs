// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The RTDB: an array-indexed variable store in shared memory.
//!
//! 256 fixed-size slots (one per possible `VarId`), six duplicate-free
//! work queues of `VarId`s, protocol counters, and one robust mutex
//! guarding all of it. The Vardis daemon creates the segment; operator
//! tools may attach read-only-by-convention.
//!
//! Work queues:
//!
//! | queue        | meaning                                             |
//! |--------------|-----------------------------------------------------|
//! | `create_q`   | variable creation still being announced             |
//! | `delete_q`   | variable deletion still being announced             |
//! | `update_q`   | value update awaiting (re-)transmission             |
//! | `summary_q`  | variable advertised in round-robin summaries        |
//! | `req_update_q` | we want the producer's fresher value              |
//! | `req_create_q` | we saw a summary for a variable we do not know    |

use crate::shm::{self, FixedRing, ShmError, ShmMutex, ShmSegment};
use crate::vardis::wire::{VarId, VarSeqno, VarSpec};
use crate::wire::{NodeId, TimeStamp, WireString};
use std::cell::UnsafeCell;
use std::mem::size_of;
use std::ptr::addr_of_mut;

/// Number of variable slots (the whole `VarId` space).
pub const NUM_VARS: usize = 256;

/// Capacity of a value buffer inside a slot.
pub const MAX_VALUE_BYTES: usize = 255;

/// Capacity of a description buffer inside a slot.
pub const MAX_DESCR_BYTES: usize = 255;

/// Work queue of `VarId`s; sized to hold every variable at once.
pub type VarIdQueue = FixedRing<VarId, { NUM_VARS + 1 }>;

/// One RTDB slot.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct VarEntry {
    pub exists: u8,
    pub to_be_deleted: u8,
    pub producer: [u8; 6],
    pub rep_cnt: u8,
    pub seqno: u8,
    pub count_create: u8,
    pub count_update: u8,
    pub count_delete: u8,
    pub descr_len: u8,
    pub value_len: u8,
    /// Local time of the last state change (create, update, delete-mark).
    pub timestamp_us: u64,
    /// Soft-state expiry for this variable; 0 = never expires.
    pub timeout_ms: u32,
    pub descr: [u8; MAX_DESCR_BYTES],
    pub value: [u8; MAX_VALUE_BYTES],
}

impl VarEntry {
    #[inline]
    #[must_use]
    pub fn exists(&self) -> bool {
        self.exists != 0
    }

    #[inline]
    #[must_use]
    pub fn to_be_deleted(&self) -> bool {
        self.to_be_deleted != 0
    }

    #[inline]
    #[must_use]
    pub fn producer(&self) -> NodeId {
        NodeId(self.producer)
    }

    #[inline]
    #[must_use]
    pub fn seqno(&self) -> VarSeqno {
        VarSeqno(self.seqno)
    }

    #[inline]
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value[..self.value_len as usize]
    }

    pub fn set_value(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(MAX_VALUE_BYTES);
        self.value[..len].copy_from_slice(&bytes[..len]);
        self.value_len = len as u8;
    }

    #[inline]
    #[must_use]
    pub fn description(&self) -> &[u8] {
        &self.descr[..self.descr_len as usize]
    }

    pub fn set_description(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(MAX_DESCR_BYTES);
        self.descr[..len].copy_from_slice(&bytes[..len]);
        self.descr_len = len as u8;
    }

    /// Rebuild the wire spec of this entry.
    #[must_use]
    pub fn spec(&self, var_id: VarId) -> VarSpec {
        VarSpec {
            var_id,
            producer: self.producer(),
            rep_cnt: self.rep_cnt,
            description: WireString::new(self.description()).unwrap_or_default(),
        }
    }

    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> TimeStamp {
        TimeStamp(self.timestamp_us)
    }
}

/// Protocol counters, shared with management queries.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VardisCounters {
    pub rtdb_create_requests: u64,
    pub rtdb_delete_requests: u64,
    pub rtdb_update_requests: u64,
    pub rtdb_read_requests: u64,
    pub payloads_generated: u64,
    pub payloads_processed: u64,
    pub processed_creates: u64,
    pub processed_deletes: u64,
    pub processed_updates: u64,
    pub processed_summaries: u64,
    pub processed_req_creates: u64,
    pub processed_req_updates: u64,
}

/// Everything behind the store mutex.
#[repr(C)]
pub struct VarStoreData {
    pub own_node_id: [u8; 6],
    pub active: u8,
    pub max_summaries: u16,
    pub max_description_length: u8,
    pub max_value_length: u8,
    pub max_repetitions: u8,
    pub default_timeout_ms: u32,
    pub counters: VardisCounters,
    pub create_q: VarIdQueue,
    pub delete_q: VarIdQueue,
    pub update_q: VarIdQueue,
    pub summary_q: VarIdQueue,
    pub req_update_q: VarIdQueue,
    pub req_create_q: VarIdQueue,
    pub entries: [VarEntry; NUM_VARS],
}

impl VarStoreData {
    #[inline]
    #[must_use]
    pub fn own_node_id(&self) -> NodeId {
        NodeId(self.own_node_id)
    }

    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active != 0
    }

    #[inline]
    #[must_use]
    pub fn entry(&self, var_id: VarId) -> &VarEntry {
        &self.entries[var_id.0 as usize]
    }

    #[inline]
    #[must_use]
    pub fn entry_mut(&mut self, var_id: VarId) -> &mut VarEntry {
        &mut self.entries[var_id.0 as usize]
    }

    /// All `VarId`s whose entry satisfies the predicate.
    pub fn list_matching(&self, mut predicate: impl FnMut(&VarEntry) -> bool) -> Vec<VarId> {
        (0..NUM_VARS)
            .filter(|&i| self.entries[i].exists() && predicate(&self.entries[i]))
            .map(|i| VarId(i as u8))
            .collect()
    }

    /// Evict a variable from every work queue.
    pub fn remove_from_all_queues(&mut self, var_id: VarId) {
        self.create_q.remove(&var_id);
        self.delete_q.remove(&var_id);
        self.update_q.remove(&var_id);
        self.summary_q.remove(&var_id);
        self.req_update_q.remove(&var_id);
        self.req_create_q.remove(&var_id);
    }

    /// Drop a variable entirely: entry and all queue memberships.
    pub fn purge(&mut self, var_id: VarId) {
        self.remove_from_all_queues(var_id);
        let entry = self.entry_mut(var_id);
        // SAFETY: VarEntry is plain data; all-zero is its vacant state.
        *entry = unsafe { std::mem::zeroed() };
    }
}

#[cfg(test)]
impl VarStoreData {
    /// Heap-allocated store for protocol unit tests (no shared memory).
    pub(crate) fn boxed(own: NodeId, params: VarStoreParams) -> Box<Self> {
        // SAFETY: all-zero is a valid vacant state for this POD; the
        // queues are armed right below.
        let mut data: Box<Self> = unsafe { Box::new_zeroed().assume_init() };
        data.own_node_id = own.0;
        data.active = 1;
        data.max_summaries = params.max_summaries;
        data.max_description_length = params.max_description_length;
        data.max_value_length = params.max_value_length;
        data.max_repetitions = params.max_repetitions;
        data.default_timeout_ms = params.default_timeout_ms;
        for queue in [
            &mut data.create_q,
            &mut data.delete_q,
            &mut data.update_q,
            &mut data.summary_q,
            &mut data.req_update_q,
            &mut data.req_create_q,
        ] {
            queue.set_capacity(NUM_VARS).expect("queue capacity");
        }
        data
    }
}

/// The POD at offset 0 of the store segment.
#[repr(C)]
pub struct VarStoreSegment {
    lock: ShmMutex,
    data: UnsafeCell<VarStoreData>,
}

// SAFETY: access to `data` is serialized by the robust interprocess mutex.
unsafe impl Send for VarStoreSegment {}
unsafe impl Sync for VarStoreSegment {}

/// Store creation parameters (from the Vardis configuration).
#[derive(Debug, Clone, Copy)]
pub struct VarStoreParams {
    pub max_summaries: u16,
    pub max_description_length: u8,
    pub max_value_length: u8,
    pub max_repetitions: u8,
    pub default_timeout_ms: u32,
}

/// Handle on the variable store: owning (daemon) or attached (tools).
pub struct VarStore {
    shm: ShmSegment,
}

impl VarStore {
    /// Create and initialize the store segment (daemon side).
    pub fn create(name: &str, own_node_id: NodeId, params: VarStoreParams) -> shm::Result<Self> {
        let shm = ShmSegment::create(name, size_of::<VarStoreSegment>())?;
        let segment = shm.as_ptr().cast::<VarStoreSegment>();
        // SAFETY: fresh zeroed mapping, exclusively ours until this
        // function returns; large enough by construction.
        unsafe {
            ShmMutex::init(addr_of_mut!((*segment).lock))?;
            let data = &mut *(*segment).data.get();
            data.own_node_id = own_node_id.0;
            data.active = 1;
            data.max_summaries = params.max_summaries;
            data.max_description_length = params.max_description_length;
            data.max_value_length = params.max_value_length;
            data.max_repetitions = params.max_repetitions;
            data.default_timeout_ms = params.default_timeout_ms;
            for queue in [
                &mut data.create_q,
                &mut data.delete_q,
                &mut data.update_q,
                &mut data.summary_q,
                &mut data.req_update_q,
                &mut data.req_create_q,
            ] {
                queue
                    .set_capacity(NUM_VARS)
                    .map_err(|e| ShmError::Corruption(format!("var queue: {e}")))?;
            }
        }
        Ok(Self { shm })
    }

    /// Attach to an existing store segment.
    pub fn attach(name: &str) -> shm::Result<Self> {
        let shm = ShmSegment::attach(name, size_of::<VarStoreSegment>())?;
        Ok(Self { shm })
    }

    /// Run `f` under the store mutex.
    pub fn with<R>(&self, f: impl FnOnce(&mut VarStoreData) -> R) -> shm::Result<R> {
        // SAFETY: the mapping holds an initialized VarStoreSegment.
        let segment = unsafe { &*self.shm.as_ptr().cast::<VarStoreSegment>() };
        let guard = segment.lock.lock()?;
        // SAFETY: the held guard serializes every access to `data`.
        let data = unsafe { &mut *segment.data.get() };
        let result = f(data);
        drop(guard);
        Ok(result)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.shm.name()
    }
}
