// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Vardis client control segment.
//!
//! Same fabric as the BP control segment, but the work items are the four
//! RTDB request/confirm pairs:
//!
//! ```text
//! robust mutex
//! freeList
//! createRequests / createConfirms
//! deleteRequests / deleteConfirms
//! updateRequests / updateConfirms
//! readRequests   / readConfirms
//! ```
//!
//! Create/Delete/Update are fire-and-forget for the client (the confirm
//! queues are polled at leisure; the daemon evicts the oldest confirm when
//! a client never polls). Read is the one synchronous operation: the
//! client pushes a request and waits for the confirm.

use crate::shm::{
    self, pop_blob, push_blob, BufferPool, BufferRing, PopOutcome, PushOutcome, RingError,
    ShmError, ShmMutex, ShmMutexGuard, ShmSegment, POLL_INTERVAL,
};
use crate::wire::{AreaResult, AssemblyArea};
use std::cell::UnsafeCell;
use std::mem::size_of;
use std::ptr::addr_of_mut;
use std::time::{Duration, Instant};

/// Capacity of each request/confirm ring.
pub const RTDB_QUEUE_CAPACITY: usize = 10;

/// Chunk size: the largest RTDB message is a create request or read
/// confirm carrying a full description and value.
pub const RTDB_CHUNK_SIZE: usize = 600;

/// One of the four RTDB service pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtdbOp {
    Create,
    Delete,
    Update,
    Read,
}

impl RtdbOp {
    pub const ALL: [RtdbOp; 4] = [RtdbOp::Create, RtdbOp::Delete, RtdbOp::Update, RtdbOp::Read];
}

/// Mutable portion of the segment, reached only under the lock.
#[repr(C)]
pub struct VardisSegmentData {
    pub free_list: BufferRing,
    pub create_requests: BufferRing,
    pub create_confirms: BufferRing,
    pub delete_requests: BufferRing,
    pub delete_confirms: BufferRing,
    pub update_requests: BufferRing,
    pub update_confirms: BufferRing,
    pub read_requests: BufferRing,
    pub read_confirms: BufferRing,
}

impl VardisSegmentData {
    /// The request/confirm ring pair of an operation plus the free list.
    fn rings(&mut self, op: RtdbOp) -> (&mut BufferRing, &mut BufferRing, &mut BufferRing) {
        match op {
            RtdbOp::Create => (
                &mut self.create_requests,
                &mut self.create_confirms,
                &mut self.free_list,
            ),
            RtdbOp::Delete => (
                &mut self.delete_requests,
                &mut self.delete_confirms,
                &mut self.free_list,
            ),
            RtdbOp::Update => (
                &mut self.update_requests,
                &mut self.update_confirms,
                &mut self.free_list,
            ),
            RtdbOp::Read => (
                &mut self.read_requests,
                &mut self.read_confirms,
                &mut self.free_list,
            ),
        }
    }
}

/// The POD at offset 0 of the segment.
#[repr(C)]
pub struct VardisControlSegment {
    lock: ShmMutex,
    data: UnsafeCell<VardisSegmentData>,
}

// SAFETY: access to `data` is serialized by the robust interprocess mutex.
unsafe impl Send for VardisControlSegment {}
unsafe impl Sync for VardisControlSegment {}

/// Chunks: one per queued request/confirm across all four pairs.
const BUFFER_COUNT: usize = 8 * RTDB_QUEUE_CAPACITY + 1;

/// Total byte size of a Vardis client segment.
#[must_use]
pub fn segment_size() -> usize {
    size_of::<VardisControlSegment>() + BUFFER_COUNT * RTDB_CHUNK_SIZE
}

fn ring_err(e: RingError) -> ShmError {
    ShmError::Corruption(format!("vardis control segment ring: {e}"))
}

/// Handle on a Vardis client control segment.
pub struct VardisSegment {
    shm: ShmSegment,
    pool: BufferPool,
}

impl VardisSegment {
    /// Create the segment (daemon side, at client registration).
    pub fn create(shm_name: &str) -> shm::Result<Self> {
        let shm = ShmSegment::create(shm_name, segment_size())?;
        let segment = shm.as_ptr().cast::<VardisControlSegment>();
        // SAFETY: fresh zeroed mapping, exclusively ours until return.
        unsafe {
            ShmMutex::init(addr_of_mut!((*segment).lock))?;
            let data = &mut *(*segment).data.get();
            data.free_list
                .set_capacity(BUFFER_COUNT - 1)
                .map_err(ring_err)?;
            for ring in [
                &mut data.create_requests,
                &mut data.create_confirms,
                &mut data.delete_requests,
                &mut data.delete_confirms,
                &mut data.update_requests,
                &mut data.update_confirms,
                &mut data.read_requests,
                &mut data.read_confirms,
            ] {
                ring.set_capacity(RTDB_QUEUE_CAPACITY).map_err(ring_err)?;
            }
            for i in 0..(BUFFER_COUNT - 1) as u32 {
                data.free_list
                    .push(crate::shm::chunk_descriptor(RTDB_CHUNK_SIZE, i))
                    .map_err(ring_err)?;
            }
        }
        // SAFETY: buffer area follows the POD; the mapping outlives the pool.
        let pool = unsafe {
            BufferPool::new(
                shm.as_ptr().add(size_of::<VardisControlSegment>()),
                RTDB_CHUNK_SIZE,
                BUFFER_COUNT,
            )
        };
        Ok(Self { shm, pool })
    }

    /// Attach to an existing segment (client side).
    pub fn attach(shm_name: &str) -> shm::Result<Self> {
        let shm = ShmSegment::attach(shm_name, segment_size())?;
        // SAFETY: as in create(); the daemon initialized the POD before
        // confirming the registration.
        let pool = unsafe {
            BufferPool::new(
                shm.as_ptr().add(size_of::<VardisControlSegment>()),
                RTDB_CHUNK_SIZE,
                BUFFER_COUNT,
            )
        };
        Ok(Self { shm, pool })
    }

    /// Run `f` with the segment locked.
    pub fn with<R>(
        &self,
        f: impl FnOnce(&ShmMutexGuard<'_>, &mut VardisSegmentData, &BufferPool) -> shm::Result<R>,
    ) -> shm::Result<R> {
        // SAFETY: the mapping holds an initialized VardisControlSegment.
        let segment = unsafe { &*self.shm.as_ptr().cast::<VardisControlSegment>() };
        let guard = segment.lock.lock()?;
        // SAFETY: the held guard serializes every access to `data`.
        let data = unsafe { &mut *segment.data.get() };
        f(&guard, data, &self.pool)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    /// Client side: push a serialized request.
    pub fn submit_request<F>(&self, op: RtdbOp, build: F) -> shm::Result<PushOutcome>
    where
        F: FnOnce(&mut AssemblyArea<'_>) -> AreaResult<()>,
    {
        self.with(|guard, data, pool| {
            let (requests, _, free) = data.rings(op);
            push_blob(guard, requests, free, pool, |chunk| {
                let mut area = AssemblyArea::new(chunk);
                if build(&mut area).is_err() {
                    return 0;
                }
                area.used()
            })
        })
    }

    /// Client side: take one confirm of `op`, copying it into `buf`.
    pub fn pop_confirm(&self, op: RtdbOp, buf: &mut [u8]) -> shm::Result<Option<usize>> {
        self.with(|guard, data, pool| {
            let (_, confirms, free) = data.rings(op);
            let mut copied = None;
            let outcome = pop_blob(guard, confirms, free, pool, |bytes| {
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                copied = Some(len);
            })?;
            match outcome {
                PopOutcome::Popped { .. } => Ok(copied),
                PopOutcome::Empty => Ok(None),
            }
        })
    }

    /// Client side: wait for a confirm of `op`.
    pub fn pop_confirm_wait(
        &self,
        op: RtdbOp,
        buf: &mut [u8],
        timeout: Duration,
    ) -> shm::Result<Option<usize>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(len) = self.pop_confirm(op, buf)? {
                return Ok(Some(len));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Daemon side: drain the request queue of `op`, answering each
    /// request with the confirm bytes returned by `handle`. A full
    /// confirm queue evicts its oldest entry (clients are free to never
    /// poll fire-and-forget confirms). Returns the number served.
    pub fn service_requests<F>(&self, op: RtdbOp, mut handle: F) -> shm::Result<usize>
    where
        F: FnMut(&[u8]) -> Vec<u8>,
    {
        self.with(|guard, data, pool| {
            let mut served = 0;
            loop {
                let confirm_bytes;
                {
                    let (requests, _, free) = data.rings(op);
                    let mut request_bytes = None;
                    let outcome = pop_blob(guard, requests, free, pool, |bytes| {
                        request_bytes = Some(bytes.to_vec());
                    })?;
                    match outcome {
                        PopOutcome::Popped { .. } => {
                            confirm_bytes = request_bytes.map(|req| handle(&req));
                        }
                        PopOutcome::Empty => return Ok(served),
                    }
                }
                if let Some(confirm) = confirm_bytes {
                    let (_, confirms, free) = data.rings(op);
                    if confirms.is_full() {
                        if let Ok(mut stale) = confirms.pop() {
                            stale.clear();
                            free.push(stale).map_err(ring_err)?;
                        }
                    }
                    push_blob(guard, confirms, free, pool, |chunk| {
                        let len = confirm.len().min(chunk.len());
                        chunk[..len].copy_from_slice(&confirm[..len]);
                        len
                    })?;
                }
                served += 1;
            }
        })
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
        format!("/dcp_vseg_{tag}_{ts}")
    }

    #[test]
    fn test_request_confirm_cycle() {
        let name = unique_name("cycle");
        let daemon = VardisSegment::create(&name).expect("create failed");
        let client = VardisSegment::attach(&name).expect("attach failed");

        let outcome = client
            .submit_request(RtdbOp::Create, |area| {
                area.write_u8(7)?;
                area.write_u8(42)
            })
            .expect("submit failed");
        assert_eq!(outcome, PushOutcome::Pushed);

        let served = daemon
            .service_requests(RtdbOp::Create, |request| {
                assert_eq!(request, &[7, 42]);
                vec![0, 0, 7]
            })
            .expect("service failed");
        assert_eq!(served, 1);

        let mut buf = [0u8; 64];
        let len = client
            .pop_confirm(RtdbOp::Create, &mut buf)
            .expect("pop failed")
            .expect("confirm expected");
        assert_eq!(&buf[..len], &[0, 0, 7]);
        // Confirms for other ops are untouched.
        assert!(client.pop_confirm(RtdbOp::Read, &mut buf).unwrap().is_none());
    }

    #[test]
    fn test_pairs_are_independent() {
        let name = unique_name("pairs");
        let segment = VardisSegment::create(&name).expect("create failed");

        for (op, tag) in [
            (RtdbOp::Create, 1u8),
            (RtdbOp::Delete, 2),
            (RtdbOp::Update, 3),
            (RtdbOp::Read, 4),
        ] {
            segment
                .submit_request(op, |area| area.write_u8(tag))
                .unwrap();
        }
        for (op, tag) in [
            (RtdbOp::Delete, 2u8),
            (RtdbOp::Read, 4),
            (RtdbOp::Create, 1),
            (RtdbOp::Update, 3),
        ] {
            let served = segment
                .service_requests(op, |request| {
                    assert_eq!(request, &[tag]);
                    vec![tag]
                })
                .unwrap();
            assert_eq!(served, 1);
        }
    }

    #[test]
    fn test_unpolled_confirms_evict_oldest() {
        let name = unique_name("evict");
        let segment = VardisSegment::create(&name).expect("create failed");

        for round in 0..(RTDB_QUEUE_CAPACITY as u8 + 3) {
            segment
                .submit_request(RtdbOp::Update, |area| area.write_u8(round))
                .unwrap();
            segment
                .service_requests(RtdbOp::Update, |request| vec![request[0]])
                .unwrap();
        }

        // The confirm queue kept only the newest RTDB_QUEUE_CAPACITY.
        let mut buf = [0u8; 8];
        let first = segment
            .pop_confirm(RtdbOp::Update, &mut buf)
            .unwrap()
            .expect("confirm");
        assert_eq!(buf[..first], [3]);
    }

    #[test]
    fn test_confirm_wait_times_out() {
        let name = unique_name("timeout");
        let segment = VardisSegment::create(&name).expect("create failed");
        let mut buf = [0u8; 8];
        let got = segment
            .pop_confirm_wait(RtdbOp::Read, &mut buf, Duration::from_millis(30))
            .unwrap();
        assert!(got.is_none());
    }
}
