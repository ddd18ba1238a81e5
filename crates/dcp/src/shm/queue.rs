// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Finite blob queues over descriptor rings.
//!
//! A blob queue is a descriptor ring plus the segment's shared free list
//! and buffer pool: pushing checks out a chunk from the free list, lets a
//! write handler fill it, and enqueues the descriptor; popping hands the
//! chunk bytes to a read handler and returns the descriptor to the free
//! list. Chunks are never leaked and never double-pushed: between checkout
//! and hand-off a descriptor is owned exclusively by the calling thread.
//!
//! All operations here require the segment mutex to be held (witnessed by
//! the guard argument). The waiting flavors, which must release and
//! re-acquire the mutex between polls, live on the control-segment
//! handles; they poll at [`POLL_INTERVAL`] granularity so timeouts and the
//! daemon exit flag are observed within 10 ms.

use super::{BufferPool, FixedRing, ShmError, ShmMutexGuard, SharedMemBuffer};
use std::time::Duration;

/// Slot count of every descriptor ring (usable capacity is one less).
pub const BUFFER_RING_SLOTS: usize = 128;

/// Descriptor ring type used by all control segments.
pub type BufferRing = FixedRing<SharedMemBuffer, BUFFER_RING_SLOTS>;

/// Poll granularity for waiting queue operations.
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Outcome of a non-waiting push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// Target queue is at capacity.
    QueueFull,
    /// No chunk available in the free list.
    NoFreeBuffer,
}

/// Outcome of a non-waiting pop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopOutcome {
    /// One blob was consumed; `more` tells whether the queue still holds
    /// further entries.
    Popped { more: bool },
    Empty,
}

/// Check out a chunk, fill it via `write`, and enqueue the descriptor.
///
/// `write` receives the full chunk and returns the number of meaningful
/// bytes; the slice length bounds what it can write.
pub fn push_blob<F>(
    guard: &ShmMutexGuard<'_>,
    queue: &mut BufferRing,
    free: &mut BufferRing,
    pool: &BufferPool,
    write: F,
) -> Result<PushOutcome, ShmError>
where
    F: FnOnce(&mut [u8]) -> usize,
{
    if queue.is_full() {
        return Ok(PushOutcome::QueueFull);
    }
    let Ok(mut desc) = free.pop() else {
        return Ok(PushOutcome::NoFreeBuffer);
    };

    let chunk = pool.chunk_mut(guard, &desc)?;
    let written = write(chunk);
    if written > chunk.len() {
        return Err(ShmError::Corruption(format!(
            "write handler claimed {written} bytes in a {} byte chunk",
            chunk.len()
        )));
    }
    desc.used_len = written as u32;

    // Cannot fail: fullness was checked above and the mutex is held.
    queue
        .push(desc)
        .map_err(|_| ShmError::Corruption("queue filled up under the segment lock".into()))?;
    Ok(PushOutcome::Pushed)
}

/// Dequeue one blob, hand its bytes to `read`, and return the chunk to
/// the free list.
pub fn pop_blob<F>(
    guard: &ShmMutexGuard<'_>,
    queue: &mut BufferRing,
    free: &mut BufferRing,
    pool: &BufferPool,
    read: F,
) -> Result<PopOutcome, ShmError>
where
    F: FnOnce(&[u8]),
{
    let Ok(mut desc) = queue.pop() else {
        return Ok(PopOutcome::Empty);
    };

    let bytes = pool.chunk(guard, &desc)?;
    read(bytes);

    desc.clear();
    free.push(desc).map_err(|_| {
        ShmError::Corruption("free list cannot take back a checked-out chunk".into())
    })?;
    Ok(PopOutcome::Popped {
        more: !queue.is_empty(),
    })
}

/// Drain a queue completely, invoking `read` for every blob. Returns the
/// number of blobs consumed.
pub fn popall_blobs<F>(
    guard: &ShmMutexGuard<'_>,
    queue: &mut BufferRing,
    free: &mut BufferRing,
    pool: &BufferPool,
    mut read: F,
) -> Result<usize, ShmError>
where
    F: FnMut(&[u8]),
{
    let mut drained = 0;
    loop {
        match pop_blob(guard, queue, free, pool, &mut read)? {
            PopOutcome::Popped { .. } => drained += 1,
            PopOutcome::Empty => return Ok(drained),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::ShmMutex;

    struct Harness {
        mutex: ShmMutex,
        queue: BufferRing,
        free: BufferRing,
        backing: Vec<u8>,
    }

    const CHUNK: usize = 64;
    const CHUNKS: usize = 4;

    fn harness() -> Box<Harness> {
        let mut h = Box::new(Harness {
            mutex: ShmMutex::zeroed(),
            queue: BufferRing::new(3).unwrap(),
            free: BufferRing::new(CHUNKS).unwrap(),
            backing: vec![0u8; CHUNK * CHUNKS],
        });
        // SAFETY: fresh, unshared allocation.
        unsafe {
            ShmMutex::init(&h.mutex as *const ShmMutex as *mut ShmMutex).unwrap();
        }
        for i in 0..CHUNKS as u32 {
            h.free
                .push(crate::shm::buffer::chunk_descriptor(CHUNK, i))
                .unwrap();
        }
        h
    }

    fn pool(h: &mut Harness) -> BufferPool {
        // SAFETY: backing outlives the pool within each test.
        unsafe { BufferPool::new(h.backing.as_mut_ptr(), CHUNK, CHUNKS) }
    }

    #[test]
    fn test_push_pop_roundtrip() {
        let mut h = harness();
        let p = pool(&mut h);
        let guard = h.mutex.lock().unwrap();

        let outcome = push_blob(&guard, &mut h.queue, &mut h.free, &p, |chunk| {
            chunk[..5].copy_from_slice(b"hello");
            5
        })
        .unwrap();
        assert_eq!(outcome, PushOutcome::Pushed);
        assert_eq!(h.free.stored(), CHUNKS - 1);

        let mut seen = Vec::new();
        let outcome = pop_blob(&guard, &mut h.queue, &mut h.free, &p, |bytes| {
            seen.extend_from_slice(bytes);
        })
        .unwrap();
        assert_eq!(outcome, PopOutcome::Popped { more: false });
        assert_eq!(seen, b"hello");
        assert_eq!(h.free.stored(), CHUNKS);
    }

    #[test]
    fn test_pop_empty() {
        let mut h = harness();
        let p = pool(&mut h);
        let guard = h.mutex.lock().unwrap();
        let outcome = pop_blob(&guard, &mut h.queue, &mut h.free, &p, |_| {}).unwrap();
        assert_eq!(outcome, PopOutcome::Empty);
    }

    #[test]
    fn test_push_queue_full() {
        let mut h = harness();
        let p = pool(&mut h);
        let guard = h.mutex.lock().unwrap();
        for _ in 0..3 {
            let outcome =
                push_blob(&guard, &mut h.queue, &mut h.free, &p, |_| 1).unwrap();
            assert_eq!(outcome, PushOutcome::Pushed);
        }
        let outcome = push_blob(&guard, &mut h.queue, &mut h.free, &p, |_| 1).unwrap();
        assert_eq!(outcome, PushOutcome::QueueFull);
    }

    #[test]
    fn test_push_exhausted_free_list() {
        let mut h = harness();
        h.queue.set_capacity(CHUNKS + 1).unwrap();
        let p = pool(&mut h);
        let guard = h.mutex.lock().unwrap();
        for _ in 0..CHUNKS {
            push_blob(&guard, &mut h.queue, &mut h.free, &p, |_| 1).unwrap();
        }
        let outcome = push_blob(&guard, &mut h.queue, &mut h.free, &p, |_| 1).unwrap();
        assert_eq!(outcome, PushOutcome::NoFreeBuffer);
    }

    #[test]
    fn test_popall_drains_fifo() {
        let mut h = harness();
        let p = pool(&mut h);
        let guard = h.mutex.lock().unwrap();
        for i in 0..3u8 {
            push_blob(&guard, &mut h.queue, &mut h.free, &p, |chunk| {
                chunk[0] = i;
                1
            })
            .unwrap();
        }
        let mut order = Vec::new();
        let n = popall_blobs(&guard, &mut h.queue, &mut h.free, &p, |bytes| {
            order.push(bytes[0]);
        })
        .unwrap();
        assert_eq!(n, 3);
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(h.free.stored(), CHUNKS);
    }
}
