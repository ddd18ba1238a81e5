// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Robust process-shared mutex embedded in shared memory.
//!
//! Client processes are untrusted and may die while holding a control
//! segment's lock. A plain futex or `PTHREAD_PROCESS_SHARED` mutex would
//! then deadlock every other participant, so the mutex is additionally
//! marked `PTHREAD_MUTEX_ROBUST`: the next acquirer after a holder's death
//! gets `EOWNERDEAD`, calls `pthread_mutex_consistent`, and continues.
//! Only `ENOTRECOVERABLE` (a peer observed the death and refused to make
//! the state consistent) is surfaced as a fatal error.
//!
//! The struct is `#[repr(C)]` plain data so it can be placement-initialized
//! inside a control segment and used by every attached process.

use super::{Result, ShmError};
use std::cell::UnsafeCell;

/// Interprocess mutex; one per shared-memory control segment.
#[repr(C)]
pub struct ShmMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: pthread mutexes initialized with PTHREAD_PROCESS_SHARED are
// explicitly designed for concurrent use from multiple threads and
// processes through a shared mapping.
unsafe impl Send for ShmMutex {}
unsafe impl Sync for ShmMutex {}

impl ShmMutex {
    /// An unarmed (all-zero) mutex. Must be initialized in place with
    /// [`ShmMutex::init`] before first use and must not be moved afterwards.
    #[must_use]
    pub fn zeroed() -> Self {
        ShmMutex {
            // SAFETY: pthread_mutex_t is a plain C struct; all-zero is a
            // valid "not yet initialized" representation.
            inner: UnsafeCell::new(unsafe { std::mem::zeroed() }),
        }
    }

    /// Initialize the mutex in place. Creator side only, exactly once,
    /// before any peer can attach to the segment.
    ///
    /// # Safety
    ///
    /// `this` must point to uninitialized (or zeroed) memory of at least
    /// `size_of::<ShmMutex>()` bytes inside a shared mapping.
    pub unsafe fn init(this: *mut ShmMutex) -> Result<()> {
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        let rc = libc::pthread_mutexattr_init(&mut attr);
        if rc != 0 {
            return Err(ShmError::MutexInit(rc));
        }
        let rc = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if rc != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(ShmError::MutexInit(rc));
        }
        let rc = libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
        if rc != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(ShmError::MutexInit(rc));
        }
        let rc = libc::pthread_mutex_init((*this).inner.get(), &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if rc != 0 {
            return Err(ShmError::MutexInit(rc));
        }
        Ok(())
    }

    /// Acquire the mutex, recovering it if the previous holder died.
    pub fn lock(&self) -> Result<ShmMutexGuard<'_>> {
        // SAFETY: inner was initialized by init() on the creator side
        // before the segment became reachable by any peer.
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        match rc {
            0 => Ok(ShmMutexGuard { mutex: self }),
            libc::EOWNERDEAD => {
                // A holder died. The protected rings are only mutated under
                // the lock in small atomic steps, so marking the state
                // consistent and continuing is sound.
                // SAFETY: we own the lock in EOWNERDEAD state.
                let rc = unsafe { libc::pthread_mutex_consistent(self.inner.get()) };
                if rc != 0 {
                    // SAFETY: release the unrecoverable lock before failing.
                    unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
                    return Err(ShmError::MutexNotRecoverable);
                }
                log::warn!("[SHM] recovered interprocess mutex from dead holder");
                Ok(ShmMutexGuard { mutex: self })
            }
            libc::ENOTRECOVERABLE => Err(ShmError::MutexNotRecoverable),
            errno => Err(ShmError::MutexInit(errno)),
        }
    }
}

/// RAII guard; releases the mutex on drop.
///
/// The guard intentionally carries no data reference: control-segment
/// fields are reached through raw pointers by the holder while the guard
/// is alive.
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: this guard proves the lock is held by the current thread.
        unsafe {
            libc::pthread_mutex_unlock(self.mutex.inner.get());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    struct Shared {
        mutex: ShmMutex,
        counter: AtomicU32,
    }

    fn new_shared() -> Arc<Shared> {
        let shared = Arc::new(Shared {
            mutex: ShmMutex::zeroed(),
            counter: AtomicU32::new(0),
        });
        // SAFETY: freshly allocated, not yet shared with any other thread.
        unsafe {
            ShmMutex::init(&shared.mutex as *const ShmMutex as *mut ShmMutex)
                .expect("mutex init failed");
        }
        shared
    }

    #[test]
    fn test_lock_unlock() {
        let shared = new_shared();
        {
            let _guard = shared.mutex.lock().expect("lock failed");
        }
        let _guard = shared.mutex.lock().expect("relock failed");
    }

    #[test]
    fn test_mutual_exclusion() {
        let shared = new_shared();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let s = Arc::clone(&shared);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = s.mutex.lock().expect("lock failed");
                    let v = s.counter.load(Ordering::Relaxed);
                    s.counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().expect("worker panicked");
        }
        assert_eq!(shared.counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn test_robust_recovery_after_holder_exit() {
        // A thread that leaks its guard models a crashed process well
        // enough for the EOWNERDEAD path only when the owning *thread*
        // dies; spawn one, lock, and let it exit without unlocking.
        let shared = new_shared();
        let s = Arc::clone(&shared);
        thread::spawn(move || {
            let guard = s.mutex.lock().expect("lock failed");
            std::mem::forget(guard);
        })
        .join()
        .expect("holder thread panicked");

        // The next lock must recover instead of deadlocking.
        let _guard = shared.mutex.lock().expect("recovery failed");
    }
}
