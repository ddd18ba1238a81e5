// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal signal handling for the daemon binaries.
//!
//! SIGINT/SIGTERM flip a process-wide atomic that the daemons' exit
//! flags are chained to; every blocking loop observes it within 10 ms.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;

static SIGNALLED: AtomicBool = AtomicBool::new(false);
static CHAINED: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn handle_signal(_sig: libc::c_int) {
    // Only async-signal-safe work here: two atomic stores.
    SIGNALLED.store(true, Ordering::SeqCst);
    if let Some(flag) = CHAINED.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// Route SIGINT and SIGTERM into `exit_flag`.
pub fn install_exit_handler(exit_flag: Arc<AtomicBool>) {
    let _ = CHAINED.set(exit_flag);
    // SAFETY: handle_signal only performs atomic stores, which is
    // async-signal-safe; SIG_ERR is ignored (the daemon then simply
    // cannot be stopped by signal, which is not a memory-safety issue).
    let handler = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

/// Whether a termination signal has been observed.
#[must_use]
pub fn signalled() -> bool {
    SIGNALLED.load(Ordering::SeqCst)
}
