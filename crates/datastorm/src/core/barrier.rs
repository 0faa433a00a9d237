// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Notify-barrier over a mutex/condvar pair.
//!
//! A plain `notify_all` lets the mutating thread run ahead (and mutate
//! again) before a woken waiter re-checks its predicate. With the barrier,
//! the mutator blocks until every waiter registered at notification time
//! has woken and re-checked:
//!
//! ```text
//! mutator:  notified = waiters; notify_all; wait until notified == 0
//! waiter:   waiters += 1
//!           loop { if ready { break }; wait; notified -= 1 (0 => notify_all) }
//!           waiters -= 1
//! ```

use crate::api::Result;
use parking_lot::{Condvar, MutexGuard};

#[derive(Debug, Default)]
pub(crate) struct NotifyBarrier {
    waiters: usize,
    notified: usize,
}

impl NotifyBarrier {
    /// Number of threads currently waiting.
    pub(crate) fn waiters(&self) -> usize {
        self.waiters
    }
}

/// State guarded by a mutex that embeds a [`NotifyBarrier`].
pub(crate) trait HasBarrier {
    fn barrier(&mut self) -> &mut NotifyBarrier;
}

/// Wake every waiter and block until each has re-checked its predicate.
pub(crate) fn notify<T: HasBarrier>(guard: &mut MutexGuard<'_, T>, cond: &Condvar) {
    let barrier = guard.barrier();
    if barrier.waiters == 0 {
        return;
    }
    barrier.notified = barrier.waiters;
    cond.notify_all();
    while guard.barrier().notified > 0 {
        cond.wait(guard);
    }
}

/// Block until `ready` returns `Ok(true)` or fails.
pub(crate) fn wait<T: HasBarrier>(
    guard: &mut MutexGuard<'_, T>,
    cond: &Condvar,
    mut ready: impl FnMut(&mut T) -> Result<bool>,
) -> Result<()> {
    guard.barrier().waiters += 1;
    let result = loop {
        match ready(&mut **guard) {
            Ok(true) => break Ok(()),
            Ok(false) => {}
            Err(e) => break Err(e),
        }
        cond.wait(guard);
        let barrier = guard.barrier();
        if barrier.notified > 0 {
            barrier.notified -= 1;
            if barrier.notified == 0 {
                cond.notify_all();
            }
        }
    };
    guard.barrier().waiters -= 1;
    result
}
