// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Two-lock guard discipline.
//!
//! The engine is ordered by exactly two locks:
//!
//! - the **primary lock** ([`StateLock`]) protects all shared state:
//!   channel/circuit/ledger tables and search tiers. Internal mutators are
//!   methods on the locked state, so `&mut ClientState` is a compile-time
//!   proof that the lock is held.
//! - the **callback gate** ([`CallbackGate`]) serializes user callbacks.
//!   It is held for the whole duration of a callback and never while
//!   blocking on I/O.
//!
//! Mandatory acquisition order: **gate, then primary**. Code that holds
//! the primary lock and needs to invoke a callback must collect the
//! deliveries, drop the state guard, and only then enter the gate.
//! [`CallbackGate::enter`] asserts (debug builds) that the calling thread
//! does not hold the primary lock, so an order inversion fails fast in
//! tests instead of deadlocking in the field.

use parking_lot::{Condvar, Mutex, MutexGuard, WaitTimeoutResult};
use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

thread_local! {
    /// Re-entrancy depth of the primary lock on this thread.
    static PRIMARY_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// The primary state lock.
pub struct StateLock<T> {
    inner: Mutex<T>,
}

impl<T> StateLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquire the primary lock. The returned guard is the proof-of-lock
    /// threaded through every state mutator.
    pub fn lock(&self) -> StateGuard<'_, T> {
        let guard = self.inner.lock();
        PRIMARY_DEPTH.with(|d| d.set(d.get() + 1));
        StateGuard { guard }
    }
}

/// Guard for the primary lock; derefs to the protected state.
pub struct StateGuard<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<T> StateGuard<'_, T> {
    /// Block on a condvar with a bounded timeout.
    ///
    /// The lock is released while waiting; the thread-local depth stays
    /// accounted to this guard, which is correct for the ordering check
    /// (the sleeping thread cannot enter the gate anyway).
    pub fn wait_for(&mut self, cv: &Condvar, timeout: Duration) -> WaitTimeoutResult {
        cv.wait_for(&mut self.guard, timeout)
    }
}

impl<T> Deref for StateGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for StateGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for StateGuard<'_, T> {
    fn drop(&mut self) {
        PRIMARY_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

/// Returns true when the calling thread holds the primary lock.
pub fn primary_held() -> bool {
    PRIMARY_DEPTH.with(Cell::get) > 0
}

/// The callback-serialization lock.
pub struct CallbackGate {
    inner: Mutex<()>,
}

impl CallbackGate {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(()),
        }
    }

    /// Enter the gate. Panics in debug builds if the primary lock is held
    /// on this thread (acquisition order violation).
    pub fn enter(&self) -> CallbackToken<'_> {
        debug_assert!(
            !primary_held(),
            "callback gate acquired while holding the primary lock"
        );
        CallbackToken {
            _guard: self.inner.lock(),
        }
    }
}

impl Default for CallbackGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that the callback gate is held; required by every delivery path.
pub struct CallbackToken<'a> {
    _guard: MutexGuard<'a, ()>,
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_depth_tracking() {
        let lock = StateLock::new(0u32);
        assert!(!primary_held());
        {
            let mut g = lock.lock();
            *g += 1;
            assert!(primary_held());
        }
        assert!(!primary_held());
    }

    #[test]
    fn test_gate_allows_primary_inside_callback() {
        // Order gate -> primary is the legal order: a callback may call
        // back into the API, which takes the primary lock.
        let lock = StateLock::new(5u32);
        let gate = CallbackGate::new();
        let token = gate.enter();
        {
            let g = lock.lock();
            assert_eq!(*g, 5);
        }
        drop(token);
    }

    #[test]
    #[should_panic(expected = "callback gate acquired while holding the primary lock")]
    #[cfg(debug_assertions)]
    fn test_gate_rejects_inverted_order() {
        let lock = StateLock::new(());
        let gate = CallbackGate::new();
        let _g = lock.lock();
        let _t = gate.enter(); // must panic
    }

    #[test]
    fn test_depth_survives_condvar_wait() {
        let lock = StateLock::new(false);
        let cv = Condvar::new();
        let mut g = lock.lock();
        let res = g.wait_for(&cv, Duration::from_millis(10));
        assert!(res.timed_out());
        assert!(primary_held());
        drop(g);
        assert!(!primary_held());
    }
}
