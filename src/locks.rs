//! Runtime-wide locks.
//!
//! ## Lock order
//!
//! 1. [`MutatorLock`]: held shared by every Runnable thread, exclusively
//!    while all mutators are paused.
//! 2. Thread list lock (see [`crate::thread_list::ThreadList::lock`]).
//! 3. [`SuspendCountLock`]: short hold, never across a blocking operation
//!    other than its own resume condition.
//!
//! The intern table lock sits outside this order: it is only ever taken by a
//! thread that holds none of the above, or by the collector while it holds
//! the mutator lock exclusively.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::lock_api::{RawRwLock as _, RawRwLockTimed as _};
use parking_lot::{Condvar, Mutex, MutexGuard, RawRwLock};

use crate::barrier::Barrier;

/// Global mutator exclusion.
///
/// Shared holds are not tied to a guard: a thread acquires the lock when it
/// becomes Runnable and releases it when it leaves Runnable, which may happen
/// in different stack frames.
pub struct MutatorLock {
    raw: RawRwLock,
    exclusive_owner: AtomicU32,
    shared_holders: AtomicU32,
}

impl MutatorLock {
    pub fn new() -> Self {
        Self {
            raw: RawRwLock::INIT,
            exclusive_owner: AtomicU32::new(0),
            shared_holders: AtomicU32::new(0),
        }
    }

    pub(crate) fn shared_lock(&self) {
        self.raw.lock_shared();
        self.shared_holders.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn try_shared_lock(&self) -> bool {
        let acquired = self.raw.try_lock_shared();
        if acquired {
            self.shared_holders.fetch_add(1, Ordering::AcqRel);
        }
        acquired
    }

    pub(crate) fn shared_unlock(&self) {
        let previous = self.shared_holders.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "mutator lock released without a shared hold");
        // SAFETY: every caller pairs this with a prior `shared_lock` made on
        // behalf of the same managed thread, which the counter above checks.
        unsafe { self.raw.unlock_shared() };
    }

    pub(crate) fn exclusive_lock(&self, owner: u32) {
        self.raw.lock_exclusive();
        self.exclusive_owner.store(owner, Ordering::Release);
    }

    pub(crate) fn try_exclusive_lock_for(&self, owner: u32, timeout: Duration) -> bool {
        let acquired = self.raw.try_lock_exclusive_for(timeout);
        if acquired {
            self.exclusive_owner.store(owner, Ordering::Release);
        }
        acquired
    }

    pub(crate) fn exclusive_unlock(&self) {
        assert!(
            self.is_exclusive_held(),
            "mutator lock released without an exclusive hold"
        );
        self.exclusive_owner.store(0, Ordering::Release);
        // SAFETY: the exclusive owner is recorded only after a successful
        // exclusive acquisition and cleared here exactly once.
        unsafe { self.raw.unlock_exclusive() };
    }

    pub fn is_exclusive_held(&self) -> bool {
        self.exclusive_owner.load(Ordering::Acquire) != 0
    }

    /// Thread id of the exclusive owner, `0` when the lock is not held exclusively.
    pub fn exclusive_owner(&self) -> u32 {
        self.exclusive_owner.load(Ordering::Acquire)
    }

    pub fn shared_holders(&self) -> u32 {
        self.shared_holders.load(Ordering::Acquire)
    }
}

impl Default for MutatorLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MutatorLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorLock")
            .field("exclusive_owner", &self.exclusive_owner())
            .field("shared_holders", &self.shared_holders())
            .finish()
    }
}

/// Protects every thread's suspend counts; paired with the resume condition.
#[derive(Debug, Default)]
pub struct SuspendCountLock {
    mutex: Mutex<()>,
    resume_cond: Condvar,
}

impl SuspendCountLock {
    pub fn lock(&self) -> SuspendCountGuard<'_> {
        SuspendCountGuard {
            lock: self,
            guard: self.mutex.lock(),
        }
    }
}

/// Proof that the suspend count lock is held.
pub struct SuspendCountGuard<'a> {
    lock: &'a SuspendCountLock,
    guard: MutexGuard<'a, ()>,
}

impl SuspendCountGuard<'_> {
    pub fn wait_for_resume(&mut self) {
        self.lock.resume_cond.wait(&mut self.guard);
    }

    /// Returns `true` if the wait timed out.
    pub fn wait_for_resume_for(&mut self, timeout: Duration) -> bool {
        self.lock
            .resume_cond
            .wait_for(&mut self.guard, timeout)
            .timed_out()
    }

    pub fn broadcast_resume(&self) {
        self.lock.resume_cond.notify_all();
    }

    /// Temporarily releases the lock while running `f`.
    pub fn unlocked<F, R>(&mut self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        MutexGuard::unlocked(&mut self.guard, f)
    }

    pub(crate) fn is_for(&self, lock: &SuspendCountLock) -> bool {
        std::ptr::eq(self.lock, lock)
    }
}

/// The lock bundle shared by every thread of one runtime.
#[derive(Debug)]
pub struct Locks {
    pub mutator_lock: MutatorLock,
    pub suspend_count_lock: SuspendCountLock,
    /// Passed by threads servicing an empty checkpoint.
    pub empty_checkpoint_barrier: Barrier,
}

impl Locks {
    pub fn new() -> Self {
        Self {
            mutator_lock: MutatorLock::new(),
            suspend_count_lock: SuspendCountLock::default(),
            empty_checkpoint_barrier: Barrier::new(0),
        }
    }
}

impl Default for Locks {
    fn default() -> Self {
        Self::new()
    }
}
