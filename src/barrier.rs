//! Count-to-zero rendezvous primitives.
//!
//! [`Barrier`] is the lock-protected counter used by checkpoints: every
//! participant passes once and the requester waits for the count to drain.
//! [`SuspendBarrier`] is the atomic counter threads decrement as they
//! acknowledge a suspend request, letting one requester wait for many
//! targets without polling each of them.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// # Examples
///
/// ```
/// use managed_rt::barrier::Barrier;
/// use std::sync::Arc;
///
/// let barrier = Arc::new(Barrier::new(0));
/// let workers: Vec<_> = (0..3)
///     .map(|_| {
///         let barrier = Arc::clone(&barrier);
///         std::thread::spawn(move || barrier.pass())
///     })
///     .collect();
///
/// // Wait for three passes.
/// barrier.increment(3);
/// for worker in workers {
///     worker.join().unwrap();
/// }
/// assert_eq!(barrier.count(), 0);
/// ```
#[derive(Debug)]
pub struct Barrier {
    count: Mutex<i32>,
    cond: Condvar,
}

impl Barrier {
    pub fn new(count: i32) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    pub fn init(&self, count: i32) {
        *self.count.lock() = count;
        self.cond.notify_all();
    }

    pub fn pass(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    pub fn wait(&self) {
        self.increment(-1);
    }

    /// Adds `delta` and blocks until the count drains to zero.
    pub fn increment(&self, delta: i32) {
        let mut count = self.count.lock();
        *count += delta;
        while *count != 0 {
            self.cond.wait(&mut count);
        }
    }

    /// Like [`Barrier::increment`] with a bound; returns `true` on timeout.
    pub fn increment_for(&self, delta: i32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        *count += delta;
        while *count != 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                return *count != 0;
            }
        }
        false
    }

    pub fn count(&self) -> i32 {
        *self.count.lock()
    }
}

/// Atomic counter decremented by each suspending target.
#[derive(Debug)]
pub struct SuspendBarrier {
    pending: AtomicI32,
    lock: Mutex<()>,
    cond: Condvar,
}

impl SuspendBarrier {
    pub fn new(count: i32) -> Self {
        Self {
            pending: AtomicI32::new(count),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn pass(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
    }

    pub fn pending(&self) -> i32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Blocks until every target passed; returns `false` if `timeout` elapsed first.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        loop {
            let pending = self.pending();
            assert!(pending >= 0, "suspend barrier passed too many times");
            if pending == 0 {
                return true;
            }
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return self.pending() == 0;
            }
        }
    }
}
