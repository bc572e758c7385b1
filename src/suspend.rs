//! Cross-thread suspension: suspend-all pauses, single-thread suspension and
//! checkpoints.
//!
//! ## Suspend-all
//!
//! 1. Under the thread list and suspend count locks, every other thread's
//!    suspend count is raised and a shared [`SuspendBarrier`] is installed on
//!    the threads that are still Runnable.
//! 2. Runnable threads notice the request at their next safepoint, park and
//!    pass the barrier; the requester waits for it to drain.
//! 3. The requester takes the mutator lock exclusively. From then on no
//!    other thread can be Runnable until [`SuspendCoordinator::resume_all`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::barrier::SuspendBarrier;
use crate::config::ThreadConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::histogram::Histogram;
use crate::roots::{RootVisitor, VisitRootFlags};
use crate::thread::{
    Checkpoint, CheckpointRejected, ManagedThread, ScopedThreadStateChange, SuspendReason,
    ThreadFlags, ThreadState,
};
use crate::thread_list::ThreadList;

/// Exclusive owner recorded when the pausing caller is not an attached thread.
const UNATTACHED_OWNER: u32 = u32::MAX;
const SUSPEND_POLL_SLEEP: Duration = Duration::from_micros(100);

fn is_self(self_thread: Option<&ManagedThread>, thread: &ManagedThread) -> bool {
    self_thread.is_some_and(|me| me.ptr_eq(thread))
}

pub struct SuspendCoordinator {
    thread_list: Arc<ThreadList>,
    suspend_all_histogram: Mutex<Histogram>,
    long_suspend: AtomicBool,
    config: ThreadConfig,
}

impl SuspendCoordinator {
    pub fn new(thread_list: Arc<ThreadList>) -> Self {
        let config = thread_list.config().clone();
        Self {
            thread_list,
            suspend_all_histogram: Mutex::new(Histogram::new("suspend all")),
            long_suspend: AtomicBool::new(false),
            config,
        }
    }

    pub fn thread_list(&self) -> &Arc<ThreadList> {
        &self.thread_list
    }

    /// Suspends every attached thread except `self_thread`.
    ///
    /// `self_thread` must not be Runnable. When this returns, the caller holds
    /// the mutator lock exclusively and every other thread is suspended.
    pub fn suspend_all(&self, self_thread: Option<&ManagedThread>, cause: &str, long_suspend: bool) {
        if let Some(me) = self_thread {
            assert_ne!(
                me.state(),
                ThreadState::Runnable,
                "thread {} requested suspend all while Runnable",
                me.id()
            );
        }
        let owner = self_thread.map_or(UNATTACHED_OWNER, ManagedThread::id);
        debug!(thread = owner, cause, "suspend all starting");
        let start = Instant::now();

        self.suspend_all_internal(self_thread, SuspendReason::Internal);

        // Every thread has passed the barrier, but one may still be on its way
        // out of a failed Runnable transition.
        let mutator_lock = &self.thread_list.locks().mutator_lock;
        while !mutator_lock.try_exclusive_lock_for(owner, self.config.suspend_timeout) {
            error!(
                cause,
                waited = ?start.elapsed(),
                threads = %self.thread_list.dump(),
                "timed out acquiring the mutator lock for suspend all"
            );
        }
        self.long_suspend.store(long_suspend, Ordering::Release);

        let elapsed = start.elapsed();
        self.suspend_all_histogram.lock().add(elapsed);
        if elapsed > self.config.long_suspend_threshold {
            warn!(cause, elapsed = ?elapsed, "suspending all threads took a long time");
        }
        debug!(thread = owner, cause, "suspend all complete");
    }

    fn suspend_all_internal(&self, self_thread: Option<&ManagedThread>, reason: SuspendReason) {
        let locks = self.thread_list.locks();
        let pending = {
            let mut list = self.thread_list.lock();
            let mut guard = locks.suspend_count_lock.lock();
            list.inner_mut().suspend_all_count += 1;

            let targets: Vec<ManagedThread> = list
                .threads()
                .iter()
                .filter(|thread| !is_self(self_thread, thread))
                .cloned()
                .collect();
            let pending = Arc::new(SuspendBarrier::new(targets.len() as i32));
            for thread in &targets {
                if !thread.modify_suspend_count(&mut guard, 1, Some(&pending), reason) {
                    pending.pass();
                    continue;
                }
                // The barrier must be installed before checking the state,
                // otherwise a thread leaving Runnable could miss it.
                if thread.is_suspended() {
                    thread.clear_suspend_barrier(&guard, &pending);
                    pending.pass();
                }
            }
            pending
        };

        let start = Instant::now();
        while !pending.wait(self.config.suspend_timeout) {
            error!(
                waited = ?start.elapsed(),
                pending = pending.pending(),
                "timed out waiting for threads to suspend"
            );
        }
    }

    /// Undoes [`SuspendCoordinator::suspend_all`].
    pub fn resume_all(&self, self_thread: Option<&ManagedThread>) {
        let locks = self.thread_list.locks();
        debug!(
            thread = self_thread.map_or(UNATTACHED_OWNER, ManagedThread::id),
            "resume all starting"
        );
        self.long_suspend.store(false, Ordering::Release);
        locks.mutator_lock.exclusive_unlock();

        let mut list = self.thread_list.lock();
        let mut guard = locks.suspend_count_lock.lock();
        list.inner_mut().suspend_all_count -= 1;
        for thread in list.threads() {
            if is_self(self_thread, thread) {
                continue;
            }
            let updated = thread.modify_suspend_count(&mut guard, -1, None, SuspendReason::Internal);
            debug_assert!(updated);
        }
        guard.broadcast_resume();
    }

    pub fn is_long_suspend(&self) -> bool {
        self.long_suspend.load(Ordering::Acquire)
    }

    pub fn suspend_all_histogram(&self) -> Histogram {
        self.suspend_all_histogram.lock().clone()
    }

    /// Suspends the thread with `thread_id` and waits until it has parked.
    ///
    /// Gives up after the configured suspend timeout, undoing the request.
    pub fn suspend_thread_by_id(
        &self,
        self_thread: Option<&ManagedThread>,
        thread_id: u32,
        reason: SuspendReason,
    ) -> RuntimeResult<ManagedThread> {
        let locks = self.thread_list.locks();
        let _waiting = self_thread
            .map(|me| ScopedThreadStateChange::new(me, ThreadState::WaitingForSuspension));
        let start = Instant::now();
        let backoff = Backoff::new();
        let mut requested = false;

        loop {
            {
                let list = self.thread_list.lock();
                let Some(thread) = list.find(thread_id) else {
                    assert!(!requested, "suspended thread {thread_id} left the thread list");
                    warn!(thread = thread_id, "no such thread id for suspend");
                    return Err(RuntimeError::ThreadNotFound(thread_id));
                };
                assert!(
                    !is_self(self_thread, thread),
                    "thread {thread_id} attempted to suspend itself"
                );

                let mut guard = locks.suspend_count_lock.lock();
                if !requested {
                    if !thread.modify_suspend_count(&mut guard, 1, None, reason) {
                        return Err(RuntimeError::ThreadTerminated(thread_id));
                    }
                    requested = true;
                }
                if thread.is_suspended() {
                    debug!(thread = thread_id, "thread suspended");
                    return Ok(thread.clone());
                }
                let waited = start.elapsed();
                if waited >= self.config.suspend_timeout {
                    warn!(thread = thread_id, waited = ?waited, "thread suspension timed out");
                    let updated = thread.modify_suspend_count(&mut guard, -1, None, reason);
                    debug_assert!(updated);
                    guard.broadcast_resume();
                    return Err(RuntimeError::SuspendTimeout { thread_id, waited });
                }
            }
            if backoff.is_completed() {
                std::thread::sleep(SUSPEND_POLL_SLEEP);
            } else {
                backoff.snooze();
            }
        }
    }

    /// Releases one suspension of `thread`.
    pub fn resume(&self, thread: &ManagedThread, reason: SuspendReason) -> RuntimeResult<()> {
        let locks = self.thread_list.locks();
        let list = self.thread_list.lock();
        let mut guard = locks.suspend_count_lock.lock();
        if !thread.is_suspended() {
            error!(thread = thread.id(), "resume of a thread that is not suspended");
            return Err(RuntimeError::NotSuspended(thread.id()));
        }
        if !list.contains(thread) {
            error!(thread = thread.id(), "resume of a thread outside the thread list");
            return Err(RuntimeError::NotRegistered(thread.id()));
        }
        if !thread.modify_suspend_count(&mut guard, -1, None, reason) {
            return Err(RuntimeError::InvalidSuspendCount(thread.id()));
        }
        guard.broadcast_resume();
        debug!(thread = thread.id(), "resumed thread");
        Ok(())
    }

    /// Runs `checkpoint` for every attached thread.
    ///
    /// Runnable threads run it themselves at their next safepoint; threads
    /// that are not Runnable are held suspended and the checkpoint runs on
    /// their behalf here. `callback` runs while the thread list lock is still
    /// held. Returns the number of threads in the list, which is the number of
    /// times the checkpoint will run once every Runnable thread gets to it.
    pub fn run_checkpoint(
        &self,
        self_thread: Option<&ManagedThread>,
        checkpoint: Checkpoint,
        callback: Option<&dyn Fn()>,
    ) -> usize {
        let locks = self.thread_list.locks();
        assert!(
            self_thread.is_none_or(|me| locks.mutator_lock.exclusive_owner() != me.id()),
            "checkpoints cannot run while all threads are suspended"
        );

        let mut suspended_here = Vec::new();
        let count = {
            let list = self.thread_list.lock();
            let mut guard = locks.suspend_count_lock.lock();
            for thread in list.threads() {
                if is_self(self_thread, thread) {
                    continue;
                }
                let mut function = Arc::clone(&checkpoint);
                loop {
                    match thread.request_checkpoint(&guard, function) {
                        Ok(()) => break,
                        Err(CheckpointRejected::AlreadyPending(f)) => {
                            match thread.queue_overflow_checkpoint(&guard, f) {
                                Ok(()) => break,
                                Err(f) => function = f,
                            }
                        }
                        Err(CheckpointRejected::Contended(f)) => function = f,
                        Err(CheckpointRejected::NotRunnable(f)) => {
                            if thread.state() == ThreadState::Runnable {
                                function = f;
                                continue;
                            }
                            let updated = thread.modify_suspend_count(
                                &mut guard,
                                1,
                                None,
                                SuspendReason::Internal,
                            );
                            debug_assert!(updated);
                            suspended_here.push(thread.clone());
                            break;
                        }
                    }
                }
            }
            if let Some(callback) = callback {
                callback();
            }
            list.len()
        };

        if let Some(me) = self_thread {
            checkpoint(me);
        }

        for thread in &suspended_here {
            if !thread.is_suspended() {
                let start = Instant::now();
                let backoff = Backoff::new();
                while !thread.is_suspended() {
                    backoff.snooze();
                }
                let waited = start.elapsed();
                if waited > self.config.checkpoint_wait_warning {
                    warn!(thread = thread.id(), waited = ?waited, "long wait for thread suspension");
                }
            }
            checkpoint(thread);
            let mut guard = locks.suspend_count_lock.lock();
            let updated = thread.modify_suspend_count(&mut guard, -1, None, SuspendReason::Internal);
            debug_assert!(updated);
        }

        locks.suspend_count_lock.lock().broadcast_resume();
        count
    }

    /// Requests `checkpoint` only from threads that are Runnable right now.
    ///
    /// Returns how many threads will run it.
    pub fn run_checkpoint_on_runnable_threads(
        &self,
        self_thread: Option<&ManagedThread>,
        checkpoint: Checkpoint,
    ) -> usize {
        if let Some(me) = self_thread {
            assert_ne!(me.state(), ThreadState::Runnable);
        }
        let locks = self.thread_list.locks();
        let list = self.thread_list.lock();
        let guard = locks.suspend_count_lock.lock();
        let mut count = 0;
        for thread in list.threads() {
            if is_self(self_thread, thread) {
                continue;
            }
            let accepted = match thread.request_checkpoint(&guard, Arc::clone(&checkpoint)) {
                Ok(()) => true,
                Err(CheckpointRejected::AlreadyPending(f)) => {
                    thread.queue_overflow_checkpoint(&guard, f).is_ok()
                }
                Err(_) => false,
            };
            if accepted {
                count += 1;
            }
        }
        count
    }

    /// Waits until every Runnable thread has passed a safepoint.
    ///
    /// Threads that are not Runnable are not touching the heap and need not
    /// respond. Concurrent callers must serialize.
    pub fn run_empty_checkpoint(&self, self_thread: Option<&ManagedThread>) {
        let locks = self.thread_list.locks();
        let barrier = &locks.empty_checkpoint_barrier;
        barrier.init(0);

        let mut runnable_ids = Vec::new();
        {
            let list = self.thread_list.lock();
            let _guard = locks.suspend_count_lock.lock();
            for thread in list.threads() {
                if is_self(self_thread, thread) {
                    continue;
                }
                loop {
                    if thread.request_empty_checkpoint() {
                        runnable_ids.push(thread.id());
                        break;
                    }
                    if thread.state() != ThreadState::Runnable {
                        break;
                    }
                }
            }
        }

        let _waiting = self_thread
            .map(|me| ScopedThreadStateChange::new(me, ThreadState::WaitingForCheckpointsToRun));
        let mut pending = runnable_ids.len() as i32;
        let mut total = Duration::ZERO;
        let mut reported = false;
        while barrier.increment_for(pending, self.config.empty_checkpoint_period) {
            pending = 0;
            total += self.config.empty_checkpoint_period;
            if total > self.config.empty_checkpoint_total_timeout && !reported {
                reported = true;
                let stuck: Vec<String> = self
                    .thread_list
                    .snapshot()
                    .iter()
                    .filter(|thread| {
                        runnable_ids.contains(&thread.id())
                            && thread.read_flag(ThreadFlags::EMPTY_CHECKPOINT_REQUEST)
                    })
                    .map(ManagedThread::short_dump)
                    .collect();
                error!(
                    barrier_count = barrier.count(),
                    ?runnable_ids,
                    ?stuck,
                    "empty checkpoint timeout"
                );
            }
        }
    }

    /// Visits the roots of every thread that is, or can be held, suspended.
    ///
    /// Runnable threads are skipped rather than waited for.
    pub fn visit_roots_for_suspended_threads(
        &self,
        self_thread: Option<&ManagedThread>,
        visitor: &mut dyn RootVisitor,
    ) {
        let locks = self.thread_list.locks();
        let mut to_visit = Vec::new();
        let mut held = Vec::new();
        {
            let list = self.thread_list.lock();
            let mut guard = locks.suspend_count_lock.lock();
            for thread in list.threads() {
                if is_self(self_thread, thread) {
                    to_visit.push(thread.clone());
                    continue;
                }
                let suspended =
                    thread.modify_suspend_count(&mut guard, 1, None, SuspendReason::Internal);
                debug_assert!(suspended);
                if thread.is_suspended() {
                    to_visit.push(thread.clone());
                    held.push(thread.clone());
                } else {
                    let resumed =
                        thread.modify_suspend_count(&mut guard, -1, None, SuspendReason::Internal);
                    debug_assert!(resumed);
                }
            }
        }

        for thread in &to_visit {
            thread.visit_roots(visitor, VisitRootFlags::ALL_ROOTS);
        }

        let mut guard = locks.suspend_count_lock.lock();
        for thread in &held {
            let updated = thread.modify_suspend_count(&mut guard, -1, None, SuspendReason::Internal);
            debug_assert!(updated);
        }
        guard.broadcast_resume();
    }

    /// Panics unless every thread other than `self_thread` is suspended.
    pub fn assert_threads_are_suspended(&self, self_thread: Option<&ManagedThread>) {
        let list = self.thread_list.lock();
        let _guard = self.thread_list.locks().suspend_count_lock.lock();
        for thread in list.threads() {
            if !is_self(self_thread, thread) {
                assert!(
                    thread.is_suspended(),
                    "unsuspended thread: {}",
                    thread.short_dump()
                );
            }
        }
    }
}

/// Holds every other thread suspended for its lifetime.
pub struct ScopedSuspendAll<'a> {
    coordinator: &'a SuspendCoordinator,
    self_thread: Option<&'a ManagedThread>,
}

impl<'a> ScopedSuspendAll<'a> {
    pub fn new(
        coordinator: &'a SuspendCoordinator,
        self_thread: Option<&'a ManagedThread>,
        cause: &str,
        long_suspend: bool,
    ) -> Self {
        coordinator.suspend_all(self_thread, cause, long_suspend);
        Self {
            coordinator,
            self_thread,
        }
    }
}

impl Drop for ScopedSuspendAll<'_> {
    fn drop(&mut self) {
        self.coordinator.resume_all(self.self_thread);
    }
}
