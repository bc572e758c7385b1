//! Managed threads and their suspension state machine.
//!
//! Every OS thread that runs managed code owns exactly one [`ManagedThread`].
//! The handle is cheap to clone; other threads use clones to request
//! suspension or checkpoints, while the owning thread drives its own
//! transitions.
//!
//! ## Protocol
//!
//! - A Runnable thread holds the global [`MutatorLock`](crate::locks::MutatorLock)
//!   shared. Leaving Runnable releases it, entering Runnable re-acquires it.
//! - Suspend requests raise the suspend count under the suspend count lock and
//!   set [`ThreadFlags::SUSPEND_REQUEST`]. A Runnable thread notices the flag
//!   at its next [`ManagedThread::check_suspend`], parks in
//!   [`ThreadState::Suspended`] and waits for the count to drop to zero.
//! - Checkpoints are closures run by the target at its next safepoint, or on
//!   its behalf by the requester while the target is suspended.
//!
//! # Examples
//!
//! ```
//! use managed_rt::config::RuntimeConfig;
//! use managed_rt::runtime::Runtime;
//! use managed_rt::thread::ThreadState;
//!
//! let runtime = Runtime::new(RuntimeConfig::default());
//! let thread = runtime.attach_thread("main", false).unwrap();
//! assert_eq!(thread.state(), ThreadState::Native);
//!
//! thread.transition_from_suspended_to_runnable();
//! thread.check_suspend();
//! thread.transition_from_runnable_to_suspended(ThreadState::Native);
//!
//! runtime.detach_thread(&thread).unwrap();
//! assert_eq!(thread.state(), ThreadState::Terminated);
//! ```

mod state;
#[cfg(test)]
mod tests;

pub use state::{AtomicStateAndFlags, StateAndFlags, ThreadFlags, ThreadState};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use tracing::{error, trace};

use crate::barrier::{Barrier, SuspendBarrier};
use crate::locks::{Locks, SuspendCountGuard};
use crate::object::ObjectRef;
use crate::roots::{RootInfo, RootType, RootVisitor, VisitRootFlags};
use crate::thread_list::ThreadListGuard;

/// Suspend barriers one thread can be registered with at the same time.
pub const MAX_SUSPEND_BARRIERS: usize = 3;

const BARRIER_SLOT_RETRY: Duration = Duration::from_micros(100);

/// Closure run on (or on behalf of) a thread at a safepoint.
pub type Checkpoint = Arc<dyn Fn(&ManagedThread) + Send + Sync>;

/// Who asked for a suspension; each reason keeps its own count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    Internal,
    ForDebugger,
    ForUserCode,
}

/// A checkpoint that could not be installed, handed back to the caller.
pub enum CheckpointRejected {
    /// The target is not Runnable; run the checkpoint on its behalf instead.
    NotRunnable(Checkpoint),
    /// Another checkpoint is pending; queue this one as overflow.
    AlreadyPending(Checkpoint),
    /// The state word changed underneath the request; retry.
    Contended(Checkpoint),
}

impl CheckpointRejected {
    pub fn into_checkpoint(self) -> Checkpoint {
        match self {
            CheckpointRejected::NotRunnable(f)
            | CheckpointRejected::AlreadyPending(f)
            | CheckpointRejected::Contended(f) => f,
        }
    }
}

impl fmt::Debug for CheckpointRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CheckpointRejected::NotRunnable(_) => "NotRunnable",
            CheckpointRejected::AlreadyPending(_) => "AlreadyPending",
            CheckpointRejected::Contended(_) => "Contended",
        };
        f.write_str(reason)
    }
}

/// Read barrier entrypoint installed on every thread.
pub type MarkEntrypoint = fn(&ObjectRef) -> ObjectRef;

/// Per-thread entrypoint table swapped when concurrent marking starts or ends.
#[derive(Debug, Clone, Copy)]
pub struct Entrypoints {
    pub read_barrier_mark: MarkEntrypoint,
    pub marking: bool,
}

impl Entrypoints {
    pub fn non_marking() -> Self {
        Self {
            read_barrier_mark: read_barrier_identity,
            marking: false,
        }
    }

    pub fn marking() -> Self {
        Self {
            read_barrier_mark: read_barrier_mark_through,
            marking: true,
        }
    }
}

fn read_barrier_identity(object: &ObjectRef) -> ObjectRef {
    object.clone()
}

fn read_barrier_mark_through(object: &ObjectRef) -> ObjectRef {
    object.try_mark();
    object.clone()
}

#[derive(Default)]
struct CheckpointQueue {
    pending: Option<Checkpoint>,
    overflow: VecDeque<Checkpoint>,
}

enum SuspendCountUpdate {
    Applied,
    Rejected,
    BarriersFull,
}

struct ThreadInner {
    id: u32,
    name: String,
    daemon: bool,
    locks: Arc<Locks>,
    state_and_flags: AtomicStateAndFlags,
    // The counts are written only while the suspend count lock is held.
    suspend_count: AtomicI32,
    debug_suspend_count: AtomicI32,
    user_code_suspend_count: AtomicI32,
    active_suspend_barriers: Mutex<[Option<Arc<SuspendBarrier>>; MAX_SUSPEND_BARRIERS]>,
    checkpoints: Mutex<CheckpointQueue>,
    no_thread_suspension: AtomicU32,
    no_thread_suspension_cause: Mutex<Option<&'static str>>,
    weak_ref_access_enabled: AtomicBool,
    is_gc_marking: AtomicBool,
    entrypoints: ArcSwap<Entrypoints>,
    stack_roots: Mutex<Vec<ObjectRef>>,
    safepoint_polls: AtomicU64,
}

/// Handle to one managed thread.
#[derive(Clone)]
pub struct ManagedThread {
    inner: Arc<ThreadInner>,
}

impl ManagedThread {
    pub(crate) fn new(id: u32, name: &str, daemon: bool, locks: Arc<Locks>) -> Self {
        Self {
            inner: Arc::new(ThreadInner {
                id,
                name: name.to_owned(),
                daemon,
                locks,
                state_and_flags: AtomicStateAndFlags::new(ThreadState::Native),
                suspend_count: AtomicI32::new(0),
                debug_suspend_count: AtomicI32::new(0),
                user_code_suspend_count: AtomicI32::new(0),
                active_suspend_barriers: Mutex::new(Default::default()),
                checkpoints: Mutex::new(CheckpointQueue::default()),
                no_thread_suspension: AtomicU32::new(0),
                no_thread_suspension_cause: Mutex::new(None),
                weak_ref_access_enabled: AtomicBool::new(true),
                is_gc_marking: AtomicBool::new(false),
                entrypoints: ArcSwap::from_pointee(Entrypoints::non_marking()),
                stack_roots: Mutex::new(Vec::new()),
                safepoint_polls: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_daemon(&self) -> bool {
        self.inner.daemon
    }

    pub fn ptr_eq(&self, other: &ManagedThread) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn locks(&self) -> &Arc<Locks> {
        &self.inner.locks
    }

    pub fn state(&self) -> ThreadState {
        self.inner.state_and_flags.load().state()
    }

    pub fn state_and_flags(&self) -> StateAndFlags {
        self.inner.state_and_flags.load()
    }

    pub fn read_flag(&self, flag: ThreadFlags) -> bool {
        self.inner.state_and_flags.load().is_any_of(flag)
    }

    /// Not Runnable and asked to stay suspended.
    pub fn is_suspended(&self) -> bool {
        let word = self.inner.state_and_flags.load();
        word.state() != ThreadState::Runnable && word.is_any_of(ThreadFlags::SUSPEND_REQUEST)
    }

    pub fn suspend_count(&self) -> i32 {
        self.inner.suspend_count.load(Ordering::Acquire)
    }

    pub fn debug_suspend_count(&self) -> i32 {
        self.inner.debug_suspend_count.load(Ordering::Acquire)
    }

    pub fn user_code_suspend_count(&self) -> i32 {
        self.inner.user_code_suspend_count.load(Ordering::Acquire)
    }

    pub fn safepoint_polls(&self) -> u64 {
        self.inner.safepoint_polls.load(Ordering::Relaxed)
    }

    /// Changes the state between two non-Runnable states.
    pub(crate) fn set_state(&self, state: ThreadState) -> ThreadState {
        assert_ne!(state, ThreadState::Runnable, "use the Runnable transitions");
        let old = self.inner.state_and_flags.set_state_preserving_flags(state);
        assert_ne!(old, ThreadState::Runnable, "thread {} left Runnable without releasing the mutator lock", self.id());
        old
    }

    // ---- suspend counts -------------------------------------------------

    /// Adjusts the suspend count of this (target) thread.
    ///
    /// Returns `false` when the target has terminated and cannot be suspended,
    /// or when a user-code resume has no matching suspend. A decrement below
    /// zero for any other reason is a broken caller contract and panics.
    ///
    /// When `barrier` is given for an increment, the target passes it once it
    /// is suspended. If all barrier slots are taken the suspend count lock is
    /// released briefly and the request retried.
    pub fn modify_suspend_count(
        &self,
        guard: &mut SuspendCountGuard<'_>,
        delta: i32,
        barrier: Option<&Arc<SuspendBarrier>>,
        reason: SuspendReason,
    ) -> bool {
        debug_assert!(guard.is_for(&self.inner.locks.suspend_count_lock));
        loop {
            match self.modify_suspend_count_internal(delta, barrier, reason) {
                SuspendCountUpdate::Applied => return true,
                SuspendCountUpdate::Rejected => return false,
                SuspendCountUpdate::BarriersFull => {
                    guard.unlocked(|| std::thread::sleep(BARRIER_SLOT_RETRY));
                }
            }
        }
    }

    fn modify_suspend_count_internal(
        &self,
        delta: i32,
        barrier: Option<&Arc<SuspendBarrier>>,
        reason: SuspendReason,
    ) -> SuspendCountUpdate {
        let inner = &self.inner;
        if reason == SuspendReason::ForUserCode
            && inner.user_code_suspend_count.load(Ordering::Relaxed) + delta < 0
        {
            error!(thread = inner.id, delta, "illegal user code suspend count change");
            return SuspendCountUpdate::Rejected;
        }
        let count = inner.suspend_count.load(Ordering::Relaxed);
        if delta < 0 && count + delta < 0 {
            panic!(
                "suspend count of thread {} would become negative ({count} {delta:+})",
                inner.id
            );
        }
        if delta > 0 && self.state() == ThreadState::Terminated {
            return SuspendCountUpdate::Rejected;
        }

        let mut flags = ThreadFlags::SUSPEND_REQUEST;
        if delta > 0 {
            if let Some(barrier) = barrier {
                let mut slots = inner.active_suspend_barriers.lock();
                match slots.iter_mut().find(|slot| slot.is_none()) {
                    Some(slot) => *slot = Some(Arc::clone(barrier)),
                    None => return SuspendCountUpdate::BarriersFull,
                }
                flags |= ThreadFlags::ACTIVE_SUSPEND_BARRIER;
            }
        }

        let new_count = count + delta;
        inner.suspend_count.store(new_count, Ordering::Release);
        match reason {
            SuspendReason::ForDebugger => {
                inner.debug_suspend_count.fetch_add(delta, Ordering::AcqRel);
            }
            SuspendReason::ForUserCode => {
                inner.user_code_suspend_count.fetch_add(delta, Ordering::AcqRel);
            }
            SuspendReason::Internal => {}
        }

        if new_count == 0 {
            inner
                .state_and_flags
                .fetch_clear_flags(ThreadFlags::SUSPEND_REQUEST);
        } else {
            inner.state_and_flags.fetch_or_flags(flags);
        }
        SuspendCountUpdate::Applied
    }

    /// Drops `target` from the active barriers without passing it.
    pub(crate) fn clear_suspend_barrier(
        &self,
        _guard: &SuspendCountGuard<'_>,
        target: &Arc<SuspendBarrier>,
    ) {
        assert!(
            self.read_flag(ThreadFlags::ACTIVE_SUSPEND_BARRIER),
            "thread {} has no active suspend barrier",
            self.id()
        );
        let mut slots = self.inner.active_suspend_barriers.lock();
        let mut others = false;
        for slot in slots.iter_mut() {
            match slot {
                Some(barrier) if Arc::ptr_eq(barrier, target) => *slot = None,
                Some(_) => others = true,
                None => {}
            }
        }
        if !others {
            self.inner
                .state_and_flags
                .fetch_clear_flags(ThreadFlags::ACTIVE_SUSPEND_BARRIER);
        }
    }

    fn pass_active_suspend_barriers(&self) -> bool {
        let barriers: Vec<Arc<SuspendBarrier>> = {
            let _guard = self.inner.locks.suspend_count_lock.lock();
            if !self.read_flag(ThreadFlags::ACTIVE_SUSPEND_BARRIER) {
                return false;
            }
            let taken = self
                .inner
                .active_suspend_barriers
                .lock()
                .iter_mut()
                .filter_map(Option::take)
                .collect();
            self.inner
                .state_and_flags
                .fetch_clear_flags(ThreadFlags::ACTIVE_SUSPEND_BARRIER);
            taken
        };
        for barrier in barriers {
            barrier.pass();
        }
        true
    }

    // ---- checkpoints ----------------------------------------------------

    /// Installs `function` to run on this thread at its next safepoint.
    ///
    /// Only a Runnable thread with no pending checkpoint accepts a request;
    /// otherwise the closure is handed back inside the rejection.
    pub fn request_checkpoint(
        &self,
        _guard: &SuspendCountGuard<'_>,
        function: Checkpoint,
    ) -> Result<(), CheckpointRejected> {
        let old = self.inner.state_and_flags.load();
        if old.state() != ThreadState::Runnable {
            return Err(CheckpointRejected::NotRunnable(function));
        }
        if old.is_any_of(ThreadFlags::CHECKPOINT_REQUEST) {
            return Err(CheckpointRejected::AlreadyPending(function));
        }
        if !self
            .inner
            .state_and_flags
            .compare_exchange(old, old.with_flags(ThreadFlags::CHECKPOINT_REQUEST))
        {
            return Err(CheckpointRejected::Contended(function));
        }
        self.inner.checkpoints.lock().pending = Some(function);
        Ok(())
    }

    /// Queues `function` behind the pending checkpoint.
    ///
    /// Fails, returning the closure, once the pending checkpoint has been
    /// taken; the caller should then retry [`ManagedThread::request_checkpoint`].
    pub fn queue_overflow_checkpoint(
        &self,
        _guard: &SuspendCountGuard<'_>,
        function: Checkpoint,
    ) -> Result<(), Checkpoint> {
        if !self.read_flag(ThreadFlags::CHECKPOINT_REQUEST) {
            return Err(function);
        }
        self.inner.checkpoints.lock().overflow.push_back(function);
        Ok(())
    }

    /// Asks a Runnable thread to pass the empty checkpoint barrier.
    pub fn request_empty_checkpoint(&self) -> bool {
        let old = self.inner.state_and_flags.load();
        if old.state() != ThreadState::Runnable {
            return false;
        }
        self.inner
            .state_and_flags
            .compare_exchange(old, old.with_flags(ThreadFlags::EMPTY_CHECKPOINT_REQUEST))
    }

    fn run_checkpoint_function(&self) {
        let checkpoint = {
            let _guard = self.inner.locks.suspend_count_lock.lock();
            let mut queue = self.inner.checkpoints.lock();
            let next = queue.pending.take();
            match queue.overflow.pop_front() {
                Some(overflow) => queue.pending = Some(overflow),
                None => {
                    self.inner
                        .state_and_flags
                        .fetch_clear_flags(ThreadFlags::CHECKPOINT_REQUEST);
                }
            }
            next
        };
        if let Some(checkpoint) = checkpoint {
            checkpoint(self);
        }
    }

    fn run_empty_checkpoint(&self) {
        self.inner
            .state_and_flags
            .fetch_clear_flags(ThreadFlags::EMPTY_CHECKPOINT_REQUEST);
        self.inner.locks.empty_checkpoint_barrier.pass();
    }

    fn run_pending_checkpoints(&self) {
        loop {
            let flags = self.inner.state_and_flags.load().flags();
            if flags.contains(ThreadFlags::CHECKPOINT_REQUEST) {
                self.run_checkpoint_function();
            } else if flags.contains(ThreadFlags::EMPTY_CHECKPOINT_REQUEST) {
                self.run_empty_checkpoint();
            } else {
                break;
            }
        }
    }

    /// Runs `function` on this (target) thread and waits for it to finish.
    ///
    /// `list_guard` is always released before the caller blocks, so the target
    /// can take the thread list lock to detach. While waiting the requester
    /// sits in `suspend_state`. Returns `false` if the target has terminated.
    pub fn request_synchronous_checkpoint(
        &self,
        requester: Option<&ManagedThread>,
        mut list_guard: ThreadListGuard<'_>,
        function: Checkpoint,
        suspend_state: ThreadState,
    ) -> bool {
        if requester.is_some_and(|requester| requester.ptr_eq(self)) {
            drop(list_guard);
            function(self);
            return true;
        }
        if self.state() == ThreadState::Terminated {
            drop(list_guard);
            return false;
        }

        let locks = Arc::clone(&self.inner.locks);
        loop {
            if self.state() == ThreadState::Runnable {
                let barrier = Arc::new(Barrier::new(0));
                let wrapped: Checkpoint = {
                    let barrier = Arc::clone(&barrier);
                    let function = Arc::clone(&function);
                    Arc::new(move |thread: &ManagedThread| {
                        function(thread);
                        barrier.pass();
                    })
                };
                let installed = {
                    let guard = locks.suspend_count_lock.lock();
                    self.request_checkpoint(&guard, wrapped).is_ok()
                };
                if installed {
                    drop(list_guard);
                    let _waiting = requester
                        .map(|requester| ScopedThreadStateChange::new(requester, suspend_state));
                    barrier.increment(1);
                    return true;
                }
            }

            {
                let mut guard = locks.suspend_count_lock.lock();
                if !self.modify_suspend_count(&mut guard, 1, None, SuspendReason::Internal) {
                    drop(guard);
                    std::thread::yield_now();
                    continue;
                }
            }

            // The raised suspend count keeps the target from detaching.
            list_guard.unlocked(|| {
                {
                    let _waiting = requester
                        .map(|requester| ScopedThreadStateChange::new(requester, suspend_state));
                    let backoff = Backoff::new();
                    while self.state() == ThreadState::Runnable {
                        backoff.snooze();
                    }
                }
                function(self);
            });

            {
                let mut guard = locks.suspend_count_lock.lock();
                let updated = self.modify_suspend_count(&mut guard, -1, None, SuspendReason::Internal);
                debug_assert!(updated);
                guard.broadcast_resume();
            }
            drop(list_guard);
            return true;
        }
    }

    // ---- transitions ----------------------------------------------------

    /// Leaves Runnable for `new_state`, servicing any pending checkpoints first.
    pub fn transition_from_runnable_to_suspended(&self, new_state: ThreadState) {
        assert_ne!(new_state, ThreadState::Runnable);
        assert_eq!(
            self.state(),
            ThreadState::Runnable,
            "thread {} is not Runnable",
            self.id()
        );
        self.assert_thread_suspension_is_allowable();

        loop {
            let old = self.inner.state_and_flags.load();
            if old.is_any_of(ThreadFlags::CHECKPOINT_REQUEST) {
                self.run_checkpoint_function();
            } else if old.is_any_of(ThreadFlags::EMPTY_CHECKPOINT_REQUEST) {
                self.run_empty_checkpoint();
            } else if self
                .inner
                .state_and_flags
                .compare_exchange(old, old.with_state(new_state))
            {
                break;
            }
        }
        self.inner.locks.mutator_lock.shared_unlock();

        loop {
            let flags = self.inner.state_and_flags.load().flags();
            if !flags.intersects(ThreadFlags::CHECKPOINT_REQUEST | ThreadFlags::ACTIVE_SUSPEND_BARRIER) {
                break;
            }
            if flags.contains(ThreadFlags::ACTIVE_SUSPEND_BARRIER) {
                self.pass_active_suspend_barriers();
            } else {
                panic!(
                    "thread {} became {new_state} without running its checkpoint",
                    self.id()
                );
            }
        }
    }

    /// Becomes Runnable, blocking while the suspend count is non-zero.
    ///
    /// Returns the state the thread left.
    pub fn transition_from_suspended_to_runnable(&self) -> ThreadState {
        let old_state = self.state();
        assert_ne!(old_state, ThreadState::Runnable, "thread {} is already Runnable", self.id());
        assert_ne!(old_state, ThreadState::Terminated, "thread {} has terminated", self.id());
        let mutator_lock = &self.inner.locks.mutator_lock;

        loop {
            let old = self.inner.state_and_flags.load();
            let flags = old.flags();
            if flags.is_empty() {
                mutator_lock.shared_lock();
                if self
                    .inner
                    .state_and_flags
                    .compare_exchange(old, old.with_state(ThreadState::Runnable))
                {
                    break;
                }
                mutator_lock.shared_unlock();
            } else if flags.contains(ThreadFlags::ACTIVE_SUSPEND_BARRIER) {
                self.pass_active_suspend_barriers();
            } else if flags
                .intersects(ThreadFlags::CHECKPOINT_REQUEST | ThreadFlags::EMPTY_CHECKPOINT_REQUEST)
            {
                panic!(
                    "thread {} has a checkpoint pending while {old_state}",
                    self.id()
                );
            } else {
                let mut guard = self.inner.locks.suspend_count_lock.lock();
                while self.read_flag(ThreadFlags::SUSPEND_REQUEST) {
                    guard.wait_for_resume();
                }
            }
        }

        self.run_pending_checkpoints();
        old_state
    }

    /// Safepoint poll: services checkpoints and suspend requests.
    pub fn check_suspend(&self) {
        assert_eq!(
            self.state(),
            ThreadState::Runnable,
            "thread {} polled for suspension while not Runnable",
            self.id()
        );
        self.inner.safepoint_polls.fetch_add(1, Ordering::Relaxed);
        loop {
            let flags = self.inner.state_and_flags.load().flags();
            if flags.contains(ThreadFlags::CHECKPOINT_REQUEST) {
                self.run_checkpoint_function();
            } else if flags.contains(ThreadFlags::SUSPEND_REQUEST) {
                self.full_suspend_check();
            } else if flags.contains(ThreadFlags::EMPTY_CHECKPOINT_REQUEST) {
                self.run_empty_checkpoint();
            } else {
                break;
            }
        }
    }

    /// Fast-path safepoint: only enters [`ManagedThread::check_suspend`] when
    /// a request is pending.
    pub fn allow_thread_suspension(&self) {
        if self
            .inner
            .state_and_flags
            .load()
            .is_any_of(ThreadFlags::SAFEPOINT_REQUESTS)
        {
            self.check_suspend();
        } else {
            self.inner.safepoint_polls.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn full_suspend_check(&self) {
        trace!(thread = self.id(), "self-suspending");
        self.transition_from_runnable_to_suspended(ThreadState::Suspended);
        self.transition_from_suspended_to_runnable();
        trace!(thread = self.id(), "self-reviving");
    }

    // ---- no-suspension regions -----------------------------------------

    /// Enters a region in which this thread must not be suspended.
    ///
    /// Returns the cause of the enclosing region, to hand back to
    /// [`ManagedThread::end_assert_no_thread_suspension`].
    pub fn start_assert_no_thread_suspension(&self, cause: &'static str) -> Option<&'static str> {
        self.inner.no_thread_suspension.fetch_add(1, Ordering::AcqRel);
        self.inner.no_thread_suspension_cause.lock().replace(cause)
    }

    pub fn end_assert_no_thread_suspension(&self, old_cause: Option<&'static str>) {
        let released = self.inner.no_thread_suspension.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |count| count.checked_sub(1),
        );
        if released.is_err() {
            panic!(
                "thread {} released a no-suspension region it never entered",
                self.id()
            );
        }
        *self.inner.no_thread_suspension_cause.lock() = old_cause;
    }

    pub fn is_thread_suspension_allowable(&self) -> bool {
        self.inner.no_thread_suspension.load(Ordering::Acquire) == 0
    }

    pub(crate) fn assert_thread_suspension_is_allowable(&self) {
        if !self.is_thread_suspension_allowable() {
            let cause = *self.inner.no_thread_suspension_cause.lock();
            panic!(
                "thread {} may not be suspended here: {}",
                self.id(),
                cause.unwrap_or("unknown")
            );
        }
    }

    // ---- collector interaction -----------------------------------------

    pub fn is_gc_marking(&self) -> bool {
        self.inner.is_gc_marking.load(Ordering::Acquire)
    }

    pub fn set_is_gc_marking_and_update_entrypoints(&self, marking: bool) {
        self.inner.is_gc_marking.store(marking, Ordering::Release);
        let entrypoints = if marking {
            Entrypoints::marking()
        } else {
            Entrypoints::non_marking()
        };
        self.inner.entrypoints.store(Arc::new(entrypoints));
    }

    pub fn entrypoints(&self) -> Entrypoints {
        **self.inner.entrypoints.load()
    }

    /// Loads a reference through the current read barrier entrypoint.
    pub fn read_barrier(&self, object: &ObjectRef) -> ObjectRef {
        (self.inner.entrypoints.load().read_barrier_mark)(object)
    }

    pub fn weak_ref_access_enabled(&self) -> bool {
        self.inner.weak_ref_access_enabled.load(Ordering::Acquire)
    }

    pub fn set_weak_ref_access_enabled(&self, enabled: bool) {
        self.inner
            .weak_ref_access_enabled
            .store(enabled, Ordering::Release);
    }

    // ---- stack roots ----------------------------------------------------

    pub fn push_stack_root(&self, object: ObjectRef) {
        self.inner.stack_roots.lock().push(object);
    }

    pub fn pop_stack_root(&self) -> Option<ObjectRef> {
        self.inner.stack_roots.lock().pop()
    }

    pub fn stack_roots(&self) -> Vec<ObjectRef> {
        self.inner.stack_roots.lock().clone()
    }

    pub fn clear_stack_roots(&self) {
        self.inner.stack_roots.lock().clear();
    }

    /// Reports every stack slot; the visitor may overwrite a slot to relocate it.
    pub fn visit_roots(&self, visitor: &mut dyn RootVisitor, _flags: VisitRootFlags) {
        let info = RootInfo::new(RootType::ThreadStack { thread_id: self.id() });
        for root in self.inner.stack_roots.lock().iter_mut() {
            visitor.visit_root(root, info);
        }
    }

    pub fn short_dump(&self) -> String {
        let word = self.state_and_flags();
        format!(
            "\"{}\"{} id={} state={} flags={:?} suspend_count={} debug_suspend_count={}",
            self.name(),
            if self.is_daemon() { " daemon" } else { "" },
            self.id(),
            word.state(),
            word.flags(),
            self.suspend_count(),
            self.debug_suspend_count(),
        )
    }
}

impl fmt::Debug for ManagedThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedThread")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Moves a thread to another state for the guard's lifetime.
pub struct ScopedThreadStateChange<'a> {
    thread: &'a ManagedThread,
    old_state: ThreadState,
}

impl<'a> ScopedThreadStateChange<'a> {
    pub fn new(thread: &'a ManagedThread, new_state: ThreadState) -> Self {
        let old_state = thread.state();
        change_state(thread, old_state, new_state);
        Self { thread, old_state }
    }
}

impl Drop for ScopedThreadStateChange<'_> {
    fn drop(&mut self) {
        let current = self.thread.state();
        change_state(self.thread, current, self.old_state);
    }
}

fn change_state(thread: &ManagedThread, from: ThreadState, to: ThreadState) {
    if from == to {
        return;
    }
    if from == ThreadState::Runnable {
        thread.transition_from_runnable_to_suspended(to);
    } else if to == ThreadState::Runnable {
        thread.transition_from_suspended_to_runnable();
    } else {
        thread.set_state(to);
    }
}

/// Marks a region where the thread must not reach a suspension point.
pub struct ScopedAssertNoThreadSuspension<'a> {
    thread: &'a ManagedThread,
    old_cause: Option<&'static str>,
}

impl<'a> ScopedAssertNoThreadSuspension<'a> {
    pub fn new(thread: &'a ManagedThread, cause: &'static str) -> Self {
        let old_cause = thread.start_assert_no_thread_suspension(cause);
        Self { thread, old_cause }
    }
}

impl Drop for ScopedAssertNoThreadSuspension<'_> {
    fn drop(&mut self) {
        self.thread.end_assert_no_thread_suspension(self.old_cause);
    }
}
