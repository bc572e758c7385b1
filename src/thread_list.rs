//! Registry of attached managed threads.
//!
//! The list is owned by the runtime context and passed explicitly to whoever
//! needs to enumerate threads. Its lock sits between the mutator lock and the
//! suspend count lock in the lock order.

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::ThreadConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::locks::Locks;
use crate::roots::{RootVisitor, VisitRootFlags};
use crate::thread::{ManagedThread, SuspendReason, ThreadState};

const DETACH_RETRY: Duration = Duration::from_millis(1);

pub(crate) struct ThreadListInner {
    pub(crate) list: Vec<ManagedThread>,
    /// Suspend-all requests in flight; new threads start with this suspend count.
    pub(crate) suspend_all_count: i32,
    unregistering_count: u32,
    shut_down: bool,
}

/// Proof that the thread list lock is held.
pub struct ThreadListGuard<'a> {
    guard: MutexGuard<'a, ThreadListInner>,
}

impl ThreadListGuard<'_> {
    pub fn threads(&self) -> &[ManagedThread] {
        &self.guard.list
    }

    pub fn len(&self) -> usize {
        self.guard.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.list.is_empty()
    }

    pub fn contains(&self, thread: &ManagedThread) -> bool {
        self.guard.list.iter().any(|candidate| candidate.ptr_eq(thread))
    }

    pub fn find(&self, thread_id: u32) -> Option<&ManagedThread> {
        self.guard.list.iter().find(|thread| thread.id() == thread_id)
    }

    /// Releases the thread list lock while `f` runs.
    pub fn unlocked<F, R>(&mut self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        MutexGuard::unlocked(&mut self.guard, f)
    }

    pub(crate) fn inner_mut(&mut self) -> &mut ThreadListInner {
        &mut self.guard
    }
}

/// All attached threads of one runtime.
///
/// # Examples
///
/// ```
/// use managed_rt::config::ThreadConfig;
/// use managed_rt::locks::Locks;
/// use managed_rt::thread_list::ThreadList;
/// use std::sync::Arc;
///
/// let list = ThreadList::new(Arc::new(Locks::new()), ThreadConfig::default());
/// let worker = list.attach("worker", false).unwrap();
/// assert_eq!(list.len(), 1);
/// assert!(list.find_thread_by_id(worker.id()).is_some());
///
/// list.detach(&worker).unwrap();
/// assert!(list.is_empty());
/// ```
pub struct ThreadList {
    locks: Arc<Locks>,
    inner: Mutex<ThreadListInner>,
    thread_exit_cond: Condvar,
    allocated_ids: Mutex<Vec<bool>>,
    is_gc_marking: AtomicBool,
    weak_ref_access_enabled: AtomicBool,
    config: ThreadConfig,
}

impl ThreadList {
    pub fn new(locks: Arc<Locks>, config: ThreadConfig) -> Self {
        Self {
            locks,
            inner: Mutex::new(ThreadListInner {
                list: Vec::new(),
                suspend_all_count: 0,
                unregistering_count: 0,
                shut_down: false,
            }),
            thread_exit_cond: Condvar::new(),
            allocated_ids: Mutex::new(vec![false; config.max_thread_ids as usize]),
            is_gc_marking: AtomicBool::new(false),
            weak_ref_access_enabled: AtomicBool::new(true),
            config,
        }
    }

    pub fn locks(&self) -> &Arc<Locks> {
        &self.locks
    }

    pub fn config(&self) -> &ThreadConfig {
        &self.config
    }

    pub fn lock(&self) -> ThreadListGuard<'_> {
        ThreadListGuard {
            guard: self.inner.lock(),
        }
    }

    /// Registers a new thread in [`ThreadState::Native`].
    ///
    /// If a suspend-all is in progress the thread starts suspended, so it
    /// blocks on its first transition to Runnable.
    pub fn attach(&self, name: &str, daemon: bool) -> RuntimeResult<ManagedThread> {
        let id = self.alloc_thread_id()?;
        let thread = ManagedThread::new(id, name, daemon, Arc::clone(&self.locks));

        let mut list = self.inner.lock();
        if list.shut_down {
            drop(list);
            self.release_thread_id(id);
            return Err(RuntimeError::ShutDown);
        }
        {
            let mut guard = self.locks.suspend_count_lock.lock();
            for _ in 0..list.suspend_all_count {
                let updated =
                    thread.modify_suspend_count(&mut guard, 1, None, SuspendReason::Internal);
                debug_assert!(updated);
            }
        }
        thread.set_is_gc_marking_and_update_entrypoints(self.is_gc_marking());
        thread.set_weak_ref_access_enabled(self.weak_ref_access_enabled());
        list.list.push(thread.clone());
        drop(list);

        debug!(thread = id, name, daemon, "attached thread");
        Ok(thread)
    }

    /// Removes `thread` from the list and marks it terminated.
    ///
    /// Waits while another thread holds it suspended. Detaching a Runnable
    /// thread is a caller bug.
    pub fn detach(&self, thread: &ManagedThread) -> RuntimeResult<()> {
        assert_ne!(
            thread.state(),
            ThreadState::Runnable,
            "thread {} detached while Runnable",
            thread.id()
        );
        {
            let mut list = self.inner.lock();
            if !list.list.iter().any(|candidate| candidate.ptr_eq(thread)) {
                return Err(RuntimeError::NotRegistered(thread.id()));
            }
            list.unregistering_count += 1;
        }

        loop {
            let mut list = self.inner.lock();
            let mut guard = self.locks.suspend_count_lock.lock();
            if !thread.is_suspended() {
                list.list.retain(|candidate| !candidate.ptr_eq(thread));
                break;
            }
            drop(list);
            guard.wait_for_resume_for(DETACH_RETRY);
        }

        thread.clear_stack_roots();
        thread.set_state(ThreadState::Terminated);
        self.release_thread_id(thread.id());

        let mut list = self.inner.lock();
        list.unregistering_count -= 1;
        self.thread_exit_cond.notify_all();
        drop(list);

        debug!(thread = thread.id(), name = thread.name(), "detached thread");
        Ok(())
    }

    fn alloc_thread_id(&self) -> RuntimeResult<u32> {
        let mut ids = self.allocated_ids.lock();
        let free = ids
            .iter()
            .position(|used| !used)
            .ok_or(RuntimeError::ThreadIdsExhausted)?;
        ids[free] = true;
        // Zero is reserved to mean "invalid".
        Ok(free as u32 + 1)
    }

    fn release_thread_id(&self, id: u32) {
        let mut ids = self.allocated_ids.lock();
        let slot = &mut ids[(id - 1) as usize];
        debug_assert!(*slot, "thread id {id} released twice");
        *slot = false;
    }

    pub fn find_thread_by_id(&self, thread_id: u32) -> Option<ManagedThread> {
        self.lock().find(thread_id).cloned()
    }

    pub fn contains(&self, thread: &ManagedThread) -> bool {
        self.lock().contains(thread)
    }

    pub fn snapshot(&self) -> Vec<ManagedThread> {
        self.lock().threads().to_vec()
    }

    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&ManagedThread),
    {
        for thread in self.lock().threads() {
            f(thread);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Visits the stack roots of every thread. Callers must hold the
    /// mutator lock exclusively or otherwise know the threads are parked.
    pub fn visit_roots(&self, visitor: &mut dyn RootVisitor, flags: VisitRootFlags) {
        for thread in self.lock().threads() {
            thread.visit_roots(visitor, flags);
        }
    }

    pub fn is_gc_marking(&self) -> bool {
        self.is_gc_marking.load(Ordering::Acquire)
    }

    /// Updates the marking flag on every thread and for threads attached later.
    pub fn set_is_gc_marking(&self, marking: bool) {
        let list = self.lock();
        self.is_gc_marking.store(marking, Ordering::Release);
        for thread in list.threads() {
            thread.set_is_gc_marking_and_update_entrypoints(marking);
        }
    }

    pub fn weak_ref_access_enabled(&self) -> bool {
        self.weak_ref_access_enabled.load(Ordering::Acquire)
    }

    pub fn set_weak_ref_access_enabled(&self, enabled: bool) {
        let list = self.lock();
        self.weak_ref_access_enabled.store(enabled, Ordering::Release);
        for thread in list.threads() {
            thread.set_weak_ref_access_enabled(enabled);
        }
    }

    /// Refuses further attaches.
    pub fn shut_down(&self) {
        let mut list = self.inner.lock();
        list.shut_down = true;
        info!(threads = list.list.len(), "thread list shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().shut_down
    }

    /// Blocks until only daemon threads (and `self_thread`) remain attached.
    pub fn wait_for_other_non_daemon_threads_to_exit(&self, self_thread: Option<&ManagedThread>) {
        let mut list = self.inner.lock();
        loop {
            let done = list.unregistering_count == 0
                && list.list.iter().all(|thread| {
                    thread.is_daemon() || self_thread.is_some_and(|me| me.ptr_eq(thread))
                });
            if done {
                break;
            }
            self.thread_exit_cond.wait(&mut list);
        }
    }

    pub fn dump(&self) -> String {
        let list = self.lock();
        let mut out = format!("Thread list: {} threads\n", list.len());
        for thread in list.threads() {
            let _ = writeln!(out, "  {}", thread.short_dump());
        }
        out
    }
}
