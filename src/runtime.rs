//! Runtime context.
//!
//! Owns every runtime-wide component and hands out explicit references to
//! them, so nothing in the crate depends on global state. Each test can build
//! its own isolated runtime.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::collector::{CollectorHooks, GarbageCollector, MarkSweep};
use crate::config::RuntimeConfig;
use crate::error::RuntimeResult;
use crate::heap::Heap;
use crate::intern_table::InternTable;
use crate::locks::Locks;
use crate::roots::GlobalRoots;
use crate::suspend::SuspendCoordinator;
use crate::thread::ManagedThread;
use crate::thread_list::ThreadList;

pub struct Runtime {
    config: RuntimeConfig,
    locks: Arc<Locks>,
    thread_list: Arc<ThreadList>,
    suspend_coordinator: Arc<SuspendCoordinator>,
    heap: Arc<Heap>,
    intern_table: Arc<InternTable>,
    global_roots: Arc<GlobalRoots>,
    mark_sweep: Arc<Mutex<Option<Arc<GarbageCollector<MarkSweep>>>>>,
}

impl Clone for Runtime {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            locks: Arc::clone(&self.locks),
            thread_list: Arc::clone(&self.thread_list),
            suspend_coordinator: Arc::clone(&self.suspend_coordinator),
            heap: Arc::clone(&self.heap),
            intern_table: Arc::clone(&self.intern_table),
            global_roots: Arc::clone(&self.global_roots),
            mark_sweep: Arc::clone(&self.mark_sweep),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        let locks = Arc::new(Locks::new());
        let thread_list = Arc::new(ThreadList::new(Arc::clone(&locks), config.thread.clone()));
        let suspend_coordinator = Arc::new(SuspendCoordinator::new(Arc::clone(&thread_list)));
        let heap = Arc::new(Heap::new(&config.heap));
        let intern_table = Arc::new(InternTable::new(&config.intern));

        Self {
            config,
            locks,
            thread_list,
            suspend_coordinator,
            heap,
            intern_table,
            global_roots: Arc::new(GlobalRoots::new()),
            mark_sweep: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn locks(&self) -> &Arc<Locks> {
        &self.locks
    }

    pub fn thread_list(&self) -> &Arc<ThreadList> {
        &self.thread_list
    }

    pub fn suspend_coordinator(&self) -> &Arc<SuspendCoordinator> {
        &self.suspend_coordinator
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn intern_table(&self) -> &Arc<InternTable> {
        &self.intern_table
    }

    pub fn global_roots(&self) -> &Arc<GlobalRoots> {
        &self.global_roots
    }

    /// Attach the calling OS thread; the new thread starts in Native.
    pub fn attach_thread(&self, name: &str, daemon: bool) -> RuntimeResult<ManagedThread> {
        self.thread_list.attach(name, daemon)
    }

    pub fn detach_thread(&self, thread: &ManagedThread) -> RuntimeResult<()> {
        self.thread_list.detach(thread)
    }

    /// Get or create the mark-sweep collector configured for this runtime
    pub fn mark_sweep_collector(&self) -> Arc<GarbageCollector<MarkSweep>> {
        let mut slot = self.mark_sweep.lock();
        if let Some(collector) = slot.as_ref() {
            return Arc::clone(collector);
        }
        let collector = Arc::new(self.collector(MarkSweep::new(
            Arc::clone(&self.heap),
            self.config.collector_concurrent,
        )));
        *slot = Some(Arc::clone(&collector));
        collector
    }

    /// Wire a custom collector to this runtime's threads, interns and roots
    pub fn collector<C: CollectorHooks>(&self, hooks: C) -> GarbageCollector<C> {
        GarbageCollector::new(
            hooks,
            Arc::clone(&self.suspend_coordinator),
            Arc::clone(&self.intern_table),
            Arc::clone(&self.heap),
            Arc::clone(&self.global_roots),
        )
    }

    /// Refuse new threads and wait for the non-daemon ones to detach.
    pub fn shut_down(&self, self_thread: Option<&ManagedThread>) {
        self.thread_list.shut_down();
        self.thread_list
            .wait_for_other_non_daemon_threads_to_exit(self_thread);
        info!(remaining = self.thread_list.len(), "runtime shut down");
    }
}
