//! Garbage collection driver.
//!
//! [`GarbageCollector::run`] performs one collection against live mutators:
//!
//! 1. Suspend every other thread and close weak-root access.
//! 2. Mark from thread stacks, strong interns and global roots.
//! 3. Concurrent collectors resume the mutators and drain the mark stack,
//!    then suspend again and remark.
//! 4. Sweep the weak intern set and reopen weak-root access, still paused.
//! 5. Resume, reclaim unmarked objects and record statistics.
//!
//! What marking means is up to the [`CollectorHooks`] implementation; the
//! driver fixes only the ordering against suspension and the intern table.

mod iteration;
mod mark_sweep;

pub use iteration::{CumulativeStats, Iteration};
pub use mark_sweep::MarkSweep;

use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use flume::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::heap::{Heap, SweepResult};
use crate::intern_table::InternTable;
use crate::object::ObjectRef;
use crate::roots::{GlobalRoots, RootInfo, VisitRootFlags};
use crate::suspend::{ScopedSuspendAll, SuspendCoordinator};
use crate::thread::{ManagedThread, ScopedThreadStateChange, ThreadState};
use crate::thread_list::ThreadList;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcCause {
    /// Requested by the embedder.
    Explicit,
    Background,
    /// An allocation could not be satisfied.
    ForAlloc,
    NativeAlloc,
    Shutdown,
}

impl fmt::Display for GcCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GcCause::Explicit => "Explicit",
            GcCause::Background => "Background",
            GcCause::ForAlloc => "Alloc",
            GcCause::NativeAlloc => "NativeAlloc",
            GcCause::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcType {
    /// Only objects allocated since the last collection.
    Sticky,
    /// Everything except immune spaces.
    Partial,
    Full,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectorPhase {
    Idle = 0,
    PreparePause = 1,
    RootVisit = 2,
    ConcurrentMark = 3,
    FinalPause = 4,
    Reclaim = 5,
}

impl CollectorPhase {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => CollectorPhase::Idle,
            1 => CollectorPhase::PreparePause,
            2 => CollectorPhase::RootVisit,
            3 => CollectorPhase::ConcurrentMark,
            4 => CollectorPhase::FinalPause,
            5 => CollectorPhase::Reclaim,
            _ => unreachable!("corrupt collector phase {raw}"),
        }
    }
}

/// Collector-specific behaviour plugged into the [`GarbageCollector`] driver.
pub trait CollectorHooks: Send {
    fn name(&self) -> &str;
    fn gc_type(&self) -> GcType;
    fn is_concurrent(&self) -> bool;
    /// Called before the first pause.
    fn initialize_phase(&mut self);
    /// Marks a root and returns its (possibly new) location.
    fn mark_object(&mut self, object: &ObjectRef) -> ObjectRef;
    fn process_mark_stack(&mut self);
    /// Liveness oracle: `None` if `object` is dead.
    fn is_marked(&self, object: &ObjectRef) -> Option<ObjectRef>;
    /// Queues whatever must be rescanned in the final pause.
    fn remark(&mut self);
    fn reclaim_phase(&mut self) -> SweepResult;
    fn finish_phase(&mut self);
}

/// Closes weak-root access for its lifetime unless reopened earlier.
struct WeakAccessGate<'a> {
    intern_table: &'a InternTable,
    thread_list: &'a ThreadList,
    open: bool,
}

impl<'a> WeakAccessGate<'a> {
    fn close(intern_table: &'a InternTable, thread_list: &'a ThreadList) -> Self {
        thread_list.set_weak_ref_access_enabled(false);
        intern_table.disallow_new_interns();
        Self {
            intern_table,
            thread_list,
            open: false,
        }
    }

    fn reopen(&mut self) {
        if !self.open {
            self.open = true;
            self.thread_list.set_weak_ref_access_enabled(true);
            self.intern_table.allow_new_interns();
        }
    }
}

impl Drop for WeakAccessGate<'_> {
    fn drop(&mut self) {
        self.reopen();
    }
}

pub struct GarbageCollector<C> {
    name: String,
    collector: Mutex<C>,
    thread_list: Arc<ThreadList>,
    suspend: Arc<SuspendCoordinator>,
    intern_table: Arc<InternTable>,
    heap: Arc<Heap>,
    global_roots: Arc<GlobalRoots>,
    phase: AtomicU8,
    phase_subscribers: Mutex<Vec<Sender<CollectorPhase>>>,
    last_iteration: Mutex<Option<Iteration>>,
    stats: Mutex<CumulativeStats>,
}

impl<C: CollectorHooks> GarbageCollector<C> {
    pub fn new(
        collector: C,
        suspend: Arc<SuspendCoordinator>,
        intern_table: Arc<InternTable>,
        heap: Arc<Heap>,
        global_roots: Arc<GlobalRoots>,
    ) -> Self {
        Self {
            name: collector.name().to_owned(),
            collector: Mutex::new(collector),
            thread_list: Arc::clone(suspend.thread_list()),
            suspend,
            intern_table,
            heap,
            global_roots,
            phase: AtomicU8::new(CollectorPhase::Idle as u8),
            phase_subscribers: Mutex::new(Vec::new()),
            last_iteration: Mutex::new(None),
            stats: Mutex::new(CumulativeStats::new()),
        }
    }

    /// Runs one full collection.
    ///
    /// Runs of every collector sharing the heap are serialized. `self_thread`,
    /// if attached, waits in [`ThreadState::WaitingForGcToComplete`] behind a
    /// running collection and in [`ThreadState::WaitingPerformingGc`] while
    /// collecting.
    pub fn run(
        &self,
        self_thread: Option<&ManagedThread>,
        cause: GcCause,
        clear_soft_references: bool,
    ) -> Iteration {
        let _waiting =
            self_thread.map(|me| ScopedThreadStateChange::new(me, ThreadState::WaitingForGcToComplete));
        let _collecting = self.heap.lock_collection();
        let _performing =
            self_thread.map(|me| ScopedThreadStateChange::new(me, ThreadState::WaitingPerformingGc));
        let mut collector = self.collector.lock();
        let mut iteration = Iteration::new(cause, clear_soft_references, collector.gc_type());
        info!(collector = collector.name(), %cause, clear_soft_references, "gc starting");

        self.set_phase(CollectorPhase::PreparePause);
        collector.initialize_phase();
        if collector.is_concurrent() {
            self.run_concurrent(&mut *collector, self_thread, &mut iteration);
        } else {
            self.run_stop_the_world(&mut *collector, self_thread, &mut iteration);
        }

        self.set_phase(CollectorPhase::Reclaim);
        let freed = collector.reclaim_phase();
        iteration.record_free(freed.regular);
        iteration.record_free_los(freed.large);
        self.heap.set_allocation_black(false);
        collector.finish_phase();
        iteration.finish();

        self.stats.lock().fold(&iteration);
        *self.last_iteration.lock() = Some(iteration.clone());
        self.set_phase(CollectorPhase::Idle);
        info!(
            collector = collector.name(),
            %cause,
            freed_objects = iteration.freed_objects(),
            freed_bytes = iteration.freed_bytes(),
            pauses = ?iteration.pause_times(),
            duration = ?iteration.duration(),
            "gc finished"
        );
        iteration
    }

    fn run_stop_the_world(
        &self,
        collector: &mut C,
        self_thread: Option<&ManagedThread>,
        iteration: &mut Iteration,
    ) {
        let pause_start = Instant::now();
        {
            let _pause = ScopedSuspendAll::new(&self.suspend, self_thread, "stop-the-world gc", false);
            let mut gate = WeakAccessGate::close(&self.intern_table, &self.thread_list);

            self.set_phase(CollectorPhase::RootVisit);
            self.mark_roots(collector);
            collector.process_mark_stack();
            // Objects allocated between resume and reclaim must survive.
            self.heap.set_allocation_black(true);

            self.set_phase(CollectorPhase::FinalPause);
            self.sweep_system_weaks(collector);
            gate.reopen();
        }
        iteration.record_pause(pause_start.elapsed());
    }

    fn run_concurrent(
        &self,
        collector: &mut C,
        self_thread: Option<&ManagedThread>,
        iteration: &mut Iteration,
    ) {
        let pause_start = Instant::now();
        let mut gate;
        {
            let _pause = ScopedSuspendAll::new(&self.suspend, self_thread, "gc initial pause", false);
            gate = WeakAccessGate::close(&self.intern_table, &self.thread_list);
            self.set_phase(CollectorPhase::RootVisit);
            self.heap.set_allocation_black(true);
            self.thread_list.set_is_gc_marking(true);
            self.mark_roots(collector);
        }
        iteration.record_pause(pause_start.elapsed());

        self.set_phase(CollectorPhase::ConcurrentMark);
        collector.process_mark_stack();

        let pause_start = Instant::now();
        {
            let _pause = ScopedSuspendAll::new(&self.suspend, self_thread, "gc final pause", false);
            self.set_phase(CollectorPhase::FinalPause);
            collector.remark();
            self.mark_roots(collector);
            collector.process_mark_stack();
            self.thread_list.set_is_gc_marking(false);
            self.sweep_system_weaks(collector);
            gate.reopen();
        }
        iteration.record_pause(pause_start.elapsed());
    }

    fn mark_roots(&self, collector: &mut C) {
        let mut visitor = |root: &mut ObjectRef, _: RootInfo| {
            *root = collector.mark_object(root);
        };
        self.thread_list.visit_roots(&mut visitor, VisitRootFlags::ALL_ROOTS);
        self.intern_table.visit_roots(&mut visitor, VisitRootFlags::ALL_ROOTS);
        self.global_roots.visit_roots(&mut visitor);
    }

    fn sweep_system_weaks(&self, collector: &C) {
        let swept = self
            .intern_table
            .sweep_weaks(&|object: &ObjectRef| collector.is_marked(object));
        debug!(swept, "swept system weaks");
    }

    fn set_phase(&self, phase: CollectorPhase) {
        self.phase.store(phase as u8, Ordering::Release);
        debug!(?phase, "collector phase");
        self.phase_subscribers
            .lock()
            .retain(|subscriber| subscriber.send(phase).is_ok());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current_phase(&self) -> CollectorPhase {
        CollectorPhase::from_raw(self.phase.load(Ordering::Acquire))
    }

    /// Receives every phase change from now on.
    pub fn subscribe_phases(&self) -> Receiver<CollectorPhase> {
        let (sender, receiver) = flume::unbounded();
        self.phase_subscribers.lock().push(sender);
        receiver
    }

    pub fn last_iteration(&self) -> Option<Iteration> {
        self.last_iteration.lock().clone()
    }

    /// Does not wait for a collection in progress.
    pub fn cumulative_stats(&self) -> CumulativeStats {
        self.stats.lock().clone()
    }

    pub fn reset_cumulative_statistics(&self) {
        self.stats.lock().reset();
    }

    pub fn dump_performance_info(&self) -> String {
        let stats = self.cumulative_stats();
        let mut out = String::new();
        let _ = writeln!(out, "{}: {} iterations", self.name, stats.iterations());
        let _ = writeln!(out, "  total time: {:?}", stats.total_time());
        let _ = writeln!(
            out,
            "  freed: {} objects, {} bytes ({} large objects, {} bytes)",
            stats.total_freed_objects(),
            stats.total_freed_bytes(),
            stats.total_freed_los().objects,
            stats.total_freed_los().bytes,
        );
        let _ = writeln!(out, "  {}", stats.pause_histogram());
        if let Some(mean) = stats.pause_histogram().mean() {
            let _ = writeln!(out, "  mean pause: {mean:?}");
        }
        out
    }
}
