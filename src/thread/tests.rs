use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_utils::Backoff;

use super::*;
use crate::config::{HeapConfig, ThreadConfig};
use crate::heap::Heap;
use crate::thread_list::ThreadList;

fn thread_list() -> ThreadList {
    ThreadList::new(Arc::new(Locks::new()), ThreadConfig::default())
}

fn recording(log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> Checkpoint {
    let log = Arc::clone(log);
    Arc::new(move |_: &ManagedThread| log.lock().push(tag))
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let backoff = Backoff::new();
    while !condition() {
        if backoff.is_completed() {
            std::thread::sleep(Duration::from_micros(50));
        } else {
            backoff.snooze();
        }
    }
}

#[test]
fn runnable_threads_hold_the_mutator_lock_shared() {
    let list = thread_list();
    let thread = list.attach("mutator", false).unwrap();
    let mutator_lock = &list.locks().mutator_lock;

    assert_eq!(thread.transition_from_suspended_to_runnable(), ThreadState::Native);
    assert_eq!(thread.state(), ThreadState::Runnable);
    assert_eq!(mutator_lock.shared_holders(), 1);
    assert!(!mutator_lock.try_exclusive_lock_for(1, Duration::from_millis(2)));

    thread.transition_from_runnable_to_suspended(ThreadState::Blocked);
    assert_eq!(thread.state(), ThreadState::Blocked);
    assert_eq!(mutator_lock.shared_holders(), 0);
}

#[test]
fn suspend_request_flag_follows_the_count() {
    let list = thread_list();
    let thread = list.attach("target", false).unwrap();
    let mut guard = list.locks().suspend_count_lock.lock();

    assert!(thread.modify_suspend_count(&mut guard, 1, None, SuspendReason::Internal));
    assert!(thread.modify_suspend_count(&mut guard, 1, None, SuspendReason::ForDebugger));
    assert_eq!(thread.suspend_count(), 2);
    assert_eq!(thread.debug_suspend_count(), 1);
    assert!(thread.read_flag(ThreadFlags::SUSPEND_REQUEST));
    assert!(thread.is_suspended());

    assert!(thread.modify_suspend_count(&mut guard, -1, None, SuspendReason::ForDebugger));
    assert!(thread.read_flag(ThreadFlags::SUSPEND_REQUEST));
    assert!(thread.modify_suspend_count(&mut guard, -1, None, SuspendReason::Internal));
    assert!(!thread.read_flag(ThreadFlags::SUSPEND_REQUEST));
    assert!(!thread.is_suspended());
}

#[test]
#[should_panic(expected = "would become negative")]
fn suspend_count_underflow_panics() {
    let list = thread_list();
    let thread = list.attach("target", false).unwrap();
    let mut guard = list.locks().suspend_count_lock.lock();
    thread.modify_suspend_count(&mut guard, -1, None, SuspendReason::Internal);
}

#[test]
fn unmatched_user_code_resume_is_refused() {
    let list = thread_list();
    let thread = list.attach("target", false).unwrap();
    let mut guard = list.locks().suspend_count_lock.lock();
    assert!(thread.modify_suspend_count(&mut guard, 1, None, SuspendReason::Internal));
    assert!(!thread.modify_suspend_count(&mut guard, -1, None, SuspendReason::ForUserCode));
    assert_eq!(thread.suspend_count(), 1);
    assert_eq!(thread.user_code_suspend_count(), 0);
}

#[test]
fn terminated_threads_cannot_be_suspended() {
    let list = thread_list();
    let thread = list.attach("short-lived", false).unwrap();
    list.detach(&thread).unwrap();
    let mut guard = list.locks().suspend_count_lock.lock();
    assert!(!thread.modify_suspend_count(&mut guard, 1, None, SuspendReason::Internal));
    assert_eq!(thread.suspend_count(), 0);
}

#[test]
fn leaving_runnable_passes_active_barriers() {
    let list = thread_list();
    let thread = list.attach("target", false).unwrap();
    thread.transition_from_suspended_to_runnable();

    let barrier = Arc::new(SuspendBarrier::new(1));
    {
        let mut guard = list.locks().suspend_count_lock.lock();
        assert!(thread.modify_suspend_count(&mut guard, 1, Some(&barrier), SuspendReason::Internal));
    }
    assert!(thread.read_flag(ThreadFlags::ACTIVE_SUSPEND_BARRIER));

    thread.transition_from_runnable_to_suspended(ThreadState::Native);
    assert_eq!(barrier.pending(), 0);
    assert!(!thread.read_flag(ThreadFlags::ACTIVE_SUSPEND_BARRIER));
    assert!(thread.is_suspended());

    let mut guard = list.locks().suspend_count_lock.lock();
    assert!(thread.modify_suspend_count(&mut guard, -1, None, SuspendReason::Internal));
}

#[test]
fn full_barrier_slots_retry_until_one_frees() {
    let list = thread_list();
    let thread = list.attach("target", false).unwrap();
    let locks = Arc::clone(list.locks());
    let installed: Vec<Arc<SuspendBarrier>> = (0..MAX_SUSPEND_BARRIERS)
        .map(|_| Arc::new(SuspendBarrier::new(1)))
        .collect();
    {
        let mut guard = locks.suspend_count_lock.lock();
        for barrier in &installed {
            assert!(thread.modify_suspend_count(&mut guard, 1, Some(barrier), SuspendReason::Internal));
        }
    }

    let done = AtomicBool::new(false);
    crossbeam::scope(|s| {
        s.spawn(|_| {
            let extra = Arc::new(SuspendBarrier::new(1));
            let mut guard = locks.suspend_count_lock.lock();
            assert!(thread.modify_suspend_count(&mut guard, 1, Some(&extra), SuspendReason::Internal));
            done.store(true, Ordering::Release);
        });

        std::thread::sleep(Duration::from_millis(5));
        assert!(!done.load(Ordering::Acquire));
        let guard = locks.suspend_count_lock.lock();
        thread.clear_suspend_barrier(&guard, &installed[0]);
    })
    .unwrap();

    assert!(done.load(Ordering::Acquire));
    assert_eq!(thread.suspend_count(), MAX_SUSPEND_BARRIERS as i32 + 1);
    assert!(thread.read_flag(ThreadFlags::ACTIVE_SUSPEND_BARRIER));
}

#[test]
fn check_suspend_parks_until_resumed() {
    let list = thread_list();
    let thread = list.attach("mutator", false).unwrap();
    let locks = list.locks();
    let stop = AtomicBool::new(false);
    let (ready_tx, ready_rx) = flume::bounded(1);

    crossbeam::scope(|s| {
        s.spawn(|_| {
            thread.transition_from_suspended_to_runnable();
            ready_tx.send(()).unwrap();
            while !stop.load(Ordering::Acquire) {
                thread.allow_thread_suspension();
            }
            thread.transition_from_runnable_to_suspended(ThreadState::Native);
        });

        ready_rx.recv().unwrap();
        let barrier = Arc::new(SuspendBarrier::new(1));
        {
            let mut guard = locks.suspend_count_lock.lock();
            assert!(thread.modify_suspend_count(&mut guard, 1, Some(&barrier), SuspendReason::Internal));
        }
        assert!(barrier.wait(Duration::from_secs(10)));
        assert_eq!(thread.state(), ThreadState::Suspended);
        assert_eq!(locks.mutator_lock.shared_holders(), 0);

        stop.store(true, Ordering::Release);
        let mut guard = locks.suspend_count_lock.lock();
        assert!(thread.modify_suspend_count(&mut guard, -1, None, SuspendReason::Internal));
        guard.broadcast_resume();
    })
    .unwrap();

    assert_eq!(thread.state(), ThreadState::Native);
    assert!(thread.safepoint_polls() > 0);
}

#[test]
fn checkpoints_run_in_request_order() {
    let list = thread_list();
    let thread = list.attach("mutator", false).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    thread.transition_from_suspended_to_runnable();
    {
        let guard = list.locks().suspend_count_lock.lock();
        assert!(thread.request_checkpoint(&guard, recording(&log, 1)).is_ok());
        let rejected = thread.request_checkpoint(&guard, recording(&log, 2)).unwrap_err();
        assert!(matches!(rejected, CheckpointRejected::AlreadyPending(_)));
        assert!(thread
            .queue_overflow_checkpoint(&guard, rejected.into_checkpoint())
            .is_ok());
        assert!(thread.queue_overflow_checkpoint(&guard, recording(&log, 3)).is_ok());
    }

    thread.check_suspend();
    assert_eq!(*log.lock(), vec![1, 2, 3]);
    assert!(!thread.read_flag(ThreadFlags::CHECKPOINT_REQUEST));
    thread.transition_from_runnable_to_suspended(ThreadState::Native);
}

#[test]
fn checkpoint_requests_need_a_runnable_target() {
    let list = thread_list();
    let thread = list.attach("native", false).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let guard = list.locks().suspend_count_lock.lock();

    let rejected = thread.request_checkpoint(&guard, recording(&log, 1)).unwrap_err();
    assert!(matches!(rejected, CheckpointRejected::NotRunnable(_)));
    rejected.into_checkpoint()(&thread);
    assert_eq!(*log.lock(), vec![1]);

    assert!(thread.queue_overflow_checkpoint(&guard, recording(&log, 2)).is_err());
    assert!(!thread.request_empty_checkpoint());
}

#[test]
fn leaving_runnable_runs_the_pending_checkpoint() {
    let list = thread_list();
    let thread = list.attach("mutator", false).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    thread.transition_from_suspended_to_runnable();
    {
        let guard = list.locks().suspend_count_lock.lock();
        thread.request_checkpoint(&guard, recording(&log, 7)).unwrap();
    }
    thread.transition_from_runnable_to_suspended(ThreadState::WaitingForGcToComplete);
    assert_eq!(*log.lock(), vec![7]);
    assert_eq!(thread.state(), ThreadState::WaitingForGcToComplete);
}

#[test]
fn empty_checkpoint_passes_the_runtime_barrier() {
    let list = thread_list();
    let thread = list.attach("mutator", false).unwrap();
    let barrier = &list.locks().empty_checkpoint_barrier;
    barrier.init(1);

    thread.transition_from_suspended_to_runnable();
    assert!(thread.request_empty_checkpoint());
    assert!(thread.read_flag(ThreadFlags::EMPTY_CHECKPOINT_REQUEST));
    thread.check_suspend();
    assert!(!thread.read_flag(ThreadFlags::EMPTY_CHECKPOINT_REQUEST));
    assert_eq!(barrier.count(), 0);
    thread.transition_from_runnable_to_suspended(ThreadState::Native);
}

#[test]
fn no_suspension_regions_nest() {
    let list = thread_list();
    let thread = list.attach("mutator", false).unwrap();
    assert!(thread.is_thread_suspension_allowable());
    {
        let _outer = ScopedAssertNoThreadSuspension::new(&thread, "outer");
        {
            let _inner = ScopedAssertNoThreadSuspension::new(&thread, "inner");
            assert!(!thread.is_thread_suspension_allowable());
        }
        assert_eq!(*thread.inner.no_thread_suspension_cause.lock(), Some("outer"));
    }
    assert!(thread.is_thread_suspension_allowable());
    assert_eq!(*thread.inner.no_thread_suspension_cause.lock(), None);
}

#[test]
#[should_panic(expected = "never entered")]
fn releasing_an_unheld_no_suspension_region_panics() {
    let list = thread_list();
    let thread = list.attach("mutator", false).unwrap();
    thread.end_assert_no_thread_suspension(None);
}

#[test]
#[should_panic(expected = "may not be suspended here: holding a raw object")]
fn suspending_inside_a_no_suspension_region_panics() {
    let list = thread_list();
    let thread = list.attach("mutator", false).unwrap();
    thread.transition_from_suspended_to_runnable();
    let _region = ScopedAssertNoThreadSuspension::new(&thread, "holding a raw object");
    thread.transition_from_runnable_to_suspended(ThreadState::Native);
}

#[test]
fn synchronous_checkpoint_on_self_runs_inline() {
    let list = thread_list();
    let thread = list.attach("self", false).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    assert!(thread.request_synchronous_checkpoint(
        Some(&thread),
        list.lock(),
        recording(&log, 1),
        ThreadState::WaitingForCheckpointsToRun,
    ));
    assert_eq!(*log.lock(), vec![1]);
}

#[test]
fn synchronous_checkpoint_runs_on_behalf_of_a_suspended_target() {
    let list = thread_list();
    let target = list.attach("native", false).unwrap();
    let requester = list.attach("requester", false).unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let checkpoint: Checkpoint = {
        let seen = Arc::clone(&seen);
        Arc::new(move |thread: &ManagedThread| {
            assert!(thread.is_suspended());
            seen.store(thread.id() as usize, Ordering::Release);
        })
    };

    assert!(target.request_synchronous_checkpoint(
        Some(&requester),
        list.lock(),
        checkpoint,
        ThreadState::WaitingForCheckpointsToRun,
    ));
    assert_eq!(seen.load(Ordering::Acquire), target.id() as usize);
    assert_eq!(target.suspend_count(), 0);
    assert_eq!(requester.state(), ThreadState::Native);
}

#[test]
fn synchronous_checkpoint_waits_for_a_runnable_target() {
    let list = thread_list();
    let target = list.attach("mutator", false).unwrap();
    let requester = list.attach("requester", false).unwrap();
    let stop = AtomicBool::new(false);
    let (ready_tx, ready_rx) = flume::bounded(1);
    let (ran_tx, ran_rx) = flume::unbounded();

    crossbeam::scope(|s| {
        s.spawn(|_| {
            target.transition_from_suspended_to_runnable();
            ready_tx.send(()).unwrap();
            while !stop.load(Ordering::Acquire) {
                target.allow_thread_suspension();
            }
            target.transition_from_runnable_to_suspended(ThreadState::Native);
        });

        ready_rx.recv().unwrap();
        let checkpoint: Checkpoint = Arc::new(move |thread: &ManagedThread| {
            ran_tx.send(thread.state()).unwrap();
        });
        assert!(target.request_synchronous_checkpoint(
            Some(&requester),
            list.lock(),
            checkpoint,
            ThreadState::WaitingForCheckpointsToRun,
        ));
        assert_eq!(ran_rx.try_recv().unwrap(), ThreadState::Runnable);
        assert_eq!(requester.state(), ThreadState::Native);
        stop.store(true, Ordering::Release);
    })
    .unwrap();
}

#[test]
fn synchronous_checkpoint_on_a_terminated_target_fails() {
    let list = thread_list();
    let target = list.attach("gone", false).unwrap();
    list.detach(&target).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    assert!(!target.request_synchronous_checkpoint(
        None,
        list.lock(),
        recording(&log, 1),
        ThreadState::WaitingForCheckpointsToRun,
    ));
    assert!(log.lock().is_empty());
}

#[test]
fn marking_entrypoints_mark_through_reads() {
    let list = thread_list();
    let thread = list.attach("mutator", false).unwrap();
    let heap = Heap::new(&HeapConfig::default());
    let object = heap.alloc_string("payload").unwrap();

    assert_eq!(thread.read_barrier(&object), object);
    assert!(!object.is_marked());

    thread.set_is_gc_marking_and_update_entrypoints(true);
    assert!(thread.entrypoints().marking);
    assert_eq!(thread.read_barrier(&object), object);
    assert!(object.is_marked());

    thread.set_is_gc_marking_and_update_entrypoints(false);
    assert!(!thread.is_gc_marking());
    assert!(!thread.entrypoints().marking);
}

#[test]
fn stack_roots_can_be_relocated_by_visitors() {
    let list = thread_list();
    let thread = list.attach("mutator", false).unwrap();
    let heap = Heap::new(&HeapConfig::default());
    let old = heap.alloc_string("old").unwrap();
    let new = heap.alloc_string("new").unwrap();
    thread.push_stack_root(old.clone());

    let mut visitor = |root: &mut ObjectRef, info: RootInfo| {
        assert_eq!(info.root_type, RootType::ThreadStack { thread_id: thread.id() });
        if *root == old {
            *root = new.clone();
        }
    };
    thread.visit_roots(&mut visitor, VisitRootFlags::ALL_ROOTS);
    assert_eq!(thread.stack_roots(), vec![new.clone()]);
    assert_eq!(thread.pop_stack_root(), Some(new));
}

#[test]
fn scoped_state_change_restores_previous_state() {
    let list = thread_list();
    let thread = list.attach("mutator", false).unwrap();
    {
        let _runnable = ScopedThreadStateChange::new(&thread, ThreadState::Runnable);
        assert_eq!(thread.state(), ThreadState::Runnable);
        {
            let _waiting = ScopedThreadStateChange::new(&thread, ThreadState::WaitingPerformingGc);
            assert_eq!(thread.state(), ThreadState::WaitingPerformingGc);
            assert_eq!(list.locks().mutator_lock.shared_holders(), 0);
        }
        assert_eq!(list.locks().mutator_lock.shared_holders(), 1);
    }
    assert_eq!(thread.state(), ThreadState::Native);
}

#[test]
fn short_dump_describes_the_thread() {
    let list = thread_list();
    let thread = list.attach("gc-daemon", true).unwrap();
    let dump = thread.short_dump();
    assert!(dump.starts_with("\"gc-daemon\" daemon id=1"));
    assert!(dump.contains("state=Native"));
    assert!(dump.contains("suspend_count=0"));
}
