use criterion::{Criterion, criterion_group, criterion_main};
use managed_rt::thread::{Checkpoint, SuspendReason};
use managed_rt::{ManagedThread, Runtime, ScopedSuspendAll, ThreadState};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

/// Spawns `count` mutators that poll for suspension until dropped.
struct Mutators {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Mutators {
    fn spawn(runtime: &Runtime, count: usize) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let handles = (0..count)
            .map(|i| {
                let thread = runtime.attach_thread(&format!("mutator-{i}"), false).unwrap();
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    thread.transition_from_suspended_to_runnable();
                    while !stop.load(Ordering::Acquire) {
                        thread.allow_thread_suspension();
                        std::hint::spin_loop();
                    }
                    thread.transition_from_runnable_to_suspended(ThreadState::Native);
                })
            })
            .collect();
        Self { stop, handles }
    }
}

impl Drop for Mutators {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            handle.join().unwrap();
        }
    }
}

fn bench_state_transitions(c: &mut Criterion) {
    let runtime = Runtime::default();
    let thread = runtime.attach_thread("bench", false).unwrap();

    c.bench_function("runnable_round_trip", |b| {
        b.iter(|| {
            thread.transition_from_suspended_to_runnable();
            thread.transition_from_runnable_to_suspended(ThreadState::Native);
        });
    });

    thread.transition_from_suspended_to_runnable();
    c.bench_function("safepoint_poll_fast_path", |b| {
        b.iter(|| thread.allow_thread_suspension());
    });
    thread.transition_from_runnable_to_suspended(ThreadState::Native);
}

fn bench_suspend_all(c: &mut Criterion) {
    let runtime = Runtime::default();
    let _mutators = Mutators::spawn(&runtime, 4);
    let coordinator = runtime.suspend_coordinator();

    c.bench_function("suspend_all_4_spinning", |b| {
        b.iter(|| {
            let _pause = ScopedSuspendAll::new(coordinator, None, "bench", false);
            std::hint::black_box(runtime.locks().mutator_lock.exclusive_owner());
        });
    });
}

fn bench_suspend_single_thread(c: &mut Criterion) {
    let runtime = Runtime::default();
    let mutators = Mutators::spawn(&runtime, 1);
    let target: ManagedThread = runtime.thread_list().snapshot().remove(0);
    let coordinator = runtime.suspend_coordinator();

    c.bench_function("suspend_and_resume_one", |b| {
        b.iter(|| {
            let thread = coordinator
                .suspend_thread_by_id(None, target.id(), SuspendReason::Internal)
                .unwrap();
            coordinator.resume(&thread, SuspendReason::Internal).unwrap();
        });
    });
    drop(mutators);
}

fn bench_checkpoints(c: &mut Criterion) {
    let runtime = Runtime::default();
    let _mutators = Mutators::spawn(&runtime, 4);
    let coordinator = runtime.suspend_coordinator();
    let checkpoint: Checkpoint = Arc::new(|thread: &ManagedThread| {
        std::hint::black_box(thread.id());
    });

    c.bench_function("run_checkpoint_4_spinning", |b| {
        b.iter(|| coordinator.run_checkpoint(None, Arc::clone(&checkpoint), None));
    });

    c.bench_function("empty_checkpoint_4_spinning", |b| {
        b.iter(|| coordinator.run_empty_checkpoint(None));
    });
}

criterion_group!(
    benches,
    bench_state_transitions,
    bench_suspend_all,
    bench_suspend_single_thread,
    bench_checkpoints
);
criterion_main!(benches);
