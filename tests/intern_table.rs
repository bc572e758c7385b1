use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, Sender};
use managed_rt::collector::{CollectorHooks, CollectorPhase, GcCause, GcType, MarkSweep};
use managed_rt::heap::SweepResult;
use managed_rt::object::ObjectRef;
use managed_rt::roots::{RootInfo, RootType, VisitRootFlags};
use managed_rt::{Runtime, RuntimeConfig, WeakRootState};

#[test]
fn weak_then_strong_intern_share_one_instance() {
    let runtime = Runtime::default();
    let first = runtime.attach_thread("first", false).unwrap();
    let second = runtime.attach_thread("second", false).unwrap();
    let table = runtime.intern_table();

    let weak = table.intern_weak_utf8(&first, runtime.heap(), "foo").unwrap();
    let strong = table.intern_strong_utf8(&second, runtime.heap(), "foo").unwrap();

    assert!(weak.ptr_eq(&strong));
    assert_eq!(table.strong_size(), 1);
    assert_eq!(table.weak_size(), 0);
    assert_eq!(table.lookup_strong("foo"), Some(strong));
}

#[test]
fn concurrent_strong_interns_insert_once() {
    let runtime = Runtime::default();
    let table = runtime.intern_table();
    let before = table.strong_size();

    let (sender, receiver) = flume::unbounded();
    crossbeam::scope(|s| {
        for i in 0..8 {
            let runtime = &runtime;
            let sender = sender.clone();
            s.spawn(move |_| {
                let thread = runtime.attach_thread(&format!("interner-{i}"), false).unwrap();
                let canonical = runtime
                    .intern_table()
                    .intern_strong_utf8(&thread, runtime.heap(), "bar")
                    .unwrap();
                sender.send(canonical).unwrap();
                runtime.detach_thread(&thread).unwrap();
            });
        }
    })
    .unwrap();
    drop(sender);

    let results: Vec<ObjectRef> = receiver.iter().collect();
    assert_eq!(results.len(), 8);
    assert!(results.iter().all(|result| result.ptr_eq(&results[0])));
    assert_eq!(table.strong_size(), before + 1);
}

#[test]
fn unreachable_weak_intern_is_gone_after_gc() {
    let runtime = Runtime::default();
    let main = runtime.attach_thread("main", false).unwrap();
    let table = runtime.intern_table();
    table.intern_weak_utf8(&main, runtime.heap(), "x").unwrap();

    let iteration = runtime
        .mark_sweep_collector()
        .run(Some(&main), GcCause::Explicit, false);

    assert!(!iteration.clear_soft_references());
    assert_eq!(table.lookup_weak(&main, "x"), None);
    assert_eq!(table.weak_size(), 0);
}

#[test]
fn only_strong_entries_are_visited_as_roots() {
    let runtime = Runtime::default();
    let main = runtime.attach_thread("main", false).unwrap();
    let table = runtime.intern_table();
    let strong: Vec<ObjectRef> = ["a", "b", "c"]
        .iter()
        .map(|s| table.intern_strong_utf8(&main, runtime.heap(), s).unwrap())
        .collect();
    for weak in ["d", "e"] {
        table.intern_weak_utf8(&main, runtime.heap(), weak).unwrap();
    }

    let mut visited = Vec::new();
    let mut visitor = |root: &mut ObjectRef, info: RootInfo| {
        assert_eq!(info.root_type, RootType::InternedString);
        visited.push(root.clone());
    };
    table.visit_roots(&mut visitor, VisitRootFlags::ALL_ROOTS);

    assert_eq!(visited.len(), strong.len());
    for root in &visited {
        assert!(strong.iter().any(|s| s.ptr_eq(root)));
    }
}

#[test]
fn gated_weak_lookup_never_sees_swept_value() {
    let runtime = Runtime::default();
    let writer = runtime.attach_thread("writer", false).unwrap();
    let reader = runtime.attach_thread("reader", false).unwrap();
    let table = runtime.intern_table();
    let doomed = table.intern_weak_utf8(&writer, runtime.heap(), "doomed").unwrap();

    table.disallow_new_interns();
    let (sender, receiver) = flume::bounded(1);
    crossbeam::scope(|s| {
        s.spawn(|_| {
            sender.send(table.lookup_weak(&reader, "doomed")).unwrap();
        });

        assert!(receiver.recv_timeout(Duration::from_millis(20)).is_err());
        let swept = table.sweep_weaks(&|object: &ObjectRef| {
            (!object.ptr_eq(&doomed)).then(|| object.clone())
        });
        assert_eq!(swept, 1);
        table.allow_new_interns();
        assert_eq!(receiver.recv().unwrap(), None);
    })
    .unwrap();
    assert_eq!(table.weak_root_state(), WeakRootState::Normal);
}

/// Mark sweep that parks in its concurrent mark phase until released.
struct ParkedMark {
    inner: MarkSweep,
    entered: Sender<()>,
    release: Receiver<()>,
    parked: bool,
}

impl CollectorHooks for ParkedMark {
    fn name(&self) -> &str {
        "parked"
    }
    fn gc_type(&self) -> GcType {
        GcType::Full
    }
    fn is_concurrent(&self) -> bool {
        true
    }
    fn initialize_phase(&mut self) {
        self.inner.initialize_phase();
    }
    fn mark_object(&mut self, object: &ObjectRef) -> ObjectRef {
        self.inner.mark_object(object)
    }
    fn process_mark_stack(&mut self) {
        if !self.parked {
            self.parked = true;
            self.entered.send(()).unwrap();
            self.release.recv().unwrap();
        }
        self.inner.process_mark_stack();
    }
    fn is_marked(&self, object: &ObjectRef) -> Option<ObjectRef> {
        self.inner.is_marked(object)
    }
    fn remark(&mut self) {
        self.inner.remark();
    }
    fn reclaim_phase(&mut self) -> SweepResult {
        self.inner.reclaim_phase()
    }
    fn finish_phase(&mut self) {
        self.inner.finish_phase();
    }
}

#[test]
fn weak_lookup_during_concurrent_mark_waits_for_the_sweep() {
    let runtime = Runtime::new(RuntimeConfig::default().with_concurrent_collector(true));
    let gc_thread = runtime.attach_thread("gc", true).unwrap();
    let reader = runtime.attach_thread("reader", false).unwrap();
    let table = runtime.intern_table();
    let kept = table.intern_weak_utf8(&reader, runtime.heap(), "kept").unwrap();
    table.intern_weak_utf8(&reader, runtime.heap(), "lost").unwrap();
    reader.push_stack_root(kept.clone());

    let (entered_tx, entered_rx) = flume::bounded(1);
    let (release_tx, release_rx) = flume::bounded(1);
    let gc = runtime.collector(ParkedMark {
        inner: MarkSweep::new(Arc::clone(runtime.heap()), true),
        entered: entered_tx,
        release: release_rx,
        parked: false,
    });
    let phases = gc.subscribe_phases();

    let (lookup_tx, lookup_rx) = flume::unbounded();
    crossbeam::scope(|s| {
        s.spawn(|_| gc.run(Some(&gc_thread), GcCause::Background, false));

        entered_rx.recv().unwrap();
        assert_eq!(gc.current_phase(), CollectorPhase::ConcurrentMark);
        assert_eq!(table.weak_root_state(), WeakRootState::NoReadsOrWrites);

        s.spawn(|_| {
            for content in ["lost", "kept"] {
                lookup_tx.send(table.lookup_weak(&reader, content)).unwrap();
            }
        });
        assert!(lookup_rx.recv_timeout(Duration::from_millis(20)).is_err());

        release_tx.send(()).unwrap();
        assert_eq!(lookup_rx.recv().unwrap(), None);
        assert_eq!(lookup_rx.recv().unwrap(), Some(kept.clone()));
    })
    .unwrap();

    assert!(phases.try_iter().any(|phase| phase == CollectorPhase::Idle));
    assert_eq!(table.weak_size(), 1);
}

#[test]
fn per_thread_gate_with_read_barrier() {
    let runtime = Runtime::new(RuntimeConfig::default().with_read_barrier(true));
    let reader = runtime.attach_thread("reader", false).unwrap();
    let table = runtime.intern_table();
    let value = table.intern_weak_utf8(&reader, runtime.heap(), "v").unwrap();

    // The table-wide state is ignored in this mode.
    table.disallow_new_interns();
    assert_eq!(table.lookup_weak(&reader, "v"), Some(value.clone()));
    table.allow_new_interns();

    runtime.thread_list().set_weak_ref_access_enabled(false);
    let (sender, receiver) = flume::bounded(1);
    crossbeam::scope(|s| {
        s.spawn(|_| sender.send(table.lookup_weak(&reader, "v")).unwrap());
        assert!(receiver.recv_timeout(Duration::from_millis(20)).is_err());
        runtime.thread_list().set_weak_ref_access_enabled(true);
        table.broadcast_for_new_interns();
        assert_eq!(receiver.recv().unwrap(), Some(value.clone()));
    })
    .unwrap();
}

#[test]
fn snapshot_round_trips_into_a_fresh_runtime() {
    let source = Runtime::default();
    let main = source.attach_thread("main", false).unwrap();
    for s in ["alpha", "beta", "gamma"] {
        source.intern_table().intern_strong_utf8(&main, source.heap(), s).unwrap();
    }
    source.intern_table().intern_weak_utf8(&main, source.heap(), "weak").unwrap();
    let image = source.intern_table().write_to_memory();

    let target = Runtime::default();
    let thread = target.attach_thread("main", false).unwrap();
    let read = target
        .intern_table()
        .add_table_from_memory(target.heap(), &image)
        .unwrap();
    assert_eq!(read, image.len());
    assert_eq!(target.intern_table().strong_size(), 3);
    assert_eq!(target.intern_table().lookup_weak(&thread, "weak"), None);

    let beta = target.intern_table().lookup_strong("beta").unwrap();
    assert!(beta.is_pinned());
    let again = target
        .intern_table()
        .intern_strong_utf8(&thread, target.heap(), "beta")
        .unwrap();
    assert!(again.ptr_eq(&beta));

    // Snapshot strings survive collection without any other root.
    target.mark_sweep_collector().run(Some(&thread), GcCause::Explicit, false);
    assert!(target.heap().contains(&beta));
    assert_eq!(
        target.intern_table().dump_for_sig_quit(),
        "Intern table: 3 strong; 0 weak\n"
    );
}
