//! Non-moving mark-sweep over the heap's mark bits.

use std::sync::Arc;

use tracing::trace;

use crate::heap::{Heap, SweepResult};
use crate::object::ObjectRef;

use super::{CollectorHooks, GcType};

/// Marks from the roots, then frees every unmarked object.
///
/// In concurrent mode the mutators run while the mark stack is drained; new
/// objects are allocated black and the final pause rescans every marked
/// object to pick up references stored in the meantime.
pub struct MarkSweep {
    heap: Arc<Heap>,
    mark_stack: Vec<ObjectRef>,
    concurrent: bool,
    objects_marked: u64,
}

impl MarkSweep {
    pub fn new(heap: Arc<Heap>, concurrent: bool) -> Self {
        Self {
            heap,
            mark_stack: Vec::new(),
            concurrent,
            objects_marked: 0,
        }
    }

    /// Objects marked by this collector during the last run.
    pub fn objects_marked(&self) -> u64 {
        self.objects_marked
    }

    fn push_if_newly_marked(&mut self, object: &ObjectRef) {
        if object.try_mark() {
            self.objects_marked += 1;
            self.mark_stack.push(object.clone());
        }
    }
}

impl CollectorHooks for MarkSweep {
    fn name(&self) -> &str {
        if self.concurrent {
            "concurrent mark sweep"
        } else {
            "mark sweep"
        }
    }

    fn gc_type(&self) -> GcType {
        GcType::Full
    }

    fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    fn initialize_phase(&mut self) {
        self.mark_stack.clear();
        self.objects_marked = 0;
        self.heap.clear_marks();
    }

    fn mark_object(&mut self, object: &ObjectRef) -> ObjectRef {
        self.push_if_newly_marked(object);
        object.clone()
    }

    fn process_mark_stack(&mut self) {
        while let Some(object) = self.mark_stack.pop() {
            for field in object.fields() {
                self.push_if_newly_marked(&field);
            }
        }
    }

    fn is_marked(&self, object: &ObjectRef) -> Option<ObjectRef> {
        (object.is_marked() || object.is_pinned()).then(|| object.clone())
    }

    fn remark(&mut self) {
        let marked = self.heap.marked_objects();
        trace!(objects = marked.len(), "rescanning marked objects");
        self.mark_stack.extend(marked);
    }

    fn reclaim_phase(&mut self) -> SweepResult {
        self.heap.sweep()
    }

    fn finish_phase(&mut self) {
        self.mark_stack.clear();
        self.heap.clear_marks();
    }
}
