//! Heap collaborator used by the collector and the intern table.
//!
//! The heap tracks every allocated [`ObjectRef`] in two object sets (regular
//! and large), accounts bytes against a fixed capacity and implements the
//! mark-bit sweep. Allocation strategy is intentionally trivial.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::config::HeapConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::object::{OBJECT_HEADER_SIZE, ObjectFlags, ObjectRef};

/// Object and byte counts, as recorded for freed memory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ObjectBytePair {
    pub objects: u64,
    pub bytes: i64,
}

impl ObjectBytePair {
    pub fn new(objects: u64, bytes: i64) -> Self {
        Self { objects, bytes }
    }

    pub fn add(&mut self, other: ObjectBytePair) {
        self.objects += other.objects;
        self.bytes += other.bytes;
    }
}

/// Result of sweeping both object sets.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepResult {
    pub regular: ObjectBytePair,
    pub large: ObjectBytePair,
}

/// Managed heap with mark-bit based reclamation.
///
/// # Examples
///
/// ```
/// use managed_rt::config::HeapConfig;
/// use managed_rt::heap::Heap;
///
/// let heap = Heap::new(&HeapConfig::default());
/// let s = heap.alloc_string("hello").unwrap();
/// assert_eq!(s.as_str(), Some("hello"));
/// assert!(heap.contains(&s));
///
/// // Nothing is marked, so the sweep frees it.
/// let freed = heap.sweep();
/// assert_eq!(freed.regular.objects, 1);
/// assert!(!heap.contains(&s));
/// ```
pub struct Heap {
    objects: RwLock<Vec<ObjectRef>>,
    large_objects: RwLock<Vec<ObjectRef>>,
    bytes_allocated: AtomicUsize,
    objects_allocated: AtomicUsize,
    capacity: usize,
    large_object_threshold: usize,
    allocation_black: AtomicBool,
    collection: Mutex<()>,
}

impl Heap {
    pub fn new(config: &HeapConfig) -> Self {
        Self {
            objects: RwLock::new(Vec::new()),
            large_objects: RwLock::new(Vec::new()),
            bytes_allocated: AtomicUsize::new(0),
            objects_allocated: AtomicUsize::new(0),
            capacity: config.capacity,
            large_object_threshold: config.large_object_threshold,
            allocation_black: AtomicBool::new(false),
            collection: Mutex::new(()),
        }
    }

    pub fn alloc_string(&self, content: &str) -> RuntimeResult<ObjectRef> {
        let size = OBJECT_HEADER_SIZE + content.len();
        let flags = self.reserve(size)?;
        Ok(self.track(ObjectRef::new_string(content, flags)))
    }

    /// Allocates a string that the sweep never frees.
    pub fn alloc_pinned_string(&self, content: &str) -> RuntimeResult<ObjectRef> {
        let size = OBJECT_HEADER_SIZE + content.len();
        let flags = self.reserve(size)? | ObjectFlags::PINNED;
        Ok(self.track(ObjectRef::new_string(content, flags)))
    }

    pub fn alloc_object(&self, size: usize, fields: Vec<ObjectRef>) -> RuntimeResult<ObjectRef> {
        let size = size.max(OBJECT_HEADER_SIZE);
        let flags = self.reserve(size)?;
        Ok(self.track(ObjectRef::new_data(size, fields, flags)))
    }

    fn reserve(&self, size: usize) -> RuntimeResult<ObjectFlags> {
        let capacity = self.capacity;
        self.bytes_allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|total| *total <= capacity)
            })
            .map_err(|used| RuntimeError::AllocationFailed {
                requested: size,
                available: capacity.saturating_sub(used),
            })?;
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);

        let mut flags = ObjectFlags::empty();
        if size >= self.large_object_threshold {
            flags |= ObjectFlags::LARGE;
        }
        if self.allocation_black.load(Ordering::Acquire) {
            flags |= ObjectFlags::MARKED;
        }
        Ok(flags)
    }

    fn track(&self, object: ObjectRef) -> ObjectRef {
        if object.is_large() {
            self.large_objects.write().push(object.clone());
        } else {
            self.objects.write().push(object.clone());
        }
        object
    }

    /// Held for a whole collection; mark bits are shared by every collector
    /// working on this heap.
    pub fn lock_collection(&self) -> MutexGuard<'_, ()> {
        self.collection.lock()
    }

    /// While set, new objects are born marked so concurrent marking cannot miss them.
    pub fn set_allocation_black(&self, black: bool) {
        self.allocation_black.store(black, Ordering::Release);
    }

    pub fn is_allocation_black(&self) -> bool {
        self.allocation_black.load(Ordering::Acquire)
    }

    pub fn contains(&self, object: &ObjectRef) -> bool {
        let set = if object.is_large() {
            &self.large_objects
        } else {
            &self.objects
        };
        set.read().iter().any(|candidate| candidate.ptr_eq(object))
    }

    pub fn live_objects(&self) -> Vec<ObjectRef> {
        let mut all = self.objects.read().clone();
        all.extend(self.large_objects.read().iter().cloned());
        all
    }

    pub fn marked_objects(&self) -> Vec<ObjectRef> {
        self.live_objects()
            .into_iter()
            .filter(ObjectRef::is_marked)
            .collect()
    }

    /// Frees every unmarked, unpinned object from both sets.
    pub fn sweep(&self) -> SweepResult {
        SweepResult {
            regular: self.sweep_set(&self.objects),
            large: self.sweep_set(&self.large_objects),
        }
    }

    fn sweep_set(&self, set: &RwLock<Vec<ObjectRef>>) -> ObjectBytePair {
        let mut freed = ObjectBytePair::default();
        let mut objects = set.write();
        objects.retain(|object| {
            if object.is_marked() || object.is_pinned() {
                return true;
            }
            freed.objects += 1;
            freed.bytes += object.size() as i64;
            // Dead objects may still be referenced from other dead objects.
            object.clear_fields();
            false
        });
        drop(objects);

        self.bytes_allocated
            .fetch_sub(freed.bytes as usize, Ordering::AcqRel);
        self.objects_allocated
            .fetch_sub(freed.objects as usize, Ordering::Relaxed);
        freed
    }

    /// Releases `object` immediately, pinned or not. Returns `false` if the
    /// heap does not hold it.
    pub fn free(&self, object: &ObjectRef) -> bool {
        let set = if object.is_large() {
            &self.large_objects
        } else {
            &self.objects
        };
        let mut objects = set.write();
        let Some(index) = objects.iter().position(|candidate| candidate.ptr_eq(object)) else {
            return false;
        };
        objects.swap_remove(index);
        drop(objects);

        object.clear_fields();
        self.bytes_allocated.fetch_sub(object.size(), Ordering::AcqRel);
        self.objects_allocated.fetch_sub(1, Ordering::Relaxed);
        true
    }

    pub fn clear_marks(&self) {
        for object in self.objects.read().iter() {
            object.clear_mark();
        }
        for object in self.large_objects.read().iter() {
            object.clear_mark();
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Acquire)
    }

    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
