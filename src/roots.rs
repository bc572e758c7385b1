//! Root visiting interfaces shared by threads, the intern table and the collector.

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::object::ObjectRef;

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VisitRootFlags: u8 {
        /// Visit every root.
        const ALL_ROOTS = 0x1;
        /// Visit only roots logged since logging started.
        const NEW_ROOTS = 0x2;
        const START_LOGGING_NEW_ROOTS = 0x4;
        const STOP_LOGGING_NEW_ROOTS = 0x8;
        const CLEAR_ROOT_LOG = 0x10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootType {
    ThreadStack { thread_id: u32 },
    InternedString,
    Global,
}

/// Where a visited root came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootInfo {
    pub root_type: RootType,
}

impl RootInfo {
    pub fn new(root_type: RootType) -> Self {
        Self { root_type }
    }
}

/// Receives roots. Overwriting `root` relocates it.
pub trait RootVisitor {
    fn visit_root(&mut self, root: &mut ObjectRef, info: RootInfo);
}

impl<F> RootVisitor for F
where
    F: FnMut(&mut ObjectRef, RootInfo),
{
    fn visit_root(&mut self, root: &mut ObjectRef, info: RootInfo) {
        self(root, info)
    }
}

/// Liveness oracle: `None` if `obj` is dead, otherwise its current location.
pub trait IsMarkedVisitor {
    fn is_marked(&self, obj: &ObjectRef) -> Option<ObjectRef>;
}

impl<F> IsMarkedVisitor for F
where
    F: Fn(&ObjectRef) -> Option<ObjectRef>,
{
    fn is_marked(&self, obj: &ObjectRef) -> Option<ObjectRef> {
        self(obj)
    }
}

/// Roots held outside any thread, such as runtime-wide handles.
#[derive(Debug, Default)]
pub struct GlobalRoots {
    handles: Mutex<Vec<ObjectRef>>,
}

impl GlobalRoots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, object: ObjectRef) {
        self.handles.lock().push(object);
    }

    /// Removes one registration of `object`; returns `false` if none existed.
    pub fn unregister(&self, object: &ObjectRef) -> bool {
        let mut handles = self.handles.lock();
        match handles.iter().position(|handle| handle == object) {
            Some(index) => {
                handles.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    pub fn visit_roots(&self, visitor: &mut dyn RootVisitor) {
        let info = RootInfo::new(RootType::Global);
        for handle in self.handles.lock().iter_mut() {
            visitor.visit_root(handle, info);
        }
    }
}
