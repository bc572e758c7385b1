//! Strong and weak string interning.
//!
//! The table keeps two sets of canonical strings. Strong entries are GC roots;
//! weak entries survive only while something else keeps them alive, and are
//! dropped by [`InternTable::sweep_weaks`]. A string lives in at most one of
//! the two sets, and each distinct content has at most one canonical instance.
//!
//! ## Weak root gating
//!
//! Between the point where the collector decides liveness and the point where
//! it has swept the weak set, mutators must not read or insert weak entries:
//! they could resurrect a string that is already considered dead. During that
//! window the table is in [`WeakRootState::NoReadsOrWrites`] and any access
//! that needs the weak set blocks until the collector switches back to
//! [`WeakRootState::Normal`].
//!
//! With `use_read_barrier` the gate is per thread instead: a thread may touch
//! the weak set only while its own weak-reference access flag is enabled.
//!
//! All mutation happens under one table-wide lock.

mod snapshot;
mod table;

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::config::InternConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::heap::Heap;
use crate::object::ObjectRef;
use crate::roots::{IsMarkedVisitor, RootInfo, RootType, RootVisitor, VisitRootFlags};
use crate::thread::{ManagedThread, ScopedThreadStateChange, ThreadState};

use table::{Table, UnorderedSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeakRootState {
    /// Weak entries can be read and inserted.
    Normal,
    /// Weak liveness is being decided; weak access blocks.
    NoReadsOrWrites,
}

/// Records intern table changes so an aborted transaction can undo them.
pub trait TransactionLog: Send + Sync {
    fn record_strong_string_insertion(&self, string: &ObjectRef);
    fn record_weak_string_insertion(&self, string: &ObjectRef);
    fn record_strong_string_removal(&self, string: &ObjectRef);
    fn record_weak_string_removal(&self, string: &ObjectRef);
}

struct InternTableInner {
    strong_interns: Table,
    weak_interns: Table,
    new_strong_intern_roots: Vec<ObjectRef>,
    log_new_roots: bool,
    weak_root_state: WeakRootState,
    transaction: Option<Arc<dyn TransactionLog>>,
}

impl InternTableInner {
    fn insert_strong(&mut self, string: ObjectRef) -> RuntimeResult<ObjectRef> {
        self.strong_interns.insert(string.clone())?;
        if let Some(log) = &self.transaction {
            log.record_strong_string_insertion(&string);
        }
        if self.log_new_roots {
            self.new_strong_intern_roots.push(string.clone());
        }
        Ok(string)
    }

    fn insert_weak(&mut self, string: ObjectRef) -> RuntimeResult<ObjectRef> {
        self.weak_interns.insert(string.clone())?;
        if let Some(log) = &self.transaction {
            log.record_weak_string_insertion(&string);
        }
        Ok(string)
    }

    /// Moves `weak` into the strong set. Nothing changes if the strong set
    /// cannot make room for it.
    fn promote(&mut self, weak: ObjectRef) -> RuntimeResult<ObjectRef> {
        self.strong_interns.reserve_for(&weak)?;
        self.remove_weak(&weak);
        self.insert_strong(weak)
    }

    fn remove_strong(&mut self, string: &ObjectRef) {
        if let Some(log) = &self.transaction {
            log.record_strong_string_removal(string);
        }
        self.strong_interns.remove(string);
    }

    fn remove_weak(&mut self, string: &ObjectRef) {
        if let Some(log) = &self.transaction {
            log.record_weak_string_removal(string);
        }
        self.weak_interns.remove(string);
    }

    fn contains_content(&self, content: &str) -> bool {
        self.strong_interns.find(content).is_some() || self.weak_interns.find(content).is_some()
    }
}

pub struct InternTable {
    inner: Mutex<InternTableInner>,
    weak_intern_condition: Condvar,
    use_read_barrier: bool,
}

impl InternTable {
    pub fn new(config: &InternConfig) -> Self {
        Self {
            inner: Mutex::new(InternTableInner {
                strong_interns: Table::new(config.initial_capacity),
                weak_interns: Table::new(config.initial_capacity),
                new_strong_intern_roots: Vec::new(),
                log_new_roots: false,
                weak_root_state: WeakRootState::Normal,
                transaction: None,
            }),
            weak_intern_condition: Condvar::new(),
            use_read_barrier: config.use_read_barrier,
        }
    }

    pub fn lookup_strong(&self, content: &str) -> Option<ObjectRef> {
        self.inner.lock().strong_interns.find(content)
    }

    /// Looks `content` up in the weak set, waiting while weak access is gated.
    pub fn lookup_weak(&self, thread: &ManagedThread, content: &str) -> Option<ObjectRef> {
        let mut inner = self.inner.lock();
        self.wait_until_accessible(thread, &mut inner);
        inner.weak_interns.find(content)
    }

    /// Returns the canonical instance for `string`'s content, making `string`
    /// itself canonical and strong if there is none yet. A weak canonical
    /// instance is promoted to the strong set.
    pub fn intern_strong(&self, thread: &ManagedThread, string: ObjectRef) -> RuntimeResult<ObjectRef> {
        self.insert(thread, string, true)
    }

    /// Like [`InternTable::intern_strong`], but new entries go to the weak set
    /// and existing entries stay where they are.
    pub fn intern_weak(&self, thread: &ManagedThread, string: ObjectRef) -> RuntimeResult<ObjectRef> {
        self.insert(thread, string, false)
    }

    /// Interns `content`, allocating a string only when it is not interned yet.
    pub fn intern_strong_utf8(
        &self,
        thread: &ManagedThread,
        heap: &Heap,
        content: &str,
    ) -> RuntimeResult<ObjectRef> {
        if let Some(strong) = self.lookup_strong(content) {
            return Ok(strong);
        }
        let string = heap.alloc_string(content)?;
        self.intern_strong(thread, string)
    }

    pub fn intern_weak_utf8(
        &self,
        thread: &ManagedThread,
        heap: &Heap,
        content: &str,
    ) -> RuntimeResult<ObjectRef> {
        {
            let mut inner = self.inner.lock();
            if let Some(strong) = inner.strong_interns.find(content) {
                return Ok(strong);
            }
            self.wait_until_accessible(thread, &mut inner);
            if let Some(weak) = inner.weak_interns.find(content) {
                return Ok(weak);
            }
        }
        let string = heap.alloc_string(content)?;
        self.intern_weak(thread, string)
    }

    fn insert(&self, thread: &ManagedThread, string: ObjectRef, is_strong: bool) -> RuntimeResult<ObjectRef> {
        assert!(string.is_string(), "only strings can be interned: {string:?}");
        let mut inner = self.inner.lock();
        if let Some(strong) = inner.strong_interns.find_equal(&string) {
            return Ok(strong);
        }
        if !self.is_weak_access_allowed(thread, &inner) {
            self.wait_until_accessible(thread, &mut inner);
            // The strong set may have changed while the lock was released.
            if let Some(strong) = inner.strong_interns.find_equal(&string) {
                return Ok(strong);
            }
        }
        if let Some(weak) = inner.weak_interns.find_equal(&string) {
            if is_strong {
                return inner.promote(weak);
            }
            return Ok(weak);
        }
        if is_strong {
            inner.insert_strong(string)
        } else {
            inner.insert_weak(string)
        }
    }

    fn is_weak_access_allowed(&self, thread: &ManagedThread, inner: &InternTableInner) -> bool {
        if self.use_read_barrier {
            thread.weak_ref_access_enabled()
        } else {
            inner.weak_root_state == WeakRootState::Normal
        }
    }

    /// Blocks until weak access is allowed for `thread`. The table lock is
    /// released while waiting and the thread sits in
    /// [`ThreadState::WaitingWeakGcRootRead`], so a suspend-all can proceed.
    fn wait_until_accessible(&self, thread: &ManagedThread, inner: &mut MutexGuard<'_, InternTableInner>) {
        while !self.is_weak_access_allowed(thread, inner) {
            if !thread.is_thread_suspension_allowable() {
                panic!(
                    "thread {} waited for weak intern access inside a no-suspension region",
                    thread.id()
                );
            }
            MutexGuard::unlocked(inner, || {
                let _waiting = ScopedThreadStateChange::new(thread, ThreadState::WaitingWeakGcRootRead);
                let mut relocked = self.inner.lock();
                while !self.is_weak_access_allowed(thread, &relocked) {
                    self.weak_intern_condition.wait(&mut relocked);
                }
            });
        }
    }

    /// Removes weak entries the collector found dead and updates moved ones.
    pub fn sweep_weaks(&self, visitor: &dyn IsMarkedVisitor) -> usize {
        let removed = self.inner.lock().weak_interns.sweep_weaks(visitor);
        debug!(removed, "swept weak interns");
        removed
    }

    pub fn weak_root_state(&self) -> WeakRootState {
        self.inner.lock().weak_root_state
    }

    pub fn change_weak_root_state(&self, new_state: WeakRootState) {
        let mut inner = self.inner.lock();
        inner.weak_root_state = new_state;
        if new_state == WeakRootState::Normal {
            self.weak_intern_condition.notify_all();
        }
    }

    pub fn allow_new_interns(&self) {
        self.change_weak_root_state(WeakRootState::Normal);
    }

    pub fn disallow_new_interns(&self) {
        self.change_weak_root_state(WeakRootState::NoReadsOrWrites);
    }

    /// Wakes waiters after per-thread weak access has been re-enabled.
    pub fn broadcast_for_new_interns(&self) {
        let _inner = self.inner.lock();
        self.weak_intern_condition.notify_all();
    }

    /// Visits strong entries as roots. Weak entries are never roots.
    ///
    /// With [`VisitRootFlags::NEW_ROOTS`] only strong entries logged since
    /// logging started are visited; a relocated logged root is re-keyed in
    /// the strong set.
    pub fn visit_roots(&self, visitor: &mut dyn RootVisitor, flags: VisitRootFlags) {
        let mut inner = self.inner.lock();
        if flags.contains(VisitRootFlags::ALL_ROOTS) {
            inner.strong_interns.visit_roots(visitor);
        } else if flags.contains(VisitRootFlags::NEW_ROOTS) {
            let info = RootInfo::new(RootType::InternedString);
            let mut logged = std::mem::take(&mut inner.new_strong_intern_roots);
            for root in &mut logged {
                let old = root.clone();
                visitor.visit_root(root, info);
                if !root.ptr_eq(&old) {
                    inner.strong_interns.remove(&old);
                    if let Err(err) = inner.strong_interns.insert(root.clone()) {
                        panic!("re-inserting relocated intern root failed: {err}");
                    }
                }
            }
            inner.new_strong_intern_roots = logged;
        }
        if flags.contains(VisitRootFlags::CLEAR_ROOT_LOG) {
            inner.new_strong_intern_roots.clear();
        }
        if flags.contains(VisitRootFlags::START_LOGGING_NEW_ROOTS) {
            inner.log_new_roots = true;
        } else if flags.contains(VisitRootFlags::STOP_LOGGING_NEW_ROOTS) {
            inner.log_new_roots = false;
        }
    }

    pub fn set_transaction(&self, transaction: Option<Arc<dyn TransactionLog>>) {
        self.inner.lock().transaction = transaction;
    }

    fn rollback(&self) -> MutexGuard<'_, InternTableInner> {
        let inner = self.inner.lock();
        assert!(
            inner.transaction.is_none(),
            "intern table rollback while a transaction is active"
        );
        inner
    }

    pub fn insert_strong_from_transaction(&self, string: ObjectRef) -> RuntimeResult<ObjectRef> {
        self.rollback().insert_strong(string)
    }

    pub fn insert_weak_from_transaction(&self, string: ObjectRef) -> RuntimeResult<ObjectRef> {
        self.rollback().insert_weak(string)
    }

    pub fn remove_strong_from_transaction(&self, string: &ObjectRef) {
        self.rollback().remove_strong(string);
    }

    pub fn remove_weak_from_transaction(&self, string: &ObjectRef) {
        self.rollback().remove_weak(string);
    }

    /// Moves every weak entry to the strong set.
    pub fn promote_weak_to_strong(&self) -> RuntimeResult<usize> {
        let mut inner = self.inner.lock();
        let weak = inner.weak_interns.entries();
        let promoted = weak.len();
        for string in weak {
            debug_assert!(inner.strong_interns.find_equal(&string).is_none());
            inner.promote(string)?;
        }
        Ok(promoted)
    }

    pub fn strong_size(&self) -> usize {
        self.inner.lock().strong_interns.size()
    }

    pub fn weak_size(&self) -> usize {
        self.inner.lock().weak_interns.size()
    }

    pub fn size(&self) -> usize {
        let inner = self.inner.lock();
        inner.strong_interns.size() + inner.weak_interns.size()
    }

    pub fn dump_for_sig_quit(&self) -> String {
        let inner = self.inner.lock();
        format!(
            "Intern table: {} strong; {} weak\n",
            inner.strong_interns.size(),
            inner.weak_interns.size()
        )
    }

    /// Loads a strong snapshot written by [`InternTable::write_to_memory`].
    ///
    /// The strings are allocated pinned and the set is placed, read-only, in
    /// front of the strong chain. Returns the number of bytes consumed.
    pub fn add_table_from_memory(&self, heap: &Heap, bytes: &[u8]) -> RuntimeResult<usize> {
        let (entries, read) = snapshot::decode(bytes)?;
        let mut inner = self.inner.lock();

        let mut seen = FxHashSet::default();
        for entry in &entries {
            if inner.contains_content(&entry.content) || !seen.insert(entry.content.as_str()) {
                return Err(RuntimeError::DuplicateInternEntry(entry.content.clone()));
            }
        }
        let mut strings = Vec::with_capacity(entries.len());
        let loaded = entries
            .iter()
            .try_for_each(|entry| -> RuntimeResult<()> {
                let string = heap.alloc_pinned_string(&entry.content)?;
                debug_assert_eq!(string.string_hash(), Some(entry.hash));
                strings.push(string);
                Ok(())
            })
            .and_then(|()| UnorderedSet::read_only(strings.clone()));
        let set = match loaded {
            Ok(set) => set,
            Err(error) => {
                // Pinned strings are never swept; hand them back now.
                for string in &strings {
                    heap.free(string);
                }
                return Err(error);
            }
        };

        let count = set.len();
        inner.strong_interns.add_read_only(set);
        debug!(entries = count, bytes = read, "loaded intern table snapshot");
        Ok(read)
    }

    /// Serializes every strong entry.
    pub fn write_to_memory(&self) -> Vec<u8> {
        snapshot::encode(&self.inner.lock().strong_interns.entries())
    }
}

impl fmt::Debug for InternTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("InternTable")
            .field("strong", &inner.strong_interns.size())
            .field("weak", &inner.weak_interns.size())
            .field("weak_root_state", &inner.weak_root_state)
            .field("use_read_barrier", &self.use_read_barrier)
            .finish()
    }
}
