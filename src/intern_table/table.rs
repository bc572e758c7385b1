//! Chained hash tables backing the strong and weak intern sets.

use std::mem;

use rustc_hash::FxHashMap;

use crate::error::{RuntimeError, RuntimeResult};
use crate::object::{ObjectRef, compute_string_hash};
use crate::roots::{IsMarkedVisitor, RootInfo, RootType, RootVisitor};

fn content_of(object: &ObjectRef) -> &str {
    match object.as_str() {
        Some(content) => content,
        None => panic!("non-string object {object:?} in the intern table"),
    }
}

fn hash_of(object: &ObjectRef) -> u32 {
    object
        .string_hash()
        .unwrap_or_else(|| compute_string_hash(content_of(object)))
}

fn allocation_failed<E>(_: E) -> RuntimeError {
    RuntimeError::AllocationFailed {
        requested: mem::size_of::<ObjectRef>(),
        available: 0,
    }
}

/// One hash set of interned strings, bucketed by content hash.
#[derive(Default)]
pub(crate) struct UnorderedSet {
    buckets: FxHashMap<u32, Vec<ObjectRef>>,
    len: usize,
    read_only: bool,
}

impl UnorderedSet {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            buckets: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            len: 0,
            read_only: false,
        }
    }

    /// Builds an immutable set, as loaded from a snapshot.
    pub(crate) fn read_only(entries: Vec<ObjectRef>) -> RuntimeResult<Self> {
        let mut set = Self::with_capacity(entries.len());
        for entry in entries {
            set.insert(entry)?;
        }
        set.read_only = true;
        Ok(set)
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn find(&self, hash: u32, content: &str) -> Option<&ObjectRef> {
        self.buckets
            .get(&hash)?
            .iter()
            .find(|candidate| candidate.as_str() == Some(content))
    }

    /// Makes room so that inserting `object` next cannot fail.
    fn reserve_for(&mut self, object: &ObjectRef) -> RuntimeResult<()> {
        let hash = hash_of(object);
        self.buckets.try_reserve(1).map_err(allocation_failed)?;
        let bucket = self.buckets.entry(hash).or_default();
        let reserved = bucket.try_reserve(1).map_err(allocation_failed);
        if reserved.is_err() && bucket.is_empty() {
            self.buckets.remove(&hash);
        }
        reserved
    }

    fn insert(&mut self, object: ObjectRef) -> RuntimeResult<()> {
        assert!(!self.read_only, "insert into a read-only intern table");
        self.reserve_for(&object)?;
        self.buckets.entry(hash_of(&object)).or_default().push(object);
        self.len += 1;
        Ok(())
    }

    fn remove(&mut self, object: &ObjectRef) -> bool {
        let hash = hash_of(object);
        let Some(bucket) = self.buckets.get_mut(&hash) else {
            return false;
        };
        let Some(index) = bucket.iter().position(|candidate| candidate.ptr_eq(object)) else {
            return false;
        };
        assert!(!self.read_only, "remove from a read-only intern table");
        bucket.swap_remove(index);
        if bucket.is_empty() {
            self.buckets.remove(&hash);
        }
        self.len -= 1;
        true
    }

    fn iter(&self) -> impl Iterator<Item = &ObjectRef> {
        self.buckets.values().flatten()
    }
}

/// A chain of sets: read-only snapshot sets first, the mutable set last.
pub(crate) struct Table {
    tables: Vec<UnorderedSet>,
}

impl Table {
    pub(crate) fn new(initial_capacity: usize) -> Self {
        Self {
            tables: vec![UnorderedSet::with_capacity(initial_capacity)],
        }
    }

    pub(crate) fn find(&self, content: &str) -> Option<ObjectRef> {
        let hash = compute_string_hash(content);
        self.tables
            .iter()
            .find_map(|table| table.find(hash, content))
            .cloned()
    }

    /// Finds the entry with the same content as `object`.
    pub(crate) fn find_equal(&self, object: &ObjectRef) -> Option<ObjectRef> {
        let content = content_of(object);
        let hash = hash_of(object);
        self.tables
            .iter()
            .find_map(|table| table.find(hash, content))
            .cloned()
    }

    pub(crate) fn insert(&mut self, object: ObjectRef) -> RuntimeResult<()> {
        self.mutable_set().insert(object)
    }

    /// Makes room in the mutable set so that inserting `object` next cannot fail.
    pub(crate) fn reserve_for(&mut self, object: &ObjectRef) -> RuntimeResult<()> {
        self.mutable_set().reserve_for(object)
    }

    fn mutable_set(&mut self) -> &mut UnorderedSet {
        if self.tables.last().is_none_or(UnorderedSet::is_read_only) {
            self.tables.push(UnorderedSet::default());
        }
        let last = self.tables.len() - 1;
        &mut self.tables[last]
    }

    /// Removes `object` by identity. Removing a string that is not interned
    /// is a caller bug.
    pub(crate) fn remove(&mut self, object: &ObjectRef) {
        if !self.tables.iter_mut().any(|table| table.remove(object)) {
            panic!("attempted to remove non-interned string {object:?}");
        }
    }

    /// Puts a read-only set in front of the chain.
    pub(crate) fn add_read_only(&mut self, set: UnorderedSet) {
        debug_assert!(set.is_read_only());
        self.tables.insert(0, set);
    }

    pub(crate) fn size(&self) -> usize {
        self.tables.iter().map(UnorderedSet::len).sum()
    }

    pub(crate) fn entries(&self) -> Vec<ObjectRef> {
        self.tables
            .iter()
            .flat_map(UnorderedSet::iter)
            .cloned()
            .collect()
    }

    /// Reports every entry as an interned-string root. A visitor that
    /// replaces an entry relocates it; the content, and so the bucket, stays.
    pub(crate) fn visit_roots(&mut self, visitor: &mut dyn RootVisitor) {
        let info = RootInfo::new(RootType::InternedString);
        for table in &mut self.tables {
            for entry in table.buckets.values_mut().flatten() {
                visitor.visit_root(entry, info);
            }
        }
    }

    /// Drops entries the visitor reports dead and updates moved ones.
    /// Returns the number of entries removed.
    pub(crate) fn sweep_weaks(&mut self, visitor: &dyn IsMarkedVisitor) -> usize {
        let mut removed = 0;
        for table in self.tables.iter_mut().filter(|table| !table.is_read_only()) {
            table.buckets.retain(|_, bucket| {
                bucket.retain_mut(|entry| match visitor.is_marked(entry) {
                    Some(moved) => {
                        *entry = moved;
                        true
                    }
                    None => {
                        removed += 1;
                        false
                    }
                });
                !bucket.is_empty()
            });
            table.len = table.buckets.values().map(Vec::len).sum();
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectFlags;

    fn string(content: &str) -> ObjectRef {
        ObjectRef::new_string(content, ObjectFlags::empty())
    }

    #[test]
    fn colliding_hashes_share_a_bucket() {
        // "Aa" and "BB" have the same polynomial hash.
        assert_eq!(compute_string_hash("Aa"), compute_string_hash("BB"));
        let mut table = Table::new(4);
        let aa = string("Aa");
        let bb = string("BB");
        table.insert(aa.clone()).unwrap();
        table.insert(bb.clone()).unwrap();
        assert_eq!(table.find("Aa"), Some(aa.clone()));
        assert_eq!(table.find("BB"), Some(bb));
        table.remove(&aa);
        assert_eq!(table.find("Aa"), None);
        assert_eq!(table.size(), 1);
    }

    #[test]
    #[should_panic(expected = "non-interned")]
    fn removing_unknown_string_panics() {
        let mut table = Table::new(4);
        table.insert(string("kept")).unwrap();
        table.remove(&string("kept"));
    }

    #[test]
    fn read_only_sets_are_searched_first_and_never_swept() {
        let mut table = Table::new(4);
        let frozen = string("frozen");
        table.add_read_only(UnorderedSet::read_only(vec![frozen.clone()]).unwrap());
        let fresh = string("fresh");
        table.insert(fresh.clone()).unwrap();

        let removed = table.sweep_weaks(&|_: &ObjectRef| -> Option<ObjectRef> { None });
        assert_eq!(removed, 1);
        assert_eq!(table.find("frozen"), Some(frozen));
        assert_eq!(table.find("fresh"), None);
    }

    #[test]
    #[should_panic(expected = "read-only")]
    fn read_only_entries_cannot_be_removed() {
        let mut table = Table::new(4);
        let frozen = string("frozen");
        table.add_read_only(UnorderedSet::read_only(vec![frozen.clone()]).unwrap());
        table.remove(&frozen);
    }

    #[test]
    fn reserving_behind_a_read_only_set_opens_a_mutable_one() {
        let mut table = Table {
            tables: vec![UnorderedSet::read_only(vec![string("frozen")]).unwrap()],
        };
        let fresh = string("fresh");
        table.reserve_for(&fresh).unwrap();
        assert_eq!(table.tables.len(), 2);
        table.insert(fresh.clone()).unwrap();
        assert_eq!(table.tables.len(), 2);
        assert_eq!(table.find("fresh"), Some(fresh));
        assert_eq!(table.size(), 2);
    }

    #[test]
    fn sweep_relocates_survivors() {
        let mut table = Table::new(4);
        let old = string("moving");
        table.insert(old.clone()).unwrap();
        let new = string("moving");
        let target = new.clone();
        table.sweep_weaks(&move |_: &ObjectRef| Some(target.clone()));
        assert_eq!(table.find("moving"), Some(new));
    }
}
