//! Managed object handles.
//!
//! The heap is an external collaborator of the runtime core, so objects are
//! modelled as reference-counted cells carrying a mark word and either an
//! immutable string payload or a vector of reference fields. Identity is the
//! cell address: two handles are equal only when they name the same object.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use bitflags::bitflags;
use parking_lot::Mutex;

/// Bytes charged for every object on top of its payload.
pub const OBJECT_HEADER_SIZE: usize = 16;

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlags: u16 {
        const MARKED = 0b0001;
        const PINNED = 0b0010;
        const LARGE = 0b0100;
    }
}

/// Hash used for interned strings: `h = 31 * h + unit` over the UTF-16 code
/// units of the content, wrapping on overflow.
///
/// ```
/// use managed_rt::object::compute_string_hash;
///
/// assert_eq!(compute_string_hash(""), 0);
/// assert_eq!(compute_string_hash("a"), 97);
/// assert_eq!(compute_string_hash("ab"), 97 * 31 + 98);
/// ```
pub fn compute_string_hash(content: &str) -> u32 {
    content
        .encode_utf16()
        .fold(0u32, |hash, unit| hash.wrapping_mul(31).wrapping_add(u32::from(unit)))
}

enum ObjectBody {
    String { content: Box<str>, hash: u32 },
    Data { fields: Mutex<Vec<ObjectRef>> },
}

struct ObjectInner {
    flags: AtomicU16,
    size: usize,
    body: ObjectBody,
}

/// Handle to a managed object.
#[derive(Clone)]
pub struct ObjectRef {
    inner: Arc<ObjectInner>,
}

impl ObjectRef {
    pub(crate) fn new_string(content: &str, flags: ObjectFlags) -> Self {
        let hash = compute_string_hash(content);
        Self {
            inner: Arc::new(ObjectInner {
                flags: AtomicU16::new(flags.bits()),
                size: OBJECT_HEADER_SIZE + content.len(),
                body: ObjectBody::String {
                    content: content.into(),
                    hash,
                },
            }),
        }
    }

    pub(crate) fn new_data(size: usize, fields: Vec<ObjectRef>, flags: ObjectFlags) -> Self {
        Self {
            inner: Arc::new(ObjectInner {
                flags: AtomicU16::new(flags.bits()),
                size: size.max(OBJECT_HEADER_SIZE),
                body: ObjectBody::Data {
                    fields: Mutex::new(fields),
                },
            }),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.inner.body {
            ObjectBody::String { content, .. } => Some(content),
            ObjectBody::Data { .. } => None,
        }
    }

    /// Precomputed content hash, `None` for non-string objects.
    pub fn string_hash(&self) -> Option<u32> {
        match &self.inner.body {
            ObjectBody::String { hash, .. } => Some(*hash),
            ObjectBody::Data { .. } => None,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self.inner.body, ObjectBody::String { .. })
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn flags(&self) -> ObjectFlags {
        ObjectFlags::from_bits_truncate(self.inner.flags.load(Ordering::Acquire))
    }

    /// Sets the mark bit, returning `true` if this call marked the object.
    pub fn try_mark(&self) -> bool {
        let previous = self
            .inner
            .flags
            .fetch_or(ObjectFlags::MARKED.bits(), Ordering::AcqRel);
        previous & ObjectFlags::MARKED.bits() == 0
    }

    pub fn clear_mark(&self) {
        self.inner
            .flags
            .fetch_and(!ObjectFlags::MARKED.bits(), Ordering::AcqRel);
    }

    pub fn is_marked(&self) -> bool {
        self.flags().contains(ObjectFlags::MARKED)
    }

    pub fn is_pinned(&self) -> bool {
        self.flags().contains(ObjectFlags::PINNED)
    }

    pub fn is_large(&self) -> bool {
        self.flags().contains(ObjectFlags::LARGE)
    }

    /// Snapshot of the reference fields.
    pub fn fields(&self) -> Vec<ObjectRef> {
        match &self.inner.body {
            ObjectBody::Data { fields } => fields.lock().clone(),
            ObjectBody::String { .. } => Vec::new(),
        }
    }

    pub fn push_field(&self, value: ObjectRef) {
        if let ObjectBody::Data { fields } = &self.inner.body {
            fields.lock().push(value);
        }
    }

    /// Overwrites field `index`; returns `false` when the slot does not exist.
    pub fn set_field(&self, index: usize, value: ObjectRef) -> bool {
        match &self.inner.body {
            ObjectBody::Data { fields } => match fields.lock().get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
            ObjectBody::String { .. } => false,
        }
    }

    pub fn clear_fields(&self) {
        if let ObjectBody::Data { fields } = &self.inner.body {
            fields.lock().clear();
        }
    }

    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ObjectRef {}

impl Hash for ObjectRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("ObjectRef");
        out.field("address", &format_args!("{:#x}", self.address()));
        if let Some(content) = self.as_str() {
            out.field("content", &content);
        }
        out.field("flags", &self.flags()).finish()
    }
}
