//! Type layouts supplied by the type system
//!
//! The collector never interprets object contents on its own: every header
//! names a [`TypeId`], and the registered [`TypeInfo`] says how large the
//! object is and where its references live.

use crate::address::{Address, WORD_SIZE, align_size};
use crate::descriptor::{ComplexTable, Descriptor, make_descriptor};
use crate::error::{GcError, GcResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// Words before the first field of a fixed object (the header)
pub const OBJECT_HEADER_WORDS: usize = 1;

/// Words before the first element of a vector (header + length)
pub const VECTOR_HEADER_WORDS: usize = 2;

/// Handle of a registered type. Never zero, so a zero header word always
/// means unallocated memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

impl TypeId {
    /// Raw index (starting at 1)
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub(crate) const fn from_raw(raw: u32) -> Self {
        TypeId(raw)
    }
}

/// Reference layout of one vector element
#[derive(Clone, Debug)]
pub enum ElementRefs {
    /// No references
    PointerFree,
    /// Every word is a reference
    AllRefs,
    /// Bit `i` set: word `i` of the element is a reference
    Bitmap(u64),
}

/// Shape of a type
#[derive(Clone, Debug)]
pub enum ObjectKind {
    /// Fixed-size object; `refs` is relative to the first field word
    Fixed {
        /// Total size including the header
        size: usize,
        /// Reference words after the header
        refs: Descriptor,
    },
    /// Header, length word, then `length` elements
    Vector {
        /// Bytes per element
        elem_size: usize,
        /// References inside each element
        elem_refs: ElementRefs,
    },
    /// Vector of (key, value) word pairs with ephemeron semantics
    Ephemeron,
    /// Headerless inline layout, only used by value-type copies
    ValueType {
        /// Size of one value
        size: usize,
        /// Reference words of one value
        refs: Descriptor,
    },
}

/// A registered type
#[derive(Clone, Debug)]
pub struct TypeInfo {
    /// Diagnostic name
    pub name: Box<str>,
    /// Layout
    pub kind: ObjectKind,
}

impl TypeInfo {
    /// Fixed-size type of `field_words` fields
    pub fn fixed(name: &str, field_words: usize, refs: Descriptor) -> Self {
        Self {
            name: name.into(),
            kind: ObjectKind::Fixed {
                size: (OBJECT_HEADER_WORDS + field_words) * WORD_SIZE,
                refs,
            },
        }
    }

    /// Vector type
    pub fn vector(name: &str, elem_size: usize, elem_refs: ElementRefs) -> Self {
        Self {
            name: name.into(),
            kind: ObjectKind::Vector {
                elem_size,
                elem_refs,
            },
        }
    }

    /// Ephemeron table type
    pub fn ephemeron(name: &str) -> Self {
        Self {
            name: name.into(),
            kind: ObjectKind::Ephemeron,
        }
    }

    /// Value type layout
    pub fn value_type(name: &str, size: usize, refs: Descriptor) -> Self {
        Self {
            name: name.into(),
            kind: ObjectKind::ValueType { size, refs },
        }
    }

    /// Size of an instance with `length` elements (ignored by fixed types)
    pub fn instance_size(&self, length: usize) -> usize {
        match self.checked_instance_size(length) {
            Some(size) => size,
            None => crate::gc_fatal!("`{}` of length {length} overflows", self.name),
        }
    }

    /// Size of an instance with `length` elements, or `None` when it does
    /// not fit in a single allocation
    pub fn checked_instance_size(&self, length: usize) -> Option<usize> {
        let size = match &self.kind {
            ObjectKind::Fixed { size, .. } => *size,
            ObjectKind::Vector { elem_size, .. } => length
                .checked_mul(*elem_size)?
                .checked_add(VECTOR_HEADER_WORDS * WORD_SIZE)?,
            ObjectKind::Ephemeron => length
                .checked_mul(2 * WORD_SIZE)?
                .checked_add(VECTOR_HEADER_WORDS * WORD_SIZE)?,
            ObjectKind::ValueType { size, .. } => return Some(*size),
        };
        // allocation layouts are capped at isize::MAX
        (size <= isize::MAX as usize).then(|| align_size(size))
    }

    /// Does the type carry a length word
    pub fn is_vector(&self) -> bool {
        matches!(self.kind, ObjectKind::Vector { .. } | ObjectKind::Ephemeron)
    }
}

/// Immutable snapshot of every registered type
#[derive(Default, Debug)]
pub struct TypeTable {
    types: Vec<TypeInfo>,
    complex: ComplexTable,
}

impl TypeTable {
    /// Look up a type
    #[inline]
    pub fn get(&self, id: TypeId) -> Option<&TypeInfo> {
        self.types.get((id.0 as usize).wrapping_sub(1))
    }

    /// Look up a type that a live header names; an unknown id is corruption
    #[inline]
    pub(crate) fn expect(&self, id: TypeId, at: Address) -> &TypeInfo {
        match self.get(id) {
            Some(info) => info,
            None => crate::gc_fatal!("object {at} has unknown type id {}", id.0),
        }
    }

    /// Interned complex bitmaps
    pub fn complex(&self) -> &ComplexTable {
        &self.complex
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// No types registered
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Size of the object at `obj` of type `id`, reading the length word of
    /// vectors
    ///
    /// # Safety
    /// `obj` must be the start of an object of type `id`.
    pub unsafe fn object_size(&self, obj: Address, id: TypeId) -> usize {
        let info = self.expect(id, obj);
        let length = if info.is_vector() {
            // SAFETY: vectors always have a length word
            unsafe { obj.word(1).load() }
        } else {
            0
        };
        let size = info.instance_size(length);
        if size < WORD_SIZE {
            crate::gc_fatal!("object {obj} of type `{}` reports size {size}", info.name);
        }
        size
    }
}

/// Registry of types, shared by mutators and the collector
///
/// Registration copies the table so a collection can hold an `Arc` snapshot
/// for the whole pause without blocking anyone.
#[derive(Default)]
pub struct TypeRegistry {
    table: RwLock<Arc<TypeTable>>,
}

impl TypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type
    pub fn register(&self, info: TypeInfo) -> GcResult<TypeId> {
        if let ObjectKind::Fixed { size, .. } = info.kind
            && size < OBJECT_HEADER_WORDS * WORD_SIZE
        {
            return Err(GcError::InvalidAllocation {
                name: info.name.into(),
                reason: "fixed size smaller than the header",
            });
        }
        let mut guard = self.table.write();
        let mut table = TypeTable {
            types: guard.types.clone(),
            complex: guard.complex.clone(),
        };
        table.types.push(info);
        let id = TypeId(table.types.len() as u32);
        *guard = Arc::new(table);
        Ok(id)
    }

    /// Build the most compact descriptor for `bits`, interning complex ones
    pub fn make_descriptor(&self, bits: &[u64]) -> Descriptor {
        let mut guard = self.table.write();
        let mut complex = guard.complex.clone();
        let desc = make_descriptor(bits, &mut complex);
        if complex.len() != guard.complex.len() {
            *guard = Arc::new(TypeTable {
                types: guard.types.clone(),
                complex,
            });
        }
        desc
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<TypeTable> {
        Arc::clone(&self.table.read())
    }
}
