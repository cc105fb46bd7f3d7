//! Large object space
//!
//! Objects above [`MAX_SMALL_OBJECT_SIZE`] get their own allocation and are
//! never moved. A major collection marks them by setting the pin bit of
//! their header; the sweep frees every unpinned one and clears the bit on
//! the survivors.

use crate::address::{Address, ALLOC_ALIGN};
use crate::error::{GcError, GcResult};
use crate::log::gc_debug;
use crate::object::ObjectRef;
use parking_lot::RwLock;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Largest object served by the nursery and the major sections
pub const MAX_SMALL_OBJECT_SIZE: usize = 0xffff;

const LOS_ALIGN: usize = 64;

struct LargeObject {
    start: Address,
    size: usize,
    layout: Layout,
    /// Card-table mode: a slot of the object was written
    dirty: AtomicBool,
}

impl LargeObject {
    fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.start.offset(self.size)
    }
}

impl Drop for LargeObject {
    fn drop(&mut self) {
        // SAFETY: allocated in `LargeObjectSpace::alloc` with this layout
        unsafe { dealloc(self.start.as_mut_ptr::<u8>(), self.layout) }
    }
}

/// Outcome of a sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LosSweep {
    /// Objects released
    pub freed_objects: usize,
    /// Bytes released
    pub freed_bytes: usize,
    /// Bytes still in use
    pub live_bytes: usize,
}

/// The large object space
#[derive(Default)]
pub struct LargeObjectSpace {
    /// Sorted by start address
    objects: RwLock<Vec<LargeObject>>,
    used: AtomicUsize,
}

impl LargeObjectSpace {
    /// Create an empty space
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed large object of `size` bytes
    pub fn alloc(&self, size: usize) -> GcResult<Address> {
        let size = size.next_multiple_of(ALLOC_ALIGN);
        let layout = Layout::from_size_align(size, LOS_ALIGN).map_err(|_| GcError::OutOfMemory {
            requested: size,
            heap_size: self.used_bytes(),
        })?;
        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(GcError::OutOfMemory {
                requested: size,
                heap_size: self.used_bytes(),
            });
        }
        let start = Address::from_ptr(ptr);
        let mut objects = self.objects.write();
        let pos = objects.partition_point(|o| o.start < start);
        objects.insert(
            pos,
            LargeObject {
                start,
                size,
                layout,
                dirty: AtomicBool::new(false),
            },
        );
        self.used.fetch_add(size, Ordering::Relaxed);
        Ok(start)
    }

    fn index_containing(objects: &[LargeObject], addr: Address) -> Option<usize> {
        let pos = objects.partition_point(|o| o.start <= addr);
        let index = pos.checked_sub(1)?;
        objects[index].contains(addr).then_some(index)
    }

    /// The object whose extent contains `addr`
    pub fn find_containing(&self, addr: Address) -> Option<(Address, usize)> {
        let objects = self.objects.read();
        Self::index_containing(&objects, addr).map(|i| (objects[i].start, objects[i].size))
    }

    /// Is `addr` the start of a large object
    pub fn is_object_start(&self, addr: Address) -> bool {
        self.find_containing(addr).is_some_and(|(start, _)| start == addr)
    }

    /// Does any large object contain `addr`
    pub fn contains(&self, addr: Address) -> bool {
        self.find_containing(addr).is_some()
    }

    /// Mark the object starting at `obj`. Returns `true` when it was
    /// unmarked; `false` when already marked or not a large object.
    pub fn mark(&self, obj: Address) -> bool {
        if !self.is_object_start(obj) {
            return false;
        }
        // SAFETY: `obj` starts a live large object with an initialised header
        unsafe { ObjectRef::new(obj).pin() }
    }

    /// Is the large object at `obj` marked
    pub fn is_marked(&self, obj: Address) -> bool {
        // SAFETY: only called on large object starts
        self.is_object_start(obj) && unsafe { ObjectRef::new(obj).is_pinned() }
    }

    /// Card-table barrier: remember that a slot inside a large object was
    /// written. Returns `false` when `slot` is not inside one.
    pub fn mark_dirty(&self, slot: Address) -> bool {
        let objects = self.objects.read();
        match Self::index_containing(&objects, slot) {
            Some(index) => {
                objects[index].dirty.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Is the large object holding `slot` dirty
    pub fn is_dirty(&self, slot: Address) -> bool {
        let objects = self.objects.read();
        Self::index_containing(&objects, slot)
            .is_some_and(|index| objects[index].dirty.load(Ordering::Acquire))
    }

    /// Take and clear the dirty objects
    pub fn take_dirty(&self) -> Vec<Address> {
        self.objects
            .read()
            .iter()
            .filter(|o| o.dirty.swap(false, Ordering::AcqRel))
            .map(|o| o.start)
            .collect()
    }

    /// Clear every dirty flag
    pub fn clear_dirty(&self) {
        for object in self.objects.read().iter() {
            object.dirty.store(false, Ordering::Relaxed);
        }
    }

    /// Every object start with its size
    pub fn objects(&self) -> Vec<(Address, usize)> {
        self.objects.read().iter().map(|o| (o.start, o.size)).collect()
    }

    /// Free unmarked objects and unmark the survivors
    pub fn sweep(&self) -> LosSweep {
        let mut result = LosSweep::default();
        let mut objects = self.objects.write();
        objects.retain(|o| {
            let obj = ObjectRef::new(o.start);
            // SAFETY: every large object has an initialised header
            if unsafe { obj.is_pinned() } {
                unsafe { obj.unpin() };
                result.live_bytes += o.size;
                true
            } else {
                result.freed_objects += 1;
                result.freed_bytes += o.size;
                false
            }
        });
        self.used.store(result.live_bytes, Ordering::Relaxed);
        gc_debug!(
            freed = result.freed_objects,
            freed_bytes = result.freed_bytes,
            live_bytes = result.live_bytes,
            "swept large objects"
        );
        result
    }

    /// Bytes allocated
    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Number of objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// No objects
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}
