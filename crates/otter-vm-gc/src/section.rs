//! Heap sections
//!
//! A section is a page-aligned, zero-initialised block of object storage. It
//! keeps scan-start hints every [`SCAN_START_SIZE`] bytes so the object that
//! contains an arbitrary interior address can be found with a short walk,
//! plus side tables used by the major strategies and the card barrier.

use crate::address::{ALLOC_ALIGN, Address, AddressRange, zero_range};
use crate::error::{GcError, GcResult};
use crate::object::{HeaderState, ObjectRef};
use crate::types::TypeTable;
use parking_lot::RwLock;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

/// Stride between scan-start hints
pub const SCAN_START_SIZE: usize = 4096 * 2;

/// Bytes covered by one card
pub const CARD_SIZE: usize = 512;

/// Alignment of section memory
pub const SECTION_ALIGN: usize = 4096;

/// What a section is used for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionRole {
    /// The nursery
    Nursery,
    /// Major heap storage
    Major,
}

/// A block of object storage
pub struct Section {
    start: Address,
    size: usize,
    layout: Layout,
    role: SectionRole,
    /// Bump pointer for strategies that allocate linearly
    next_data: AtomicUsize,
    scan_starts: Box<[AtomicUsize]>,
    mark_bits: Box<[AtomicU64]>,
    cards: Box<[AtomicU8]>,
}

impl Section {
    /// Allocate a zeroed section of `size` bytes
    pub fn new(size: usize, role: SectionRole) -> GcResult<Self> {
        let size = size.next_multiple_of(SECTION_ALIGN);
        let layout = Layout::from_size_align(size, SECTION_ALIGN).map_err(|_| {
            GcError::OutOfMemory {
                requested: size,
                heap_size: 0,
            }
        })?;
        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(GcError::OutOfMemory {
                requested: size,
                heap_size: 0,
            });
        }
        let start = Address::from_ptr(ptr);
        let (mark_words, card_count) = match role {
            SectionRole::Major => (size / ALLOC_ALIGN / 64 + 1, size.div_ceil(CARD_SIZE)),
            SectionRole::Nursery => (0, 0),
        };
        Ok(Self {
            start,
            size,
            layout,
            role,
            next_data: AtomicUsize::new(start.as_usize()),
            scan_starts: (0..size.div_ceil(SCAN_START_SIZE))
                .map(|_| AtomicUsize::new(0))
                .collect(),
            mark_bits: (0..mark_words).map(|_| AtomicU64::new(0)).collect(),
            cards: (0..card_count).map(|_| AtomicU8::new(0)).collect(),
        })
    }

    /// First byte
    #[inline]
    pub fn start(&self) -> Address {
        self.start
    }

    /// One past the last byte
    #[inline]
    pub fn end(&self) -> Address {
        self.start.offset(self.size)
    }

    /// Size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Role
    pub fn role(&self) -> SectionRole {
        self.role
    }

    /// Covered range
    #[inline]
    pub fn range(&self) -> AddressRange {
        AddressRange::new(self.start, self.end())
    }

    /// Does the section contain `addr`
    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Current bump pointer
    #[inline]
    pub fn next_data(&self) -> Address {
        Address::from_usize(self.next_data.load(Ordering::Acquire))
    }

    /// Move the bump pointer
    pub fn set_next_data(&self, addr: Address) {
        self.next_data.store(addr.as_usize(), Ordering::Release);
    }

    /// Bytes left after the bump pointer
    pub fn free_tail(&self) -> usize {
        self.end().diff(self.next_data())
    }

    /// Bump-allocate `size` bytes; callers serialise access
    pub fn bump(&self, size: usize) -> Option<Address> {
        let next = self.next_data();
        if next.offset(size) > self.end() {
            return None;
        }
        self.set_next_data(next.offset(size));
        Some(next)
    }

    /// Record that an object starts at `addr`. Keeps the lowest start seen
    /// in each stride.
    #[inline]
    pub fn record_scan_start(&self, addr: Address) {
        let index = addr.diff(self.start) / SCAN_START_SIZE;
        let raw = addr.as_usize();
        let _ = self.scan_starts[index].fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            (cur == 0 || raw < cur).then_some(raw)
        });
    }

    /// Forget every scan start
    pub fn clear_scan_starts(&self) {
        for start in self.scan_starts.iter() {
            start.store(0, Ordering::Relaxed);
        }
    }

    /// Closest known object start at or before `addr`, falling back to the
    /// section start
    pub fn scan_start_before(&self, addr: Address) -> Address {
        let mut index = addr.diff(self.start) / SCAN_START_SIZE;
        loop {
            let hint = self.scan_starts[index].load(Ordering::Acquire);
            if hint != 0 && hint <= addr.as_usize() {
                return Address::from_usize(hint);
            }
            if index == 0 {
                return self.start;
            }
            index -= 1;
        }
    }

    /// Zero `[from, to)` inside this section. Empty ranges are ignored.
    pub fn zero(&self, from: Address, to: Address) {
        if from >= to {
            return;
        }
        debug_assert!(from >= self.start && to <= self.end());
        // SAFETY: the range lies inside memory this section owns
        unsafe { zero_range(from, to) }
    }

    #[inline]
    fn mark_index(&self, obj: Address) -> (usize, u64) {
        let granule = obj.diff(self.start) / ALLOC_ALIGN;
        (granule / 64, 1u64 << (granule % 64))
    }

    /// Set the mark bit of `obj`. Returns `true` if it was clear.
    #[inline]
    pub fn mark(&self, obj: Address) -> bool {
        let (word, bit) = self.mark_index(obj);
        self.mark_bits[word].fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    /// Is the mark bit of `obj` set
    #[inline]
    pub fn is_marked(&self, obj: Address) -> bool {
        let (word, bit) = self.mark_index(obj);
        self.mark_bits[word].load(Ordering::Acquire) & bit != 0
    }

    /// Clear every mark bit
    pub fn clear_marks(&self) {
        for word in self.mark_bits.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Dirty the card covering `addr`
    #[inline]
    pub fn mark_card(&self, addr: Address) {
        let index = addr.diff(self.start) / CARD_SIZE;
        self.cards[index].store(1, Ordering::Release);
    }

    /// Is the card covering `addr` dirty
    pub fn is_card_dirty(&self, addr: Address) -> bool {
        let index = addr.diff(self.start) / CARD_SIZE;
        self.cards[index].load(Ordering::Acquire) != 0
    }

    /// Collect and clear the dirty cards, returning their ranges
    pub fn take_dirty_cards(&self) -> Vec<AddressRange> {
        let mut dirty = Vec::new();
        for (index, card) in self.cards.iter().enumerate() {
            if card.swap(0, Ordering::AcqRel) != 0 {
                let start = self.start.offset(index * CARD_SIZE);
                dirty.push(AddressRange::new(start, start.offset(CARD_SIZE).min(self.end())));
            }
        }
        dirty
    }

    /// Clear every card
    pub fn clear_cards(&self) {
        for card in self.cards.iter() {
            card.store(0, Ordering::Relaxed);
        }
    }

    /// Walk the objects in `[from, limit)`, calling `f(obj, size)`.
    ///
    /// `from` must be an object start or zeroed memory; zero words are
    /// skipped one granule at a time. Forwarded objects report the size of
    /// their copy.
    ///
    /// # Safety
    /// Memory in the range must be walkable: objects with valid headers or
    /// zeroes.
    pub unsafe fn walk(
        &self,
        from: Address,
        limit: Address,
        types: &TypeTable,
        f: &mut dyn FnMut(Address, usize) -> WalkControl,
    ) {
        let limit = limit.min(self.end());
        let mut cursor = from;
        while cursor < limit {
            // SAFETY: cursor is inside the section and granule aligned
            let size = match unsafe { object_extent(cursor, types) } {
                None => {
                    cursor = cursor.offset(ALLOC_ALIGN);
                    continue;
                }
                Some(size) => size,
            };
            if cursor.offset(size) > self.end() {
                crate::gc_fatal!(
                    "object {cursor} of size {size} extends past section end {}",
                    self.end()
                );
            }
            if f(cursor, size) == WalkControl::Stop {
                return;
            }
            cursor = cursor.offset(size);
        }
    }

    /// Find the object whose extent contains `addr`
    ///
    /// # Safety
    /// Same as [`Section::walk`] between the scan start and `addr`.
    pub unsafe fn find_object_containing(
        &self,
        addr: Address,
        not_before: Address,
        types: &TypeTable,
    ) -> Option<(Address, usize)> {
        let start = self.scan_start_before(addr).max(not_before);
        let mut found = None;
        // SAFETY: forwarded to the caller
        unsafe {
            self.walk(start, addr.offset(1), types, &mut |obj, size| {
                if addr < obj.offset(size) {
                    if addr >= obj {
                        found = Some((obj, size));
                    }
                    return WalkControl::Stop;
                }
                WalkControl::Continue
            });
        }
        found
    }
}

impl Drop for Section {
    fn drop(&mut self) {
        // SAFETY: allocated in `Section::new` with this layout
        unsafe { dealloc(self.start.as_mut_ptr::<u8>(), self.layout) }
    }
}

/// Whether a walk should go on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkControl {
    /// Visit the next object
    Continue,
    /// Stop walking
    Stop,
}

/// Size of the object at `addr`, or `None` for zeroed memory
///
/// # Safety
/// `addr` must be a header word or zero.
pub(crate) unsafe fn object_extent(addr: Address, types: &TypeTable) -> Option<usize> {
    let obj = ObjectRef::new(addr);
    // SAFETY: forwarded to the caller
    match unsafe { obj.header() } {
        HeaderState::Empty => None,
        HeaderState::Normal(ty) | HeaderState::Pinned(ty) | HeaderState::Copying(ty) => {
            // SAFETY: header names a type
            Some(unsafe { types.object_size(addr, ty) })
        }
        HeaderState::Forwarded(to) => {
            // SAFETY: forwarding targets are complete copies
            let ty = unsafe { ObjectRef::new(to).type_id() };
            Some(unsafe { types.object_size(to, ty) })
        }
    }
}

/// Sorted set of sections, readable by mutators for card marking
#[derive(Default)]
pub struct SectionMap {
    sections: RwLock<Vec<Arc<Section>>>,
}

impl SectionMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a section
    pub fn insert(&self, section: Arc<Section>) {
        let mut sections = self.sections.write();
        let pos = sections.partition_point(|s| s.start() < section.start());
        sections.insert(pos, section);
    }

    /// Remove the section starting at `start`
    pub fn remove(&self, start: Address) -> Option<Arc<Section>> {
        let mut sections = self.sections.write();
        let pos = sections.binary_search_by(|s| s.start().cmp(&start)).ok()?;
        Some(sections.remove(pos))
    }

    /// Section containing `addr`
    pub fn find(&self, addr: Address) -> Option<Arc<Section>> {
        let sections = self.sections.read();
        find_in(&sections, addr).cloned()
    }

    /// Copy of the current list
    pub fn snapshot(&self) -> Vec<Arc<Section>> {
        self.sections.read().clone()
    }

    /// Number of sections
    pub fn len(&self) -> usize {
        self.sections.read().len()
    }

    /// No sections
    pub fn is_empty(&self) -> bool {
        self.sections.read().is_empty()
    }

    /// Total reserved bytes
    pub fn reserved_bytes(&self) -> usize {
        self.sections.read().iter().map(|s| s.size()).sum()
    }
}

/// Binary search a sorted section list
pub fn find_in(sections: &[Arc<Section>], addr: Address) -> Option<&Arc<Section>> {
    let pos = sections.partition_point(|s| s.start() <= addr);
    let section = sections.get(pos.checked_sub(1)?)?;
    section.contains(addr).then_some(section)
}
