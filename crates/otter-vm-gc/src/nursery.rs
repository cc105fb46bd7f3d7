//! Nursery allocator
//!
//! The nursery is a single section carved into fragments: the free ranges
//! left between pinned survivors after a collection. Mutators take
//! thread-local allocation buffers (TLABs) out of the current fragment and
//! bump-allocate inside them without locking.

use crate::address::{Address, AddressRange};
use crate::config::ClearPolicy;
use crate::error::GcResult;
use crate::log::{gc_debug, gc_warn};
use crate::object::ObjectRef;
use crate::section::{SCAN_START_SIZE, Section, SectionRole};
use std::sync::Arc;

/// Smallest gap between pinned objects worth reusing
pub const FRAGMENT_MIN_SIZE: usize = 512;

/// Thread-local allocation buffer
///
/// `temp_end` trails `real_end` so that a scan start is recorded at least
/// every [`SCAN_START_SIZE`] bytes without checking on every allocation.
#[derive(Clone, Copy, Debug, Default)]
pub struct Tlab {
    start: Address,
    next: Address,
    temp_end: Address,
    real_end: Address,
}

impl Tlab {
    /// A TLAB with no space
    pub const fn empty() -> Self {
        Self {
            start: Address::NULL,
            next: Address::NULL,
            temp_end: Address::NULL,
            real_end: Address::NULL,
        }
    }

    /// TLAB over a freshly carved range
    pub fn new(range: AddressRange) -> Self {
        Self {
            start: range.start,
            next: range.start,
            temp_end: range.end.min(range.start.offset(SCAN_START_SIZE)),
            real_end: range.end,
        }
    }

    /// Bump-allocate `size` bytes
    #[inline]
    pub fn alloc(&mut self, size: usize, section: &Section) -> Option<Address> {
        let obj = self.next;
        let new_next = obj.offset(size);
        if new_next <= self.temp_end {
            self.next = new_next;
            return Some(obj);
        }
        if new_next <= self.real_end {
            section.record_scan_start(obj);
            self.next = new_next;
            self.temp_end = self.real_end.min(new_next.offset(SCAN_START_SIZE));
            return Some(obj);
        }
        None
    }

    /// Bytes left
    pub fn remaining(&self) -> usize {
        self.real_end.diff(self.next)
    }

    /// Start of the buffer
    pub fn start(&self) -> Address {
        self.start
    }
}

/// The nursery
pub struct Nursery {
    section: Arc<Section>,
    current: AddressRange,
    fragments: Vec<AddressRange>,
    clear_policy: ClearPolicy,
    tlab_size: usize,
    degraded: Option<usize>,
}

impl Nursery {
    /// Allocate a nursery of `size` bytes
    pub fn new(size: usize, tlab_size: usize, clear_policy: ClearPolicy) -> GcResult<Self> {
        let section = Arc::new(Section::new(size, SectionRole::Nursery)?);
        let range = section.range();
        Ok(Self {
            section,
            current: range,
            fragments: Vec::new(),
            clear_policy,
            tlab_size,
            degraded: None,
        })
    }

    /// Covered range
    #[inline]
    pub fn range(&self) -> AddressRange {
        self.section.range()
    }

    /// Backing section
    pub fn section(&self) -> &Arc<Section> {
        &self.section
    }

    /// Configured TLAB size
    pub fn tlab_size(&self) -> usize {
        self.tlab_size
    }

    /// Carve between `min` and `preferred` bytes from the fragments
    fn carve(&mut self, min: usize, preferred: usize) -> Option<AddressRange> {
        if self.current.len() < min {
            self.retire_current();
            let pos = self.fragments.iter().position(|f| f.len() >= min)?;
            self.current = self.fragments.remove(pos);
        }
        let len = preferred.max(min).min(self.current.len());
        let range = AddressRange::new(self.current.start, self.current.start.offset(len));
        self.current.start = range.end;
        if self.clear_policy == ClearPolicy::AtTlabCreation {
            self.section.zero(range.start, range.end);
        }
        self.section.record_scan_start(range.start);
        Some(range)
    }

    fn retire_current(&mut self) {
        let tail = std::mem::take(&mut self.current);
        if tail.len() >= FRAGMENT_MIN_SIZE {
            self.fragments.push(tail);
        } else if !tail.is_empty() && self.clear_policy == ClearPolicy::AtTlabCreation {
            self.section.zero(tail.start, tail.end);
        }
    }

    /// Hand out a TLAB able to hold at least `min` bytes
    pub fn new_tlab(&mut self, min: usize) -> Option<Tlab> {
        let tlab_size = self.tlab_size;
        self.carve(min, tlab_size).map(Tlab::new)
    }

    /// Allocate an object too big for a TLAB directly from a fragment
    pub fn alloc_direct(&mut self, size: usize) -> Option<Address> {
        self.carve(size, size).map(|range| range.start)
    }

    /// Bytes still available for carving
    pub fn free_bytes(&self) -> usize {
        self.current.len() + self.fragments.iter().map(|f| f.len()).sum::<usize>()
    }

    /// Number of free fragments, including the current one
    pub fn fragment_count(&self) -> usize {
        self.fragments.len() + usize::from(!self.current.is_empty())
    }

    /// Make sure every byte not covered by an object is zero before the
    /// pinning walk
    pub fn prepare_for_collection(&mut self) {
        if self.clear_policy == ClearPolicy::AtTlabCreation {
            self.section.zero(self.current.start, self.current.end);
            for fragment in &self.fragments {
                self.section.zero(fragment.start, fragment.end);
            }
        }
    }

    /// Rebuild the fragment list around the surviving pinned objects and
    /// unpin them. `pinned` holds (start, size) pairs sorted by address.
    ///
    /// Returns `true` when no usable fragment remains and the nursery
    /// entered degraded mode.
    pub fn rebuild(&mut self, pinned: &[(Address, usize)]) -> bool {
        self.section.clear_scan_starts();
        self.fragments.clear();
        self.current = AddressRange::default();

        let mut cursor = self.section.start();
        for &(obj, size) in pinned {
            // SAFETY: pinned objects are live objects of this nursery
            unsafe { ObjectRef::new(obj).unpin() };
            self.section.record_scan_start(obj);
            self.add_fragment(cursor, obj);
            cursor = cursor.max(obj.offset(size));
        }
        self.add_fragment(cursor, self.section.end());

        if self.fragments.is_empty() {
            gc_warn!(pinned = pinned.len(), "nursery fully pinned, entering degraded mode");
            self.degraded = Some(0);
        } else {
            self.degraded = None;
            // largest fragments first to keep TLAB refills cheap
            self.fragments.sort_by_key(|f| std::cmp::Reverse(f.len()));
        }
        gc_debug!(
            fragments = self.fragments.len(),
            free = self.free_bytes(),
            "rebuilt nursery fragments"
        );
        self.degraded.is_some()
    }

    fn add_fragment(&mut self, from: Address, to: Address) {
        if to <= from {
            return;
        }
        let range = AddressRange::new(from, to);
        if range.len() >= FRAGMENT_MIN_SIZE {
            if self.clear_policy == ClearPolicy::AtGc {
                self.section.zero(from, to);
            }
            self.fragments.push(range);
        } else {
            self.section.zero(from, to);
        }
    }

    /// Can a single carve of `size` bytes succeed
    pub fn can_fit(&self, size: usize) -> bool {
        self.current.len() >= size || self.fragments.iter().any(|f| f.len() >= size)
    }

    /// Enter degraded mode if no fragment left by the last collection can
    /// hold `size` bytes. Returns `true` when the nursery is degraded.
    pub fn degrade_unless_fits(&mut self, size: usize) -> bool {
        if self.degraded.is_none() && !self.can_fit(size) {
            gc_warn!(
                requested = size,
                fragments = self.fragment_count(),
                free = self.free_bytes(),
                "nursery fragments too small, entering degraded mode"
            );
            self.degraded = Some(0);
        }
        self.degraded.is_some()
    }

    /// Is the nursery in degraded mode
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    /// Account bytes allocated in the major heap while degraded. Returns
    /// `true` once a nursery's worth has been diverted.
    pub fn note_degraded_alloc(&mut self, size: usize) -> bool {
        match &mut self.degraded {
            Some(bytes) => {
                *bytes += size;
                *bytes >= self.section.size()
            }
            None => false,
        }
    }

    /// Has degraded mode diverted a nursery's worth of allocations
    pub fn degraded_exhausted(&self) -> bool {
        self.degraded.is_some_and(|bytes| bytes >= self.section.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Descriptor;
    use crate::types::{TypeInfo, TypeRegistry};

    #[test]
    fn test_tlab_bump_records_scan_starts() {
        let mut nursery = Nursery::new(64 * 1024, 16 * 1024, ClearPolicy::AtTlabCreation).unwrap();
        let mut tlab = nursery.new_tlab(16).unwrap();
        let section = nursery.section().clone();
        let first = tlab.alloc(512, &section).unwrap();
        assert_eq!(first, section.start());
        let mut last = first;
        while let Some(obj) = tlab.alloc(512, &section) {
            last = obj;
        }
        assert_eq!(tlab.remaining(), 0);
        assert_eq!(section.scan_start_before(last), first.offset(SCAN_START_SIZE));
    }

    #[test]
    fn test_carving_exhausts_nursery() {
        let mut nursery = Nursery::new(64 * 1024, 4096, ClearPolicy::AtTlabCreation).unwrap();
        let mut count = 0;
        while nursery.new_tlab(64).is_some() {
            count += 1;
        }
        assert_eq!(count, 16);
        assert_eq!(nursery.free_bytes(), 0);
        assert!(nursery.alloc_direct(128).is_none());
    }

    #[test]
    fn test_rebuild_around_pinned() {
        let registry = TypeRegistry::new();
        let ty = registry
            .register(TypeInfo::fixed("Obj", 3, Descriptor::pointer_free()))
            .unwrap();
        let mut nursery = Nursery::new(64 * 1024, 4096, ClearPolicy::AtGc).unwrap();
        let base = nursery.range().start;
        let a = base.offset(256);
        let b = base.offset(40 * 1024);
        for obj in [a, b] {
            unsafe {
                ObjectRef::new(obj).initialize(ty);
                ObjectRef::new(obj).pin();
            }
        }
        let degraded = nursery.rebuild(&[(a, 32), (b, 32)]);
        assert!(!degraded);
        // the gap before `a` is too small to keep
        assert_eq!(nursery.fragment_count(), 2);
        assert_eq!(nursery.free_bytes(), 64 * 1024 - 256 - 64);
        unsafe {
            assert!(!ObjectRef::new(a).is_pinned());
            assert_eq!(ObjectRef::new(b).type_id(), ty);
        }
        let range = nursery.new_tlab(64).unwrap();
        assert!(range.start() >= a.offset(32));
    }

    #[test]
    fn test_fully_pinned_enters_degraded_mode() {
        let mut nursery = Nursery::new(64 * 1024, 4096, ClearPolicy::AtTlabCreation).unwrap();
        let base = nursery.range().start;
        let pinned: Vec<_> = (0..128).map(|i| (base.offset(i * 512), 256)).collect();
        assert!(nursery.rebuild(&pinned));
        assert!(nursery.is_degraded());
        assert!(nursery.new_tlab(64).is_none());
        assert!(!nursery.note_degraded_alloc(32 * 1024));
        assert!(nursery.note_degraded_alloc(32 * 1024));
        assert!(nursery.degraded_exhausted());
        nursery.rebuild(&[]);
        assert!(!nursery.is_degraded());
    }

    #[test]
    fn test_split_nursery_degrades_for_large_requests() {
        let mut nursery = Nursery::new(64 * 1024, 4096, ClearPolicy::AtTlabCreation).unwrap();
        let middle = nursery.range().start.offset(32 * 1024);
        assert!(!nursery.rebuild(&[(middle, 256)]));
        assert!(nursery.can_fit(32 * 1024 - 256));
        assert!(!nursery.can_fit(40 * 1024));
        assert!(!nursery.degrade_unless_fits(16 * 1024));
        assert!(nursery.degrade_unless_fits(40 * 1024));
        // small TLABs are still carved from the fragments
        assert!(nursery.new_tlab(64).is_some());
    }

    #[test]
    fn test_prepare_after_rebuild_without_carving() {
        let mut nursery = Nursery::new(64 * 1024, 4096, ClearPolicy::AtTlabCreation).unwrap();
        nursery.rebuild(&[]);
        nursery.prepare_for_collection();
        nursery.rebuild(&[]);
        nursery.prepare_for_collection();
        assert_eq!(nursery.free_bytes(), 64 * 1024);
        assert!(nursery.new_tlab(64).is_some());
    }
}
