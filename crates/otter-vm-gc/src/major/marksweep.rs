//! Mark-sweep major strategy
//!
//! Objects never move. Marking sets the section's side mark bits; the sweep
//! zeroes every unmarked object and rebuilds the hole list that promotion
//! and degraded allocation carve from (first fit, address order).

use super::{Lab, MajorCollector, find_condemned};
use crate::address::{Address, AddressRange};
use crate::config::MajorKind;
use crate::log::gc_debug;
use crate::pin::{PinQueue, resolve_candidates};
use crate::section::{Section, SectionMap, SectionRole, WalkControl};
use crate::trace::{TraceEnv, TraceWorker};
use crate::types::TypeTable;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Gaps smaller than this are not worth a hole entry
const MIN_HOLE_SIZE: usize = 64;

/// Non-moving major collector
pub struct MarkSweepMajor {
    kind: MajorKind,
    sections: Arc<SectionMap>,
    section_size: usize,
    /// Free zeroed ranges, sorted by address
    holes: Mutex<Vec<AddressRange>>,
    /// Promoted objects are marked while a major collection runs
    marking: AtomicBool,
    live_bytes: AtomicUsize,
    allocated: AtomicUsize,
    condemned: Vec<Arc<Section>>,
}

impl MarkSweepMajor {
    /// Strategy allocating sections of `section_size` bytes into `sections`
    pub fn new(kind: MajorKind, sections: Arc<SectionMap>, section_size: usize) -> Self {
        Self {
            kind,
            sections,
            section_size,
            holes: Mutex::new(Vec::new()),
            marking: AtomicBool::new(false),
            live_bytes: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
            condemned: Vec::new(),
        }
    }

    /// Number of free holes
    pub fn hole_count(&self) -> usize {
        self.holes.lock().len()
    }

    /// Sweep one section. Returns its live bytes and holes, or `None` if
    /// nothing in it survived.
    fn sweep_section(
        &self,
        section: &Section,
        types: &TypeTable,
    ) -> Option<(usize, Vec<AddressRange>)> {
        let mut live = Vec::new();
        // SAFETY: major sections are walkable: objects or zeroed memory
        unsafe {
            section.walk(section.start(), section.end(), types, &mut |obj, size| {
                if section.is_marked(obj) {
                    live.push((obj, size));
                }
                WalkControl::Continue
            });
        }
        section.clear_marks();
        section.clear_scan_starts();
        if live.is_empty() {
            section.zero(section.start(), section.end());
            return None;
        }
        let mut holes = Vec::new();
        let mut live_bytes = 0;
        let mut cursor = section.start();
        for (obj, size) in live {
            add_hole(section, &mut holes, cursor, obj);
            section.record_scan_start(obj);
            live_bytes += size;
            cursor = obj.offset(size);
        }
        add_hole(section, &mut holes, cursor, section.end());
        Some((live_bytes, holes))
    }
}

fn add_hole(section: &Section, holes: &mut Vec<AddressRange>, from: Address, to: Address) {
    if to <= from {
        return;
    }
    section.zero(from, to);
    if to.diff(from) >= MIN_HOLE_SIZE {
        holes.push(AddressRange::new(from, to));
    }
}

impl MajorCollector for MarkSweepMajor {
    fn kind(&self) -> MajorKind {
        self.kind
    }

    fn used_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed) + self.allocated.load(Ordering::Relaxed)
    }

    fn heap_bytes(&self) -> usize {
        self.sections.reserved_bytes()
    }

    fn alloc_lab(&self, min: usize, preferred: usize) -> Option<Lab> {
        let mut holes = self.holes.lock();
        let index = match holes.iter().position(|h| h.len() >= min) {
            Some(index) => index,
            None => {
                let section =
                    Arc::new(Section::new(self.section_size.max(min), SectionRole::Major).ok()?);
                let range = section.range();
                self.sections.insert(section);
                let pos = holes.partition_point(|h| h.start < range.start);
                holes.insert(pos, range);
                pos
            }
        };
        let hole = &mut holes[index];
        let len = preferred.max(min).min(hole.len());
        let start = hole.start;
        hole.start = start.offset(len);
        if hole.is_empty() {
            holes.remove(index);
        }
        drop(holes);
        let section = self.sections.find(start)?;
        self.allocated.fetch_add(len, Ordering::Relaxed);
        Some(Lab::new(section, start, start.offset(len)))
    }

    fn note_promoted(&self, obj: Address) {
        if self.marking.load(Ordering::Acquire)
            && let Some(section) = self.sections.find(obj)
        {
            section.mark(obj);
        }
    }

    fn start(&mut self) {
        self.condemned = self.sections.snapshot();
        self.marking.store(true, Ordering::Release);
    }

    fn find_pin_candidates(&self, queue: &PinQueue) -> Vec<Address> {
        self.condemned
            .iter()
            .flat_map(|s| queue.candidates_in(s.range()).iter().copied())
            .collect()
    }

    fn pin_and_enqueue(
        &mut self,
        candidates: &[Address],
        types: &TypeTable,
        worker: &mut TraceWorker,
    ) -> Vec<(Address, usize)> {
        let mut pinned = Vec::new();
        for section in &self.condemned {
            let from = candidates.partition_point(|a| *a < section.start());
            let to = candidates.partition_point(|a| *a < section.end());
            if from == to {
                continue;
            }
            // SAFETY: condemned sections are walkable and marking has not begun
            let objects =
                unsafe { resolve_candidates(section, &candidates[from..to], section.end(), types) };
            for (obj, size) in objects {
                if section.mark(obj) {
                    worker.push_gray(obj);
                    pinned.push((obj, size));
                }
            }
        }
        pinned
    }

    fn is_condemned(&self, addr: Address) -> bool {
        find_condemned(&self.condemned, addr).is_some()
    }

    fn trace(&self, obj: Address, _env: &TraceEnv<'_>, worker: &mut TraceWorker) -> Address {
        if let Some(section) = find_condemned(&self.condemned, obj)
            && section.mark(obj)
        {
            worker.push_gray(obj);
        }
        obj
    }

    fn live_address(&self, obj: Address) -> Option<Address> {
        find_condemned(&self.condemned, obj)
            .is_some_and(|s| s.is_marked(obj))
            .then_some(obj)
    }

    fn sweep(&mut self, types: &TypeTable) -> usize {
        let mut holes = Vec::new();
        let mut live_bytes = 0;
        let mut spare = false;
        let mut released = 0;
        for section in self.sections.snapshot() {
            match self.sweep_section(&section, types) {
                Some((live, section_holes)) => {
                    live_bytes += live;
                    holes.extend(section_holes);
                }
                None if !spare => {
                    spare = true;
                    holes.push(section.range());
                }
                None => {
                    self.sections.remove(section.start());
                    released += 1;
                }
            }
        }
        holes.sort_unstable_by_key(|h| h.start);
        gc_debug!(
            live_bytes,
            holes = holes.len(),
            released,
            "swept mark-sweep major heap"
        );
        *self.holes.lock() = holes;
        self.live_bytes.store(live_bytes, Ordering::Relaxed);
        self.allocated.store(0, Ordering::Relaxed);
        self.condemned.clear();
        live_bytes
    }

    fn finish(&mut self) {
        self.marking.store(false, Ordering::Release);
        self.condemned.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Descriptor;
    use crate::los::LargeObjectSpace;
    use crate::object::ObjectRef;
    use crate::trace::CollectionKind;
    use crate::types::{TypeInfo, TypeRegistry};
    use crate::workers::GrayWorker;

    #[test]
    fn test_mark_and_sweep_reuses_holes() {
        let registry = TypeRegistry::new();
        let ty = registry
            .register(TypeInfo::fixed("Node", 7, Descriptor::all_refs(1)))
            .unwrap();
        let types = registry.snapshot();
        let map = Arc::new(SectionMap::new());
        let mut major = MarkSweepMajor::new(MajorKind::MarkSweep, Arc::clone(&map), 64 * 1024);

        let objects: Vec<Address> = (0..4)
            .map(|_| {
                let obj = major.alloc_small(64).unwrap();
                unsafe { ObjectRef::new(obj).initialize(ty) };
                obj
            })
            .collect();
        // 0 -> 2; 1 and 3 are garbage
        unsafe { objects[0].word(1).store_address(objects[2]) };

        major.start();
        let nursery = Section::new(64 * 1024, SectionRole::Nursery).unwrap();
        let los = LargeObjectSpace::new();
        let mut worker = TraceWorker::new(0);
        {
            let env = TraceEnv::new(&types, nursery.range(), CollectionKind::Major, &major, &los);
            assert_eq!(major.trace(objects[0], &env, &mut worker), objects[0]);
            while let Some(obj) = worker.gray_queue().pop() {
                major.scan_object(obj, &env, &mut worker);
            }
        }
        assert_eq!(major.live_address(objects[2]), Some(objects[2]));
        assert_eq!(major.live_address(objects[1]), None);

        let live = major.sweep(&types);
        major.finish();
        assert_eq!(live, 128);
        unsafe {
            assert_eq!(objects[1].load(), 0);
            assert_eq!(ObjectRef::new(objects[2]).type_id(), ty);
        }
        // the first hole is where objects[1] lived
        let reused = major.alloc_small(64).unwrap();
        assert_eq!(reused, objects[1]);
        assert_eq!(major.used_bytes(), 192);
    }

    #[test]
    fn test_empty_sections_keep_one_spare() {
        let registry = TypeRegistry::new();
        let types = registry.snapshot();
        let map = Arc::new(SectionMap::new());
        let mut major = MarkSweepMajor::new(MajorKind::MarkSweep, Arc::clone(&map), 64 * 1024);
        for _ in 0..3 {
            // each request larger than half a section forces a new one
            major.alloc_small(40 * 1024).unwrap();
        }
        assert_eq!(map.len(), 3);
        major.start();
        assert_eq!(major.sweep(&types), 0);
        major.finish();
        assert_eq!(map.len(), 1);
        assert_eq!(major.hole_count(), 1);
    }
}
