//! Copying major strategy
//!
//! Every major collection evacuates the reachable objects into fresh
//! sections. A condemned section holding pinned objects survives: its dead
//! space is zeroed and allocation continues after the last pinned object.

use super::{Lab, MajorCollector, find_condemned};
use crate::address::Address;
use crate::config::MajorKind;
use crate::log::gc_debug;
use crate::object::{HeaderState, ObjectRef};
use crate::pin::{PinQueue, pin_candidates};
use crate::section::{Section, SectionMap, SectionRole};
use crate::trace::{TraceEnv, TraceWorker};
use crate::types::TypeTable;
use parking_lot::Mutex;
use std::sync::Arc;

/// Sections with less free tail than this stop taking allocations
const MIN_OPEN_TAIL: usize = 256;

/// Evacuating major collector
pub struct CopyingMajor {
    sections: Arc<SectionMap>,
    section_size: usize,
    /// Sections with room after their bump pointer
    open: Mutex<Vec<Arc<Section>>>,
    condemned: Vec<Arc<Section>>,
    pinned: Vec<(Address, usize)>,
}

impl CopyingMajor {
    /// Strategy allocating sections of `section_size` bytes into `sections`
    pub fn new(sections: Arc<SectionMap>, section_size: usize) -> Self {
        Self {
            sections,
            section_size,
            open: Mutex::new(Vec::new()),
            condemned: Vec::new(),
            pinned: Vec::new(),
        }
    }
}

impl MajorCollector for CopyingMajor {
    fn kind(&self) -> MajorKind {
        MajorKind::Copying
    }

    fn used_bytes(&self) -> usize {
        self.sections
            .snapshot()
            .iter()
            .map(|s| s.next_data().diff(s.start()))
            .sum()
    }

    fn heap_bytes(&self) -> usize {
        self.sections.reserved_bytes()
    }

    fn alloc_lab(&self, min: usize, preferred: usize) -> Option<Lab> {
        let mut open = self.open.lock();
        open.retain(|s| s.free_tail() >= MIN_OPEN_TAIL);
        let section = match open.iter().find(|s| s.free_tail() >= min) {
            Some(section) => Arc::clone(section),
            None => {
                let section =
                    Arc::new(Section::new(self.section_size.max(min), SectionRole::Major).ok()?);
                self.sections.insert(Arc::clone(&section));
                open.push(Arc::clone(&section));
                section
            }
        };
        let len = preferred.max(min).min(section.free_tail());
        let start = section.bump(len)?;
        Some(Lab::new(section, start, start.offset(len)))
    }

    fn start(&mut self) {
        self.condemned = self.sections.snapshot();
        self.pinned.clear();
        // survivors go to fresh sections
        self.open.lock().clear();
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
            let next = section.next_data();
            // SAFETY: condemned sections are walkable and nothing moved yet
            let objects = unsafe { pin_candidates(section, &candidates[from..to], next, types) };
            for &(obj, _) in &objects {
                worker.push_gray(obj);
            }
            pinned.extend(objects);
        }
        self.pinned.extend_from_slice(&pinned);
        pinned
    }

    fn is_condemned(&self, addr: Address) -> bool {
        find_condemned(&self.condemned, addr).is_some()
    }

    fn trace(&self, obj: Address, env: &TraceEnv<'_>, worker: &mut TraceWorker) -> Address {
        // SAFETY: `obj` lies in a condemned section
        unsafe { env.evacuate(obj, worker) }
    }

    fn live_address(&self, obj: Address) -> Option<Address> {
        // SAFETY: condemned references point at object headers
        match unsafe { ObjectRef::new(obj).header() } {
            HeaderState::Forwarded(to) => Some(to),
            HeaderState::Pinned(_) => Some(obj),
            _ => None,
        }
    }

    fn sweep(&mut self, _types: &TypeTable) -> usize {
        self.pinned.sort_unstable();
        let mut kept = 0;
        let mut released = 0;
        for section in &self.condemned {
            let from = self.pinned.partition_point(|(a, _)| *a < section.start());
            let to = self.pinned.partition_point(|(a, _)| *a < section.end());
            if from == to {
                self.sections.remove(section.start());
                released += 1;
                continue;
            }
            section.clear_scan_starts();
            let mut cursor = section.start();
            for &(obj, size) in &self.pinned[from..to] {
                section.zero(cursor, obj);
                // SAFETY: pinned objects are live objects of this section
                unsafe { ObjectRef::new(obj).unpin() };
                section.record_scan_start(obj);
                cursor = obj.offset(size);
            }
            section.zero(cursor, section.next_data());
            section.set_next_data(cursor);
            self.open.lock().push(Arc::clone(section));
            kept += 1;
        }
        gc_debug!(kept, released, pinned = self.pinned.len(), "swept copying major heap");
        self.condemned.clear();
        self.used_bytes()
    }

    fn finish(&mut self) {
        self.condemned.clear();
        self.pinned.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Descriptor;
    use crate::los::LargeObjectSpace;
    use crate::section::SectionRole;
    use crate::trace::CollectionKind;
    use crate::types::{TypeInfo, TypeRegistry};
    use crate::workers::GrayWorker;

    #[test]
    fn test_major_copy_keeps_pinned_sections() {
        let registry = TypeRegistry::new();
        let ty = registry
            .register(TypeInfo::fixed("Cell", 1, Descriptor::all_refs(1)))
            .unwrap();
        let types = registry.snapshot();
        let map = Arc::new(SectionMap::new());
        let mut major = CopyingMajor::new(Arc::clone(&map), 64 * 1024);

        let alloc = |major: &CopyingMajor| {
            let obj = major.alloc_small(16).unwrap();
            unsafe { ObjectRef::new(obj).initialize(ty) };
            obj
        };
        let pinned = alloc(&major);
        let moved = alloc(&major);
        let dead = alloc(&major);
        unsafe { pinned.word(1).store_address(moved) };
        let old_section = map.find(pinned).unwrap().start();

        major.start();
        let mut queue = PinQueue::new();
        queue.add(pinned.offset(8), &[map.find(pinned).unwrap().range()]);
        queue.optimize();
        let candidates = major.find_pin_candidates(&queue);
        let nursery = Section::new(64 * 1024, SectionRole::Nursery).unwrap();
        let los = LargeObjectSpace::new();
        let mut worker = TraceWorker::new(0);
        let found = major.pin_and_enqueue(&candidates, &types, &mut worker);
        assert_eq!(found, vec![(pinned, 16)]);

        {
            let env = TraceEnv::new(&types, nursery.range(), CollectionKind::Major, &major, &los);
            let mut drained = Vec::new();
            while let Some(obj) = worker.gray_queue().pop() {
                drained.push(obj);
                major.scan_object(obj, &env, &mut worker);
            }
            assert_eq!(drained[0], pinned);
        }
        let new_moved = unsafe { pinned.word(1).load_address() };
        assert_ne!(new_moved, moved);
        assert_eq!(major.live_address(dead), None);

        major.sweep(&types);
        major.finish();
        // the pinned section survives, trimmed after the pinned object
        let section = map.find(pinned).unwrap();
        assert_eq!(section.start(), old_section);
        assert_eq!(section.next_data(), pinned.offset(16));
        unsafe {
            assert!(!ObjectRef::new(pinned).is_pinned());
            assert_eq!(ObjectRef::new(new_moved).type_id(), ty);
            assert_eq!(moved.load(), 0);
        }
    }
}
