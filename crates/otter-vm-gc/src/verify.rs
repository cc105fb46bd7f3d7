//! Remembered set consistency check
//!
//! Walks every object outside the nursery and checks that each slot
//! referring into the nursery is covered by a remembered set entry (or a
//! dirty card) and refers to a well-formed object. Any violation is heap
//! corruption and fatal.

use crate::address::Address;
use crate::config::BarrierKind;
use crate::heap::{CollectorContext, HeapInner};
use crate::log::gc_debug;
use crate::object::{HeaderState, ObjectRef};
use crate::remset::RemsetEntry;
use crate::section::WalkControl;
use crate::trace::for_each_slot;
use crate::types::{ObjectKind, TypeTable};
use rustc_hash::FxHashSet;

/// Slots named by the global remembered set
fn covered_slots(heap: &HeapInner, types: &TypeTable) -> FxHashSet<Address> {
    let mut covered = FxHashSet::default();
    heap.remset.for_each(&mut |entry| match *entry {
        RemsetEntry::Location(slot) => {
            covered.insert(slot);
        }
        RemsetEntry::Range { start, count } => {
            covered.extend((0..count).map(|i| start.word(i)));
        }
        RemsetEntry::Object(obj) => {
            // SAFETY: remembered objects are complete objects
            unsafe {
                for_each_slot(types, obj, &mut |slot| {
                    covered.insert(slot);
                })
            };
        }
        RemsetEntry::ValueType { dest, count, ty } => {
            if let Some(info) = types.get(ty)
                && let ObjectKind::ValueType { size, refs } = &info.kind
            {
                for i in 0..count {
                    refs.for_each_reference(dest.offset(i * size), types.complex(), &mut |slot| {
                        covered.insert(slot);
                    });
                }
            }
        }
    });
    covered
}

/// Check every old-to-young slot. Runs with the world stopped (or the
/// collector lock held) and every store buffer flushed.
pub(crate) fn check_remembered_sets(heap: &HeapInner, _ctx: &CollectorContext, types: &TypeTable) {
    let nursery = heap.nursery_range;
    let barrier = heap.config.barrier;
    let covered = match barrier {
        BarrierKind::Remset => covered_slots(heap, types),
        BarrierKind::CardTable => FxHashSet::default(),
    };
    let mut checked = 0usize;

    let mut check = |slot: Address| {
        // SAFETY: reported slots belong to walkable objects
        let value = unsafe { slot.load_address() };
        if !nursery.contains(value) {
            return;
        }
        checked += 1;
        // SAFETY: nursery references point at object headers
        match unsafe { ObjectRef::new(value).header() } {
            HeaderState::Normal(ty) if types.get(ty).is_some() => {}
            state => crate::gc_fatal!("slot {slot} refers to {value} with header {state:?}"),
        }
        let remembered = match barrier {
            BarrierKind::Remset => covered.contains(&slot),
            BarrierKind::CardTable => match heap.sections.find(slot) {
                Some(section) => section.is_card_dirty(slot),
                None => heap.los.is_dirty(slot),
            },
        };
        if !remembered {
            crate::gc_fatal!("slot {slot} refers to nursery object {value} but is not remembered");
        }
    };

    for section in heap.sections.snapshot() {
        // SAFETY: major sections are walkable outside a pause
        unsafe {
            section.walk(section.start(), section.end(), types, &mut |obj, _| {
                for_each_slot(types, obj, &mut check);
                WalkControl::Continue
            });
        }
    }
    for (obj, _) in heap.los.objects() {
        // SAFETY: large objects are complete objects
        unsafe { for_each_slot(types, obj, &mut check) };
    }
    gc_debug!(checked, "remembered sets verified");
}

#[cfg(test)]
mod tests {
    use crate::config::{BarrierKind, GcConfig};
    use crate::descriptor::Descriptor;
    use crate::heap::{GcHeap, StackBounds};
    use crate::types::{ElementRefs, TypeInfo};

    fn old_to_young(barrier: BarrierKind, use_barrier: bool) {
        let heap = GcHeap::new(GcConfig {
            barrier,
            nursery_size: 256 * 1024,
            ..GcConfig::default()
        })
        .unwrap();
        let cell = heap
            .register_type(TypeInfo::fixed("Cell", 1, Descriptor::all_refs(1)))
            .unwrap();
        let refs = heap
            .register_type(TypeInfo::vector("Refs", 8, ElementRefs::AllRefs))
            .unwrap();
        let mut mutator = heap.attach(StackBounds::EMPTY);
        let old = mutator.alloc_vector(refs, 9000).unwrap();
        let young = mutator.alloc(cell).unwrap();
        unsafe {
            if use_barrier {
                mutator.store_array_element(old, old.word(7), young);
            } else {
                old.word(7).store_address(young);
            }
        }
        // publish the store buffer
        mutator.enter_safe_region();
        heap.verify();
        mutator.leave_safe_region();
    }

    #[test]
    fn test_barrier_stores_pass() {
        old_to_young(BarrierKind::Remset, true);
        old_to_young(BarrierKind::CardTable, true);
    }

    #[test]
    #[should_panic(expected = "is not remembered")]
    fn test_missing_entry_is_fatal() {
        old_to_young(BarrierKind::Remset, false);
    }

    #[test]
    #[should_panic(expected = "is not remembered")]
    fn test_missing_card_is_fatal() {
        old_to_young(BarrierKind::CardTable, false);
    }
}
