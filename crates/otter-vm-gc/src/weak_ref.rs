//! Weak links
//!
//! A weak link is a host-owned slot that holds an object reference without
//! keeping the object alive. After every collection the slot is rewritten to
//! the object's new address, or nulled if the object died.

use crate::address::Address;
use crate::trace::TraceEnv;
use rustc_hash::FxHashSet;

/// Registered weak link slots
#[derive(Default, Debug)]
pub struct WeakLinks {
    links: FxHashSet<Address>,
}

impl WeakLinks {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `obj` into `link` and track the slot
    ///
    /// # Safety
    /// `link` must stay a writable word until it is unregistered.
    pub unsafe fn register(&mut self, link: Address, obj: Address) {
        // SAFETY: forwarded to the caller
        unsafe { link.store_address(obj) };
        self.links.insert(link);
    }

    /// Stop tracking `link`. Returns `true` if it was registered.
    pub fn unregister(&mut self, link: Address) -> bool {
        self.links.remove(&link)
    }

    /// Number of tracked links
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// No links tracked
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Update every link after marking. Returns (updated, cleared).
    pub(crate) fn process(&self, env: &TraceEnv<'_>) -> (usize, usize) {
        let mut updated = 0;
        let mut cleared = 0;
        for &link in &self.links {
            // SAFETY: registered links stay valid until unregistered
            let target = unsafe { link.load_address() };
            if target.is_null() {
                continue;
            }
            match env.live_address(target) {
                Some(new) => {
                    if new != target {
                        // SAFETY: as above
                        unsafe { link.store_address(new) };
                        updated += 1;
                    }
                }
                None => {
                    // SAFETY: as above
                    unsafe { link.store_address(Address::NULL) };
                    cleared += 1;
                }
            }
        }
        (updated, cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MajorKind;
    use crate::descriptor::Descriptor;
    use crate::los::LargeObjectSpace;
    use crate::major::new_major;
    use crate::object::ObjectRef;
    use crate::section::{Section, SectionMap, SectionRole};
    use crate::trace::{CollectionKind, TraceWorker};
    use crate::types::{TypeInfo, TypeRegistry};
    use std::sync::Arc;

    #[test]
    fn test_links_follow_or_clear() {
        let registry = TypeRegistry::new();
        let ty = registry
            .register(TypeInfo::fixed("Leaf", 1, Descriptor::pointer_free()))
            .unwrap();
        let types = registry.snapshot();
        let nursery = Section::new(64 * 1024, SectionRole::Nursery).unwrap();
        let major = new_major(MajorKind::Copying, Arc::new(SectionMap::new()), 64 * 1024);
        let los = LargeObjectSpace::new();
        let live = nursery.bump(16).unwrap();
        let dead = nursery.bump(16).unwrap();
        unsafe {
            ObjectRef::new(live).initialize(ty);
            ObjectRef::new(dead).initialize(ty);
        }

        let mut slots = [0usize; 3];
        let base = Address::from_ptr(slots.as_mut_ptr());
        let mut links = WeakLinks::new();
        unsafe {
            links.register(base, live);
            links.register(base.word(1), dead);
            links.register(base.word(2), Address::NULL);
        }
        assert_eq!(links.len(), 3);
        assert!(links.unregister(base.word(2)));

        let env = TraceEnv::new(&types, nursery.range(), CollectionKind::Minor, &*major, &los);
        let mut worker = TraceWorker::new(0);
        let copy = unsafe { env.trace_value(live, &mut worker) };
        assert_eq!(links.process(&env), (1, 1));
        assert_eq!(slots[0], copy.as_usize());
        assert_eq!(slots[1], 0);
    }
}
