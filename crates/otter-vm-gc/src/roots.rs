//! Root registry
//!
//! Collaborators register memory ranges that hold references into the heap.
//! Entries are keyed on the range start and kept in three buckets so each
//! collection phase only walks what it needs:
//!
//! - **normal**: precise roots, scanned by every collection
//! - **write-barrier**: precise roots whose stores go through the barrier.
//!   The barrier only records heap slots, so these are scanned by every
//!   collection as well
//! - **pinned**: conservative ranges; every word is a pinning candidate

use crate::address::Address;
use crate::descriptor::Descriptor;
use rustc_hash::FxHashMap;

/// Layout of a root range
#[derive(Clone, Debug)]
pub enum RootDescriptor {
    /// Any word may be a reference; referents are pinned
    Conservative,
    /// Exactly the described words are references
    Precise(Descriptor),
}

/// Bucket a root lives in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RootKind {
    /// Precise, always scanned
    Normal,
    /// Precise, covered by write barriers
    WriteBarrier,
    /// Conservative
    Pinned,
}

impl RootKind {
    const ALL: [RootKind; 3] = [RootKind::Normal, RootKind::WriteBarrier, RootKind::Pinned];

    fn index(self) -> usize {
        match self {
            RootKind::Normal => 0,
            RootKind::WriteBarrier => 1,
            RootKind::Pinned => 2,
        }
    }
}

/// Identifier of a registered root: its start address
pub type RootId = Address;

/// A registered range
#[derive(Clone, Debug)]
pub struct RootRecord {
    /// First byte of the range
    pub start: Address,
    /// Size in bytes
    pub size: usize,
    /// Layout
    pub descriptor: RootDescriptor,
}

impl RootRecord {
    /// One past the last byte
    pub fn end(&self) -> Address {
        self.start.offset(self.size)
    }
}

/// The registry
#[derive(Default)]
pub struct RootRegistry {
    buckets: [FxHashMap<Address, RootRecord>; 3],
    total_size: usize,
}

impl RootRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a range. Conservative descriptors go to the pinned bucket,
    /// precise ones to the normal bucket.
    pub fn register(&mut self, start: Address, size: usize, descriptor: RootDescriptor) -> RootId {
        let kind = match descriptor {
            RootDescriptor::Conservative => RootKind::Pinned,
            RootDescriptor::Precise(_) => RootKind::Normal,
        };
        self.register_in(kind, start, size, descriptor)
    }

    /// Register a precise range whose stores go through the write barrier
    pub fn register_wbarrier(
        &mut self,
        start: Address,
        size: usize,
        descriptor: Descriptor,
    ) -> RootId {
        self.register_in(
            RootKind::WriteBarrier,
            start,
            size,
            RootDescriptor::Precise(descriptor),
        )
    }

    fn register_in(
        &mut self,
        kind: RootKind,
        start: Address,
        size: usize,
        descriptor: RootDescriptor,
    ) -> RootId {
        for other in RootKind::ALL {
            if other != kind
                && let Some(old) = self.buckets[other.index()].remove(&start)
            {
                self.total_size -= old.size;
            }
        }
        let record = RootRecord {
            start,
            size,
            descriptor,
        };
        if let Some(old) = self.buckets[kind.index()].insert(start, record) {
            self.total_size -= old.size;
        }
        self.total_size += size;
        start
    }

    /// Change the size and layout of an existing root. Returns `false` if
    /// `id` is not registered.
    pub fn update(&mut self, id: RootId, new_size: usize, new_descriptor: RootDescriptor) -> bool {
        let Some(kind) = self.kind_of(id) else {
            return false;
        };
        let kind = match (&new_descriptor, kind) {
            (RootDescriptor::Conservative, _) => RootKind::Pinned,
            (RootDescriptor::Precise(_), RootKind::Pinned) => RootKind::Normal,
            (RootDescriptor::Precise(_), kind) => kind,
        };
        self.register_in(kind, id, new_size, new_descriptor);
        true
    }

    /// Remove a root. Returns `false` if it was not registered.
    pub fn deregister(&mut self, id: RootId) -> bool {
        for bucket in &mut self.buckets {
            if let Some(old) = bucket.remove(&id) {
                self.total_size -= old.size;
                return true;
            }
        }
        false
    }

    /// Bucket holding `id`
    pub fn kind_of(&self, id: RootId) -> Option<RootKind> {
        RootKind::ALL
            .into_iter()
            .find(|kind| self.buckets[kind.index()].contains_key(&id))
    }

    /// Look up a root
    pub fn get(&self, id: RootId) -> Option<&RootRecord> {
        self.buckets.iter().find_map(|bucket| bucket.get(&id))
    }

    /// Iterate over one bucket
    pub fn iter(&self, kind: RootKind) -> impl Iterator<Item = &RootRecord> + '_ {
        self.buckets[kind.index()].values()
    }

    /// Number of registered roots
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    /// No roots registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes covered by all roots
    pub fn total_size(&self) -> usize {
        self.total_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(raw: usize) -> Address {
        Address::from_usize(raw)
    }

    #[test]
    fn test_buckets_by_descriptor() {
        let mut roots = RootRegistry::new();
        roots.register(addr(0x1000), 64, RootDescriptor::Conservative);
        roots.register(addr(0x2000), 32, RootDescriptor::Precise(Descriptor::all_refs(4)));
        roots.register_wbarrier(addr(0x3000), 16, Descriptor::SmallBitmap(0b11));
        assert_eq!(roots.kind_of(addr(0x1000)), Some(RootKind::Pinned));
        assert_eq!(roots.kind_of(addr(0x2000)), Some(RootKind::Normal));
        assert_eq!(roots.kind_of(addr(0x3000)), Some(RootKind::WriteBarrier));
        assert_eq!(roots.iter(RootKind::Normal).count(), 1);
        assert_eq!(roots.total_size(), 112);
    }

    #[test]
    fn test_duplicate_registration_updates() {
        let mut roots = RootRegistry::new();
        roots.register(addr(0x1000), 64, RootDescriptor::Precise(Descriptor::all_refs(8)));
        roots.register(addr(0x1000), 128, RootDescriptor::Precise(Descriptor::all_refs(16)));
        assert_eq!(roots.len(), 1);
        assert_eq!(roots.get(addr(0x1000)).unwrap().size, 128);
        assert_eq!(roots.total_size(), 128);

        // moving to another bucket still leaves a single entry
        roots.register(addr(0x1000), 8, RootDescriptor::Conservative);
        assert_eq!(roots.len(), 1);
        assert_eq!(roots.kind_of(addr(0x1000)), Some(RootKind::Pinned));
        assert_eq!(roots.total_size(), 8);
    }

    #[test]
    fn test_update_and_deregister() {
        let mut roots = RootRegistry::new();
        let id = roots.register_wbarrier(addr(0x4000), 16, Descriptor::all_refs(2));
        assert!(roots.update(id, 24, RootDescriptor::Precise(Descriptor::all_refs(3))));
        assert_eq!(roots.kind_of(id), Some(RootKind::WriteBarrier));
        assert_eq!(roots.get(id).unwrap().end(), addr(0x4018));
        assert!(!roots.update(addr(0x9000), 8, RootDescriptor::Conservative));
        assert!(roots.deregister(id));
        assert!(!roots.deregister(id));
        assert!(roots.is_empty());
        assert_eq!(roots.total_size(), 0);
    }
}
