//! Ephemeron tables
//!
//! An ephemeron table is a vector of (key, value) word pairs. Scanning the
//! table object reports nothing; instead, after the main drain the
//! collector runs passes over every registered table, tracing the values
//! whose keys are already known live. Passes repeat until one discovers
//! nothing new. Entries whose keys never became live are then cleared.
//!
//! ```text
//! [header][length][k0][v0][k1][v1]...
//! ```

use crate::address::{Address, AddressRange};
use crate::log::gc_debug;
use crate::trace::{TraceEnv, TraceWorker};
use crate::types::VECTOR_HEADER_WORDS;
use crate::workers::GrayWorker;

/// Registered ephemeron tables
#[derive(Default, Debug)]
pub struct EphemeronTables {
    tables: Vec<Address>,
}

impl EphemeronTables {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a table object
    pub fn register(&mut self, table: Address) {
        if !self.tables.contains(&table) {
            self.tables.push(table);
        }
    }

    /// Number of tracked tables
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// No tables tracked
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Current table addresses
    pub fn tables(&self) -> &[Address] {
        &self.tables
    }

    /// Extents of the tables that live outside the nursery, sorted. Their
    /// slots are only ever visited by the ephemeron passes.
    pub(crate) fn old_table_ranges(&self, env: &TraceEnv<'_>) -> Vec<AddressRange> {
        let mut ranges: Vec<AddressRange> = self
            .tables
            .iter()
            .filter(|t| !env.nursery().contains(**t))
            .map(|&t| {
                // SAFETY: registered tables are ephemeron objects
                let length = unsafe { t.word(1).load() };
                AddressRange::new(t, t.word(VECTOR_HEADER_WORDS + 2 * length))
            })
            .collect();
        ranges.sort_unstable_by_key(|r| r.start);
        ranges
    }

    /// One pass: trace the value of every entry whose key is live. Returns
    /// `true` when the pass queued new gray objects.
    fn mark_pass(&self, env: &TraceEnv<'_>, worker: &mut TraceWorker) -> bool {
        for &table in &self.tables {
            let Some(table) = env.live_address(table) else {
                continue;
            };
            // SAFETY: a live table is a complete ephemeron object
            unsafe {
                for_each_entry(table, &mut |key_slot, value_slot| {
                    let key = key_slot.load_address();
                    if key.is_null() {
                        return;
                    }
                    if let Some(new_key) = env.live_address(key) {
                        env.update_weak_slot(key_slot, key, new_key, worker);
                        env.trace_slot(value_slot, worker);
                    }
                });
            }
        }
        !worker.gray_queue().is_empty()
    }

    /// Run passes until a fixed point. `drain` empties the gray queue
    /// between passes. Returns the number of passes.
    pub(crate) fn mark_to_fixed_point(
        &self,
        env: &TraceEnv<'_>,
        worker: &mut TraceWorker,
        drain: &mut dyn FnMut(&mut TraceWorker),
    ) -> usize {
        let mut passes = 1;
        while self.mark_pass(env, worker) {
            drain(worker);
            passes += 1;
        }
        passes
    }

    /// Clear entries with dead keys, forget dead tables and record the new
    /// address of moved ones. Returns the number of cleared entries.
    pub(crate) fn clear_dead(&mut self, env: &TraceEnv<'_>, worker: &mut TraceWorker) -> usize {
        let mut cleared = 0;
        let before = self.tables.len();
        self.tables.retain_mut(|table| {
            let Some(live) = env.live_address(*table) else {
                return false;
            };
            *table = live;
            // SAFETY: a live table is a complete ephemeron object
            unsafe {
                for_each_entry(live, &mut |key_slot, value_slot| {
                    let key = key_slot.load_address();
                    if key.is_null() {
                        return;
                    }
                    match env.live_address(key) {
                        Some(new_key) => env.update_weak_slot(key_slot, key, new_key, worker),
                        None => {
                            key_slot.store_address(Address::NULL);
                            value_slot.store_address(Address::NULL);
                            cleared += 1;
                        }
                    }
                });
            }
            true
        });
        gc_debug!(
            cleared,
            dropped_tables = before - self.tables.len(),
            "cleared dead ephemeron entries"
        );
        cleared
    }
}

/// Call `f(key_slot, value_slot)` for every entry of `table`
///
/// # Safety
/// `table` must be a complete ephemeron object.
unsafe fn for_each_entry(table: Address, f: &mut dyn FnMut(Address, Address)) {
    // SAFETY: forwarded to the caller
    let length = unsafe { table.word(1).load() };
    for i in 0..length {
        let key_slot = table.word(VECTOR_HEADER_WORDS + 2 * i);
        f(key_slot, key_slot.word(1));
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
    use crate::trace::CollectionKind;
    use crate::types::{TypeInfo, TypeRegistry};
    use std::sync::Arc;

    #[test]
    fn test_fixed_point_follows_chains() {
        let registry = TypeRegistry::new();
        let cell = registry
            .register(TypeInfo::fixed("Cell", 1, Descriptor::all_refs(1)))
            .unwrap();
        let table_ty = registry.register(TypeInfo::ephemeron("Table")).unwrap();
        let types = registry.snapshot();
        let nursery = Section::new(64 * 1024, SectionRole::Nursery).unwrap();
        let major = new_major(MajorKind::Copying, Arc::new(SectionMap::new()), 64 * 1024);
        let los = LargeObjectSpace::new();

        let new_cell = || {
            let obj = nursery.bump(16).unwrap();
            unsafe { ObjectRef::new(obj).initialize(cell) };
            obj
        };
        let root = new_cell();
        let value_a = new_cell();
        let value_b = new_cell();
        let dead_key = new_cell();
        let dead_value = new_cell();
        // the table lives outside the nursery
        let mut table = vec![0usize; 2 + 6];
        let table_addr = Address::from_ptr(table.as_mut_ptr());
        unsafe {
            ObjectRef::new(table_addr).initialize(table_ty);
            table_addr.word(1).store(3);
            // value_a -> value_b only becomes live after root -> value_a
            table_addr.word(2).store_address(value_a);
            table_addr.word(3).store_address(value_b);
            table_addr.word(4).store_address(root);
            table_addr.word(5).store_address(value_a);
            table_addr.word(6).store_address(dead_key);
            table_addr.word(7).store_address(dead_value);
        }
        let mut tables = EphemeronTables::new();
        tables.register(table_addr);
        tables.register(table_addr);
        assert_eq!(tables.len(), 1);

        let env = TraceEnv::new(&types, nursery.range(), CollectionKind::Minor, &*major, &los);
        let mut worker = TraceWorker::new(0);
        let root_copy = unsafe { env.trace_value(root, &mut worker) };
        let mut drain = |w: &mut TraceWorker| {
            while let Some(obj) = w.gray_queue().pop() {
                unsafe { env.scan_object(obj, w) };
            }
        };
        drain(&mut worker);
        let passes = tables.mark_to_fixed_point(&env, &mut worker, &mut drain);
        assert_eq!(passes, 3);
        assert_eq!(tables.clear_dead(&env, &mut worker), 1);
        unsafe {
            assert_eq!(table_addr.word(4).load_address(), root_copy);
            assert_eq!(table_addr.word(2).load_address(), table_addr.word(5).load_address());
            assert!(!nursery.contains(table_addr.word(3).load_address()));
            assert!(table_addr.word(6).load_address().is_null());
            assert!(table_addr.word(7).load_address().is_null());
        }
        assert_eq!(env.live_address(dead_value), None);
        let ranges = tables.old_table_ranges(&env);
        assert_eq!(ranges, vec![AddressRange::new(table_addr, table_addr.word(8))]);
    }
}
