//! Per-thread mutator context
//!
//! A [`Mutator`] is what a thread gets from [`GcHeap::attach`]. It owns the
//! thread's TLAB and store buffer, so the allocation fast path and the
//! barrier fast path touch no shared state. Everything else (refilling the
//! TLAB, registering roots, collecting) takes the collector lock.
//!
//! The collector lock is taken with a poll-aware spin: a thread waiting for
//! it parks if a pause is requested meanwhile, so the thread that holds the
//! lock and stops the world is never left waiting for it.

use crate::address::{Address, WORD_SIZE, align_size};
use crate::descriptor::Descriptor;
use crate::error::{GcError, GcResult};
use crate::heap::{CollectorContext, GcHeap, Generation, HeapInner, StackBounds, ThreadRecord};
use crate::log::{gc_debug, gc_warn};
use crate::los::MAX_SMALL_OBJECT_SIZE;
use crate::nursery::Tlab;
use crate::object::ObjectRef;
use crate::remset::StoreBuffer;
use crate::roots::{RootDescriptor, RootId};
use crate::types::{ObjectKind, TypeId, TypeInfo, TypeTable};
use crossbeam_utils::Backoff;
use parking_lot::MutexGuard;
use std::sync::Arc;

pub(crate) struct MutatorLocal {
    pub(crate) id: u64,
    pub(crate) tlab: Tlab,
    pub(crate) ssb: StoreBuffer,
    pub(crate) in_safe_region: bool,
}

impl MutatorLocal {
    /// Publish everything a pause needs from this thread
    pub(crate) fn retire(&mut self, heap: &HeapInner) {
        self.ssb.flush_into(&heap.remset);
        self.tlab = Tlab::empty();
    }
}

/// Park at the pending pause, if any
fn park(heap: &HeapInner, local: &mut MutatorLocal) {
    local.retire(heap);
    heap.safepoint.park();
}

/// Take the collector lock, parking whenever a pause is requested while
/// waiting
pub(crate) fn acquire<'h>(
    heap: &'h HeapInner,
    local: &mut MutatorLocal,
) -> MutexGuard<'h, CollectorContext> {
    let backoff = Backoff::new();
    loop {
        if let Some(guard) = heap.ctx.try_lock() {
            return guard;
        }
        if heap.safepoint.requested() {
            park(heap, local);
            backoff.reset();
        } else {
            backoff.snooze();
        }
    }
}

/// A thread attached to the heap
pub struct Mutator {
    pub(crate) heap: GcHeap,
    pub(crate) local: MutatorLocal,
    record: Arc<ThreadRecord>,
    types: Arc<TypeTable>,
}

impl Mutator {
    pub(crate) fn new(heap: GcHeap, id: u64, record: Arc<ThreadRecord>) -> Self {
        let local = MutatorLocal {
            id,
            tlab: Tlab::empty(),
            ssb: StoreBuffer::new(heap.inner.config.remset_size),
            in_safe_region: false,
        };
        let types = heap.inner.types.snapshot();
        Self {
            heap,
            local,
            record,
            types,
        }
    }

    /// Heap this thread is attached to
    pub fn heap(&self) -> &GcHeap {
        &self.heap
    }

    /// Thread id assigned at attach
    pub fn id(&self) -> u64 {
        self.local.id
    }

    /// Replace the conservatively scanned stack range
    pub fn set_stack_bounds(&self, bounds: StackBounds) {
        *self.record.stack.lock() = bounds;
    }

    /// Poll for a pending pause
    #[inline]
    pub fn safepoint(&mut self) {
        if self.heap.inner.safepoint.requested() {
            park(&self.heap.inner, &mut self.local);
        }
    }

    /// Announce blocking host code. Until [`Mutator::leave_safe_region`] the
    /// thread must not touch managed objects; pauses proceed without it and
    /// its stack is still scanned.
    pub fn enter_safe_region(&mut self) {
        debug_assert!(!self.local.in_safe_region, "safe regions do not nest");
        self.local.retire(&self.heap.inner);
        self.local.in_safe_region = true;
        self.heap.inner.safepoint.enter_safe_region();
    }

    /// Resume heap access, waiting out a running pause
    pub fn leave_safe_region(&mut self) {
        debug_assert!(self.local.in_safe_region, "not in a safe region");
        self.heap.inner.safepoint.leave_safe_region();
        self.local.in_safe_region = false;
    }

    /// Run `f` inside a safe region
    pub fn safe_region<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.enter_safe_region();
        let result = f();
        self.leave_safe_region();
        result
    }

    /// Detach the thread. Dropping the mutator does the same.
    pub fn detach(self) {}

    fn type_info(&mut self, ty: TypeId) -> GcResult<&TypeInfo> {
        if self.types.get(ty).is_none() {
            self.types = self.heap.inner.types.snapshot();
        }
        self.types.get(ty).ok_or(GcError::UnknownType(ty.as_u32()))
    }

    pub(crate) fn ensure_type(&mut self, ty: TypeId) -> GcResult<()> {
        self.type_info(ty).map(|_| ())
    }

    pub(crate) fn value_type_layout(&mut self, ty: TypeId) -> GcResult<(usize, Descriptor)> {
        let info = self.type_info(ty)?;
        match &info.kind {
            ObjectKind::ValueType { size, refs } => Ok((*size, refs.clone())),
            _ => Err(GcError::InvalidAllocation {
                name: info.name.to_string(),
                reason: "not a value type",
            }),
        }
    }

    pub(crate) fn types(&self) -> &TypeTable {
        &self.types
    }

    /// Allocate a fixed-size object of type `ty` with zeroed fields
    pub fn alloc(&mut self, ty: TypeId) -> GcResult<Address> {
        let info = self.type_info(ty)?;
        let size = match info.kind {
            ObjectKind::Fixed { .. } => info.instance_size(0),
            _ => {
                return Err(GcError::InvalidAllocation {
                    name: info.name.to_string(),
                    reason: "not a fixed-size type; use alloc_vector",
                });
            }
        };
        let obj = self.allocate(size)?;
        // SAFETY: fresh zeroed memory of the type's size
        unsafe { ObjectRef::new(obj).initialize(ty) };
        Ok(obj)
    }

    /// Allocate a vector or ephemeron table with `length` zeroed elements
    pub fn alloc_vector(&mut self, ty: TypeId, length: usize) -> GcResult<Address> {
        let info = self.type_info(ty)?;
        if !info.is_vector() {
            return Err(GcError::InvalidAllocation {
                name: info.name.to_string(),
                reason: "not a vector type",
            });
        }
        let Some(size) = info.checked_instance_size(length) else {
            return Err(GcError::InvalidAllocation {
                name: info.name.to_string(),
                reason: "vector length exceeds the address space",
            });
        };
        let obj = self.allocate(size)?;
        // SAFETY: fresh zeroed memory large enough for the length word; the
        // length is in place before the header makes the object walkable
        unsafe {
            obj.word(1).store(length);
            ObjectRef::new(obj).initialize(ty);
        }
        Ok(obj)
    }

    /// Allocate `size` zeroed bytes without collecting. The caller writes
    /// the header before the next safepoint.
    ///
    /// Fails with [`GcError::CollectionRequired`] when the nursery (or the
    /// large object allowance) is used up.
    pub fn try_allocate(&mut self, size: usize) -> GcResult<Address> {
        self.try_allocate_inner(size, true)
    }

    fn try_allocate_inner(&mut self, size: usize, respect_threshold: bool) -> GcResult<Address> {
        debug_assert!(!self.local.in_safe_region, "allocation inside a safe region");
        self.safepoint();
        let size = align_size(size.max(WORD_SIZE));
        if size > MAX_SMALL_OBJECT_SIZE {
            return self.allocate_large(size, respect_threshold);
        }
        if let Some(obj) = self.local.tlab.alloc(size, &self.heap.inner.nursery_section) {
            return Ok(obj);
        }
        self.refill(size)
    }

    fn refill(&mut self, size: usize) -> GcResult<Address> {
        let heap = Arc::clone(&self.heap.inner);
        let mut ctx = acquire(&heap, &mut self.local);
        if size > ctx.nursery.tlab_size() {
            if let Some(obj) = ctx.nursery.alloc_direct(size) {
                return Ok(obj);
            }
        } else if let Some(tlab) = ctx.nursery.new_tlab(size) {
            self.local.tlab = tlab;
            if let Some(obj) = self.local.tlab.alloc(size, &heap.nursery_section) {
                return Ok(obj);
            }
        }

        if ctx.nursery.is_degraded()
            && !ctx.nursery.degraded_exhausted()
            && let Some(obj) = ctx.major.alloc_small(size)
        {
            ctx.nursery.note_degraded_alloc(size);
            return Ok(obj);
        }
        Err(GcError::CollectionRequired { size })
    }

    fn allocate_large(&mut self, size: usize, respect_threshold: bool) -> GcResult<Address> {
        let heap = Arc::clone(&self.heap.inner);
        let ctx = acquire(&heap, &mut self.local);
        if respect_threshold && heap.los.used_bytes() + size > ctx.los_threshold {
            return Err(GcError::CollectionRequired { size });
        }
        if let Some(max) = heap.config.max_heap_size
            && heap.heap_size(&ctx) + size > max
        {
            return Err(GcError::CollectionRequired { size });
        }
        heap.los.alloc(size)
    }

    /// Allocate `size` zeroed bytes, collecting as needed. Fails with
    /// [`GcError::OutOfMemory`] only after a major collection.
    pub fn allocate(&mut self, size: usize) -> GcResult<Address> {
        if self.heap.inner.config.debug.collect_before_allocs {
            self.request_collection(Generation::Nursery, "collect-before-allocs")?;
        }
        match self.try_allocate(size) {
            Err(GcError::CollectionRequired { .. }) => {}
            other => return other,
        }

        if size <= MAX_SMALL_OBJECT_SIZE {
            self.collect_for(size, Generation::Nursery)?;
            match self.try_allocate(size) {
                Err(GcError::CollectionRequired { .. }) => {}
                other => return other,
            }
        }

        self.collect_for(size, Generation::Major)?;
        match self.try_allocate_inner(size, false) {
            Err(GcError::CollectionRequired { .. }) => {
                let heap = Arc::clone(&self.heap.inner);
                let ctx = acquire(&heap, &mut self.local);
                let heap_size = heap.heap_size(&ctx);
                gc_warn!(requested = size, heap_size, "out of memory");
                Err(GcError::OutOfMemory {
                    requested: size,
                    heap_size,
                })
            }
            other => other,
        }
    }

    /// Collect on behalf of an allocation of `size` bytes. A small request
    /// the rebuilt nursery cannot hold sends the nursery into degraded mode.
    fn collect_for(&mut self, size: usize, generation: Generation) -> GcResult<()> {
        gc_debug!(size, ?generation, "allocation needs a collection");
        self.collect(generation, "allocation failure")
            .map_err(|err| match err {
                GcError::OutOfMemory { heap_size, .. } => GcError::OutOfMemory {
                    requested: size,
                    heap_size,
                },
                other => other,
            })?;
        if size <= MAX_SMALL_OBJECT_SIZE {
            let size = align_size(size.max(WORD_SIZE));
            self.with_context(|ctx| ctx.nursery.degrade_unless_fits(size));
        }
        Ok(())
    }

    fn collect(&mut self, generation: Generation, reason: &str) -> GcResult<()> {
        let heap = Arc::clone(&self.heap.inner);
        let mut ctx = acquire(&heap, &mut self.local);
        self.local.retire(&heap);
        if generation == Generation::Major {
            ctx.major_requested = true;
        }
        heap.collect(&mut ctx, generation, reason, true)
    }

    /// Collect synchronously. A nursery collection is followed by a major
    /// one when a major trigger fires.
    pub fn request_collection(&mut self, generation: Generation, reason: &str) -> GcResult<()> {
        self.collect(generation, reason)
    }

    fn with_context<R>(&mut self, f: impl FnOnce(&mut CollectorContext) -> R) -> R {
        let heap = Arc::clone(&self.heap.inner);
        let mut ctx = acquire(&heap, &mut self.local);
        f(&mut ctx)
    }

    /// Register `size` bytes at `start` as a root. Conservative ranges pin
    /// what they point at; precise ranges are updated when objects move.
    /// Registering a start address again replaces the entry.
    ///
    /// # Safety
    /// The range must stay readable (and, if precise, writable) until it is
    /// deregistered.
    pub unsafe fn register_root(
        &mut self,
        start: Address,
        size: usize,
        descriptor: RootDescriptor,
    ) -> RootId {
        self.with_context(|ctx| ctx.roots.register(start, size, descriptor))
    }

    /// Register a precise root whose stores the host routes through the
    /// write barrier
    ///
    /// # Safety
    /// Same as [`Mutator::register_root`].
    pub unsafe fn register_wbarrier_root(
        &mut self,
        start: Address,
        size: usize,
        descriptor: Descriptor,
    ) -> RootId {
        self.with_context(|ctx| ctx.roots.register_wbarrier(start, size, descriptor))
    }

    /// Resize or re-describe a root. Returns `false` if `id` is unknown.
    ///
    /// # Safety
    /// Same as [`Mutator::register_root`] for the new extent.
    pub unsafe fn update_root(
        &mut self,
        id: RootId,
        new_size: usize,
        new_descriptor: RootDescriptor,
    ) -> bool {
        self.with_context(|ctx| ctx.roots.update(id, new_size, new_descriptor))
    }

    /// Remove a root. Returns `false` if it was not registered.
    pub fn deregister_root(&mut self, id: RootId) -> bool {
        self.with_context(|ctx| ctx.roots.deregister(id))
    }

    /// Number of registered roots
    pub fn root_count(&mut self) -> usize {
        self.with_context(|ctx| ctx.roots.len())
    }

    /// Track `obj` for finalization
    pub fn register_finalizer(&mut self, obj: Address) {
        self.with_context(|ctx| ctx.finalizers.register(obj));
    }

    /// Stop tracking `obj`. Returns `false` if it was not registered.
    pub fn unregister_finalizer(&mut self, obj: Address) -> bool {
        self.with_context(|ctx| ctx.finalizers.unregister(obj))
    }

    /// Take the objects whose finalizers may run. They stop being roots.
    pub fn take_ready_finalizers(&mut self) -> Vec<Address> {
        self.with_context(|ctx| ctx.finalizers.take_ready())
    }

    /// Store `obj` into the host slot `link` and keep it updated: moved
    /// objects are followed, dead ones nulled.
    ///
    /// # Safety
    /// `link` must stay a writable word until unregistered.
    pub unsafe fn register_weak_link(&mut self, link: Address, obj: Address) {
        // SAFETY: forwarded to the caller
        self.with_context(|ctx| unsafe { ctx.weak_links.register(link, obj) });
    }

    /// Stop updating `link`. Returns `false` if it was not registered.
    pub fn unregister_weak_link(&mut self, link: Address) -> bool {
        self.with_context(|ctx| ctx.weak_links.unregister(link))
    }

    /// Give `table` (an ephemeron object) ephemeron semantics. The table
    /// itself must be kept alive by ordinary references.
    pub fn register_ephemeron_table(&mut self, table: Address) {
        self.with_context(|ctx| ctx.ephemerons.register(table));
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        let heap = Arc::clone(&self.heap.inner);
        if self.local.in_safe_region {
            heap.safepoint.leave_safe_region();
            self.local.in_safe_region = false;
        }
        // no pause may run while the store buffer is published
        let _ctx = acquire(&heap, &mut self.local);
        self.local.retire(&heap);
        heap.threads.lock().remove(&self.local.id);
        heap.safepoint.detach();
        gc_debug!(thread = self.local.id, "mutator detached");
    }
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("id", &self.local.id)
            .field("buffered", &self.local.ssb.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::descriptor::Descriptor;

    fn heap() -> GcHeap {
        GcHeap::new(GcConfig {
            nursery_size: 256 * 1024,
            ..GcConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_tlab_fast_path_is_contiguous() {
        let heap = heap();
        let ty = heap
            .register_type(TypeInfo::fixed("Pair", 2, Descriptor::all_refs(2)))
            .unwrap();
        let mut mutator = heap.attach(StackBounds::EMPTY);
        let a = mutator.alloc(ty).unwrap();
        let b = mutator.alloc(ty).unwrap();
        assert_eq!(b, a.offset(24));
        assert!(heap.in_nursery(a));
        unsafe {
            assert_eq!(ObjectRef::new(a).type_id(), ty);
            assert!(a.word(1).load_address().is_null());
        }
    }

    #[test]
    fn test_wrong_entry_points() {
        let heap = heap();
        let fixed = heap
            .register_type(TypeInfo::fixed("Leaf", 1, Descriptor::pointer_free()))
            .unwrap();
        let vector = heap
            .register_type(TypeInfo::vector("Bytes", 1, crate::types::ElementRefs::PointerFree))
            .unwrap();
        let mut mutator = heap.attach(StackBounds::EMPTY);
        assert!(matches!(
            mutator.alloc_vector(fixed, 3),
            Err(GcError::InvalidAllocation { .. })
        ));
        assert!(matches!(mutator.alloc(vector), Err(GcError::InvalidAllocation { .. })));
        assert!(matches!(
            mutator.alloc(TypeId::from_raw(999)),
            Err(GcError::UnknownType(999))
        ));
        let bytes = mutator.alloc_vector(vector, 13).unwrap();
        assert_eq!(unsafe { bytes.word(1).load() }, 13);
    }

    #[test]
    fn test_try_allocate_signals_full_nursery() {
        let heap = heap();
        let mut mutator = heap.attach(StackBounds::EMPTY);
        let mut allocated = 0;
        let err = loop {
            match mutator.try_allocate(1024) {
                Ok(_) => allocated += 1024,
                Err(err) => break err,
            }
        };
        assert!(matches!(err, GcError::CollectionRequired { size: 1024 }));
        assert!(allocated > 200 * 1024);
        assert!(mutator.allocate(1024).is_ok());
        assert_eq!(heap.stats().minor_collections, 1);
    }

    #[test]
    fn test_registrations_and_detach() {
        let heap = heap();
        let mut mutator = heap.attach(StackBounds::EMPTY);
        let mut slots = [0usize; 4];
        let start = Address::from_ptr(slots.as_mut_ptr());
        unsafe {
            mutator.register_root(start, 16, RootDescriptor::Precise(Descriptor::all_refs(2)));
            mutator.register_root(start, 32, RootDescriptor::Precise(Descriptor::all_refs(4)));
        }
        assert_eq!(mutator.root_count(), 1);
        assert!(mutator.deregister_root(start));
        assert!(!mutator.deregister_root(start));
        assert_eq!(heap.attached_threads(), 1);
        mutator.detach();
        assert_eq!(heap.attached_threads(), 0);
        assert!(heap.inner.threads.lock().is_empty());
    }

    #[test]
    fn test_safe_region_lets_others_collect() {
        let heap = heap();
        let mut blocked = heap.attach(StackBounds::EMPTY);
        blocked.enter_safe_region();
        let other = heap.clone();
        std::thread::spawn(move || {
            let mut mutator = other.attach(StackBounds::EMPTY);
            mutator.request_collection(Generation::Nursery, "test").unwrap();
        })
        .join()
        .unwrap();
        blocked.leave_safe_region();
        assert_eq!(heap.stats().minor_collections, 1);
    }
}
