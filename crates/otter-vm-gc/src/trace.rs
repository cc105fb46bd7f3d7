//! Tracing and evacuation
//!
//! [`TraceEnv`] is the read-only state of one pause: the type snapshot, the
//! nursery range, what kind of collection runs and the major strategy. Each
//! collector thread owns a [`TraceWorker`] with its gray queue, its promotion
//! buffer and the slots it found still pointing into the nursery.
//!
//! Copying follows the header state machine: a worker claims the object,
//! copies it into its promotion buffer and publishes the forwarding address.
//! Every other worker that reaches the object waits for the claim to resolve
//! and rewrites its slot to the same copy.

use crate::address::{Address, AddressRange, WORD_SIZE};
use crate::gray::GrayQueue;
use crate::los::LargeObjectSpace;
use crate::major::{Lab, MajorCollector};
use crate::object::{Claim, HeaderState, ObjectRef};
use crate::roots::{RootDescriptor, RootKind, RootRegistry};
use crate::types::{ElementRefs, ObjectKind, TypeId, TypeTable, VECTOR_HEADER_WORDS};
use crate::workers::{GrayScanner, GrayWorker};

/// Preferred size of a promotion buffer
pub const PROMOTION_LAB_SIZE: usize = 32 * 1024;

/// Which generations a pause collects
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectionKind {
    /// Nursery only
    Minor,
    /// Nursery, major heap and large objects
    Major,
}

/// Shared, read-only state of a pause
pub struct TraceEnv<'a> {
    types: &'a TypeTable,
    nursery: AddressRange,
    kind: CollectionKind,
    major: &'a dyn MajorCollector,
    los: &'a LargeObjectSpace,
}

/// Per-thread state of a pause
pub struct TraceWorker {
    id: usize,
    gray: GrayQueue,
    lab: Option<Lab>,
    /// Heap slots left pointing at pinned nursery objects
    remembered: Vec<Address>,
    promoted_bytes: usize,
    promoted_objects: usize,
    scanned_objects: usize,
}

impl TraceWorker {
    /// Fresh worker state
    pub fn new(id: usize) -> Self {
        Self {
            id,
            gray: GrayQueue::new(),
            lab: None,
            remembered: Vec::new(),
            promoted_bytes: 0,
            promoted_objects: 0,
            scanned_objects: 0,
        }
    }

    /// Thread index, 0 for the coordinator
    pub fn id(&self) -> usize {
        self.id
    }

    /// Queue an object for scanning
    #[inline]
    pub fn push_gray(&mut self, obj: Address) {
        self.gray.push(obj);
    }

    /// Bytes promoted by this worker
    pub fn promoted_bytes(&self) -> usize {
        self.promoted_bytes
    }

    /// Objects promoted by this worker
    pub fn promoted_objects(&self) -> usize {
        self.promoted_objects
    }

    /// Objects scanned by this worker
    pub fn scanned_objects(&self) -> usize {
        self.scanned_objects
    }

    /// Take the slots that must be remembered after the pause
    pub fn take_remembered(&mut self) -> Vec<Address> {
        std::mem::take(&mut self.remembered)
    }

    fn alloc_promotion(&mut self, size: usize, major: &dyn MajorCollector) -> Address {
        if let Some(lab) = self.lab.as_mut()
            && let Some(dest) = lab.alloc(size)
        {
            return dest;
        }
        let Some(mut lab) = major.alloc_lab(size, PROMOTION_LAB_SIZE.max(size)) else {
            crate::gc_fatal!("out of memory while promoting {size} bytes");
        };
        let Some(dest) = lab.alloc(size) else {
            crate::gc_fatal!("promotion buffer of {} bytes cannot hold {size}", lab.remaining());
        };
        self.lab = Some(lab);
        dest
    }
}

impl GrayWorker for TraceWorker {
    fn gray_queue(&mut self) -> &mut GrayQueue {
        &mut self.gray
    }
}

impl<'a> TraceEnv<'a> {
    /// State for one pause
    pub fn new(
        types: &'a TypeTable,
        nursery: AddressRange,
        kind: CollectionKind,
        major: &'a dyn MajorCollector,
        los: &'a LargeObjectSpace,
    ) -> Self {
        Self {
            types,
            nursery,
            kind,
            major,
            los,
        }
    }

    /// Type snapshot of the pause
    pub fn types(&self) -> &TypeTable {
        self.types
    }

    /// Nursery range
    pub fn nursery(&self) -> AddressRange {
        self.nursery
    }

    /// Kind of pause
    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    /// Copy a condemned object out of its space, or find its existing copy.
    /// Pinned objects stay where they are.
    ///
    /// # Safety
    /// `obj` must be the start of an object inside a condemned space.
    pub unsafe fn evacuate(&self, obj: Address, worker: &mut TraceWorker) -> Address {
        let object = ObjectRef::new(obj);
        // SAFETY: forwarded to the caller
        match unsafe { object.claim() } {
            Claim::Forwarded(to) => to,
            Claim::Pinned => obj,
            Claim::Won(ty) => {
                // SAFETY: the claim keeps the type and length stable
                let size = unsafe { self.types.object_size(obj, ty) };
                let dest = worker.alloc_promotion(size, self.major);
                // SAFETY: `dest` is fresh memory of `size` bytes; the source is
                // a complete object owned by this worker's claim
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        obj.word(1).as_mut_ptr::<u8>(),
                        dest.word(1).as_mut_ptr::<u8>(),
                        size - WORD_SIZE,
                    );
                    ObjectRef::new(dest).initialize(ty);
                    object.forward_to(dest);
                }
                if let Some(lab) = worker.lab.as_ref() {
                    lab.section().record_scan_start(dest);
                }
                self.major.note_promoted(dest);
                worker.promoted_bytes += size;
                worker.promoted_objects += 1;
                worker.gray.push(dest);
                dest
            }
        }
    }

    /// Make `value` live and return its address after the pause
    ///
    /// # Safety
    /// `value` must be null or the start of a managed object.
    pub unsafe fn trace_value(&self, value: Address, worker: &mut TraceWorker) -> Address {
        if value.is_null() {
            return value;
        }
        if self.nursery.contains(value) {
            // SAFETY: the nursery is condemned in every pause
            return unsafe { self.evacuate(value, worker) };
        }
        if self.kind == CollectionKind::Major {
            if self.major.is_condemned(value) {
                return self.major.trace(value, self, worker);
            }
            if self.los.mark(value) {
                worker.gray.push(value);
            }
        }
        value
    }

    /// Trace the reference stored in a heap slot, rewriting it if the
    /// referent moved. A slot outside the nursery left pointing into it is
    /// remembered.
    ///
    /// # Safety
    /// `slot` must be a readable, writable reference slot.
    #[inline]
    pub unsafe fn trace_slot(&self, slot: Address, worker: &mut TraceWorker) {
        // SAFETY: forwarded to the caller
        let new = unsafe { self.trace_slot_value(slot, worker) };
        if self.nursery.contains(new) && !self.nursery.contains(slot) {
            worker.remembered.push(slot);
        }
    }

    /// Trace a root slot; roots are rescanned every pause and never
    /// remembered
    ///
    /// # Safety
    /// Same as [`TraceEnv::trace_slot`].
    #[inline]
    pub unsafe fn trace_root_slot(&self, slot: Address, worker: &mut TraceWorker) {
        // SAFETY: forwarded to the caller
        unsafe { self.trace_slot_value(slot, worker) };
    }

    /// Store the post-pause address of a weakly held referent, applying the
    /// same remembering rule as [`TraceEnv::trace_slot`]
    ///
    /// # Safety
    /// `slot` must be a writable reference slot inside the heap.
    pub unsafe fn update_weak_slot(
        &self,
        slot: Address,
        old: Address,
        new: Address,
        worker: &mut TraceWorker,
    ) {
        if new != old {
            // SAFETY: forwarded to the caller
            unsafe { slot.store_address(new) };
        }
        if self.nursery.contains(new) && !self.nursery.contains(slot) {
            worker.remembered.push(slot);
        }
    }

    #[inline]
    unsafe fn trace_slot_value(&self, slot: Address, worker: &mut TraceWorker) -> Address {
        // SAFETY: forwarded to the caller
        let value = unsafe { slot.load_address() };
        if value.is_null() {
            return value;
        }
        // SAFETY: reference slots hold object starts
        let new = unsafe { self.trace_value(value, worker) };
        if new != value {
            // SAFETY: forwarded to the caller
            unsafe { slot.store_address(new) };
        }
        new
    }

    /// Scan every strong reference of `obj`
    ///
    /// # Safety
    /// `obj` must be a live object that no other worker is copying.
    pub unsafe fn scan_object(&self, obj: Address, worker: &mut TraceWorker) {
        worker.scanned_objects += 1;
        // SAFETY: forwarded to the caller
        unsafe {
            for_each_slot(self.types, obj, &mut |slot| self.trace_slot(slot, worker));
        }
    }

    /// Scan `count` consecutive reference slots
    ///
    /// # Safety
    /// The slots must be readable and writable.
    pub unsafe fn scan_range(&self, start: Address, count: usize, worker: &mut TraceWorker) {
        for i in 0..count {
            // SAFETY: forwarded to the caller
            unsafe { self.trace_slot(start.word(i), worker) };
        }
    }

    /// Scan `count` consecutive inline values of value type `ty`
    ///
    /// # Safety
    /// `dest` must hold `count` values laid out as `ty`.
    pub unsafe fn scan_value_types(
        &self,
        dest: Address,
        count: usize,
        ty: TypeId,
        worker: &mut TraceWorker,
    ) {
        let info = self.types.expect(ty, dest);
        let ObjectKind::ValueType { size, refs } = &info.kind else {
            crate::gc_fatal!("type `{}` recorded as a value type copy at {dest}", info.name);
        };
        for i in 0..count {
            refs.for_each_reference(dest.offset(i * size), self.types.complex(), &mut |slot| {
                // SAFETY: forwarded to the caller
                unsafe { self.trace_slot(slot, worker) }
            });
        }
    }

    /// Scan the precise roots of one bucket
    pub fn scan_roots(&self, roots: &RootRegistry, kind: RootKind, worker: &mut TraceWorker) {
        for record in roots.iter(kind) {
            if let RootDescriptor::Precise(descriptor) = &record.descriptor {
                descriptor.for_each_reference(record.start, self.types.complex(), &mut |slot| {
                    // SAFETY: registered root ranges stay valid until deregistered
                    unsafe { self.trace_root_slot(slot, worker) }
                });
            }
        }
    }

    /// Address of `obj` after the pause if it survived its mark phase,
    /// `None` if it is dead. Objects outside the collected spaces are live.
    pub fn live_address(&self, obj: Address) -> Option<Address> {
        if self.nursery.contains(obj) {
            // SAFETY: nursery references point at object headers
            return match unsafe { ObjectRef::new(obj).header() } {
                HeaderState::Forwarded(to) => Some(to),
                HeaderState::Pinned(_) => Some(obj),
                _ => None,
            };
        }
        if self.kind == CollectionKind::Minor {
            return Some(obj);
        }
        if self.major.is_condemned(obj) {
            return self.major.live_address(obj);
        }
        if self.los.is_object_start(obj) {
            return self.los.is_marked(obj).then_some(obj);
        }
        Some(obj)
    }
}

impl GrayScanner for TraceEnv<'_> {
    type Worker = TraceWorker;

    fn new_worker(&self, id: usize) -> TraceWorker {
        TraceWorker::new(id)
    }

    fn scan(&self, worker: &mut TraceWorker, obj: Address) {
        self.major.scan_object(obj, self, worker);
    }
}

/// Call `f` with every strong reference slot of `obj`. Ephemeron entries
/// are weak and not reported.
///
/// # Safety
/// `obj` must start an object with a type-bearing header.
pub unsafe fn for_each_slot(types: &TypeTable, obj: Address, f: &mut dyn FnMut(Address)) {
    // SAFETY: forwarded to the caller
    let ty = unsafe { ObjectRef::new(obj).type_id() };
    let info = types.expect(ty, obj);
    match &info.kind {
        ObjectKind::Fixed { refs, .. } => refs.for_each_reference(obj.word(1), types.complex(), f),
        ObjectKind::Vector {
            elem_size,
            elem_refs,
        } => {
            // SAFETY: vectors carry their length in word 1
            let length = unsafe { obj.word(1).load() };
            let base = obj.word(VECTOR_HEADER_WORDS);
            match elem_refs {
                ElementRefs::PointerFree => {}
                ElementRefs::AllRefs => {
                    for i in 0..length * elem_size / WORD_SIZE {
                        f(base.word(i));
                    }
                }
                ElementRefs::Bitmap(bits) => {
                    for element in 0..length {
                        let elem = base.offset(element * elem_size);
                        let mut remaining = *bits;
                        while remaining != 0 {
                            f(elem.word(remaining.trailing_zeros() as usize));
                            remaining &= remaining - 1;
                        }
                    }
                }
            }
        }
        ObjectKind::Ephemeron => {}
        ObjectKind::ValueType { .. } => {
            crate::gc_fatal!("object {obj} has headerless value type `{}`", info.name)
        }
    }
}
