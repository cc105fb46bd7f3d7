//! The shared heap
//!
//! [`GcHeap`] is a cheap handle to the state every mutator shares: the
//! configuration, the type table, the section map, the large object space,
//! the global remembered set and the safepoint. Everything a pause mutates
//! lives in one [`CollectorContext`] behind the collector lock.
//!
//! Lock order: the collector lock first, then any of the leaf locks (thread
//! table, stack bounds, global remset, statistics). Leaf locks never nest.

use crate::address::{Address, AddressRange};
use crate::config::GcConfig;
use crate::descriptor::Descriptor;
use crate::ephemeron::EphemeronTables;
use crate::error::{GcError, GcResult};
use crate::finalization::FinalizerQueue;
use crate::log::{gc_debug, gc_info, gc_warn};
use crate::los::LargeObjectSpace;
use crate::major::{MajorCollector, new_major};
use crate::mutator::Mutator;
use crate::nursery::Nursery;
use crate::remset::GlobalRemset;
use crate::roots::RootRegistry;
use crate::safepoint::Safepoint;
use crate::section::{Section, SectionMap};
use crate::stats::{GcStats, PauseSummary};
use crate::types::{TypeId, TypeInfo, TypeRegistry, TypeTable};
use crate::weak_ref::WeakLinks;
use crate::workers::WorkerPool;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Large object bytes allowed before the first major collection
pub const INITIAL_LOS_THRESHOLD: usize = 2 * 1024 * 1024;

/// Large object growth allowed on top of the live bytes of the last major
pub const LOS_THRESHOLD_SLACK: usize = 5 * 1024 * 1024;

/// Generation to collect
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Generation {
    /// The nursery; may escalate to a major collection
    Nursery,
    /// Everything
    Major,
}

/// Range of a mutator's stack scanned conservatively
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StackBounds {
    /// Lowest address (inclusive)
    pub low: Address,
    /// Highest address (exclusive)
    pub high: Address,
}

impl StackBounds {
    /// No stack
    pub const EMPTY: StackBounds = StackBounds {
        low: Address::NULL,
        high: Address::NULL,
    };

    /// Bounds from raw addresses
    pub fn new(low: Address, high: Address) -> Self {
        Self { low, high }
    }

    /// Bounds covering a slice, for hosts that keep references in a
    /// shadow stack
    pub fn from_slice<T>(slice: &[T]) -> Self {
        let range = slice.as_ptr_range();
        Self::new(Address::from_ptr(range.start), Address::from_ptr(range.end))
    }

    /// Word-aligned range, empty if the bounds are inverted
    pub(crate) fn range(&self) -> AddressRange {
        let start = self.low.align_up();
        let end = self.high.align_down();
        if end <= start {
            AddressRange::default()
        } else {
            AddressRange::new(start, end)
        }
    }
}

/// Per-thread data the collector reads during a pause
#[derive(Debug, Default)]
pub(crate) struct ThreadRecord {
    pub(crate) stack: Mutex<StackBounds>,
}

/// Everything a pause mutates. Owned by the heap, guarded by the collector
/// lock.
pub(crate) struct CollectorContext {
    pub(crate) nursery: Nursery,
    pub(crate) major: Box<dyn MajorCollector>,
    pub(crate) roots: RootRegistry,
    pub(crate) finalizers: FinalizerQueue,
    pub(crate) weak_links: WeakLinks,
    pub(crate) ephemerons: EphemeronTables,
    pub(crate) pool: WorkerPool,
    pub(crate) los_threshold: usize,
    pub(crate) live_after_major: usize,
    pub(crate) major_requested: bool,
}

impl CollectorContext {
    /// Reason to follow the current minor collection with a major one
    fn major_trigger(&self, heap: &HeapInner) -> Option<&'static str> {
        if self.major_requested {
            return Some("requested");
        }
        if self.nursery.degraded_exhausted() {
            return Some("degraded allocation exhausted");
        }
        let growth = self.major.used_bytes().saturating_sub(self.live_after_major);
        if growth > (4 * heap.config.nursery_size).max(self.live_after_major) {
            return Some("major heap growth");
        }
        if heap.los.used_bytes() > self.los_threshold {
            return Some("large object space");
        }
        None
    }
}

pub(crate) struct HeapInner {
    pub(crate) config: GcConfig,
    pub(crate) types: TypeRegistry,
    pub(crate) sections: Arc<SectionMap>,
    pub(crate) los: LargeObjectSpace,
    pub(crate) remset: GlobalRemset,
    pub(crate) safepoint: Safepoint,
    pub(crate) nursery_range: AddressRange,
    pub(crate) nursery_section: Arc<Section>,
    pub(crate) threads: Mutex<FxHashMap<u64, Arc<ThreadRecord>>>,
    next_thread_id: AtomicU64,
    pub(crate) ctx: Mutex<CollectorContext>,
    pub(crate) stats: Mutex<GcStats>,
}

/// Restarts the world when the pause ends, including by panic
struct StoppedWorld<'a>(&'a Safepoint);

impl<'a> StoppedWorld<'a> {
    fn stop(safepoint: &'a Safepoint, requester_attached: bool) -> Self {
        safepoint.stop_world(requester_attached);
        Self(safepoint)
    }
}

impl Drop for StoppedWorld<'_> {
    fn drop(&mut self) {
        self.0.restart_world();
    }
}

impl HeapInner {
    /// Is `slot` inside a major section or a large object
    pub(crate) fn is_heap_slot(&self, slot: Address) -> bool {
        self.sections.find(slot).is_some() || self.los.contains(slot)
    }

    /// Bytes counted against `max-heap-size`
    pub(crate) fn heap_size(&self, ctx: &CollectorContext) -> usize {
        ctx.major.used_bytes() + self.los.used_bytes()
    }

    fn stack_ranges(&self) -> Vec<AddressRange> {
        self.threads
            .lock()
            .values()
            .map(|record| record.stack.lock().range())
            .filter(|range| !range.is_empty())
            .collect()
    }

    /// Stop the world and collect. The caller holds the collector lock and,
    /// if attached, has already flushed its store buffer and dropped its
    /// TLAB.
    pub(crate) fn collect(
        &self,
        ctx: &mut CollectorContext,
        generation: Generation,
        reason: &str,
        requester_attached: bool,
    ) -> GcResult<()> {
        let _world = StoppedWorld::stop(&self.safepoint, requester_attached);
        let stacks = self.stack_ranges();
        let types = self.types.snapshot();
        gc_info!(?generation, reason, threads = stacks.len(), "collection requested");

        let ran_major = match generation {
            Generation::Nursery => {
                self.run_minor(ctx, &types, &stacks);
                match ctx.major_trigger(self) {
                    Some(trigger) => {
                        self.run_major(ctx, &types, &stacks, trigger);
                        true
                    }
                    None => false,
                }
            }
            Generation::Major => {
                self.run_major(ctx, &types, &stacks, reason);
                true
            }
        };

        if ran_major
            && let Some(max) = self.config.max_heap_size
        {
            let heap_size = self.heap_size(ctx);
            if heap_size > max {
                gc_warn!(heap_size, max, "heap limit exceeded after major collection");
                return Err(GcError::OutOfMemory {
                    requested: 0,
                    heap_size,
                });
            }
        }
        Ok(())
    }

    fn run_minor(&self, ctx: &mut CollectorContext, types: &TypeTable, stacks: &[AddressRange]) {
        if self.config.debug.check_at_minor_collections {
            crate::verify::check_remembered_sets(self, ctx, types);
        }
        let start = Instant::now();
        let summary = crate::minor::collect(self, ctx, types, stacks);
        self.record(ctx, false, start, summary);
    }

    fn run_major(
        &self,
        ctx: &mut CollectorContext,
        types: &TypeTable,
        stacks: &[AddressRange],
        reason: &str,
    ) {
        gc_info!(reason, strategy = ?ctx.major.kind(), "major collection");
        let start = Instant::now();
        let summary = crate::major::collect(self, ctx, types, stacks);
        self.record(ctx, true, start, summary);
    }

    fn record(&self, ctx: &CollectorContext, major: bool, start: Instant, summary: PauseSummary) {
        let pause = start.elapsed();
        let mut stats = self.stats.lock();
        stats.record_pause(major, pause);
        stats.record_summary(&summary);
        stats.degraded = ctx.nursery.is_degraded();
        stats.major_used_bytes = ctx.major.used_bytes();
        stats.major_heap_bytes = ctx.major.heap_bytes();
        stats.los_used_bytes = self.los.used_bytes();
        stats.live_after_major = ctx.live_after_major;
        gc_info!(
            major,
            pause_us = pause.as_micros() as u64,
            promoted = summary.promoted_bytes,
            pinned = summary.pinned_objects,
            "collection finished"
        );
    }
}

/// Handle to a collected heap
///
/// Cloning the handle is cheap; every clone refers to the same heap.
#[derive(Clone)]
pub struct GcHeap {
    pub(crate) inner: Arc<HeapInner>,
}

impl GcHeap {
    /// Create a heap. The configuration is validated first.
    pub fn new(config: GcConfig) -> GcResult<Self> {
        config.validate()?;
        let nursery = Nursery::new(config.nursery_size, config.tlab_size, config.clear_policy)?;
        let sections = Arc::new(SectionMap::new());
        let major = new_major(config.major, Arc::clone(&sections), config.section_size);
        gc_info!(
            nursery = config.nursery_size,
            major = ?config.major,
            barrier = ?config.barrier,
            workers = config.workers,
            "heap created"
        );
        let ctx = CollectorContext {
            major,
            roots: RootRegistry::new(),
            finalizers: FinalizerQueue::new(),
            weak_links: WeakLinks::new(),
            ephemerons: EphemeronTables::new(),
            pool: WorkerPool::new(config.workers),
            los_threshold: INITIAL_LOS_THRESHOLD,
            live_after_major: 0,
            major_requested: false,
            nursery,
        };
        let inner = HeapInner {
            nursery_range: ctx.nursery.range(),
            nursery_section: Arc::clone(ctx.nursery.section()),
            types: TypeRegistry::new(),
            sections,
            los: LargeObjectSpace::new(),
            remset: GlobalRemset::new(config.remset_size),
            safepoint: Safepoint::new(),
            threads: Mutex::new(FxHashMap::default()),
            next_thread_id: AtomicU64::new(1),
            ctx: Mutex::new(ctx),
            stats: Mutex::new(GcStats::default()),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Create a heap configured from `OTTER_GC_PARAMS` / `OTTER_GC_DEBUG`
    pub fn from_env() -> GcResult<Self> {
        Self::new(GcConfig::from_env()?)
    }

    /// Active configuration
    pub fn config(&self) -> &GcConfig {
        &self.inner.config
    }

    /// Register an object layout
    pub fn register_type(&self, info: TypeInfo) -> GcResult<TypeId> {
        let id = self.inner.types.register(info)?;
        gc_debug!(id = id.as_u32(), "registered type");
        Ok(id)
    }

    /// Smallest descriptor for a reference bitmap (bit i = word i)
    pub fn make_descriptor(&self, bits: &[u64]) -> Descriptor {
        self.inner.types.make_descriptor(bits)
    }

    /// Current type table
    pub fn types(&self) -> Arc<TypeTable> {
        self.inner.types.snapshot()
    }

    /// Attach the calling thread. `stack` is scanned conservatively in every
    /// pause; pass [`StackBounds::EMPTY`] when all references are in precise
    /// roots.
    pub fn attach(&self, stack: StackBounds) -> Mutator {
        self.inner.safepoint.attach();
        let id = self.inner.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(ThreadRecord {
            stack: Mutex::new(stack),
        });
        self.inner.threads.lock().insert(id, Arc::clone(&record));
        gc_debug!(thread = id, "mutator attached");
        Mutator::new(self.clone(), id, record)
    }

    /// Collect from a thread without a [`Mutator`]. Attached threads must
    /// use [`Mutator::request_collection`] instead, or the pause would wait
    /// for the caller itself to park.
    pub fn request_collection(&self, generation: Generation, reason: &str) -> GcResult<()> {
        let mut ctx = self.inner.ctx.lock();
        if generation == Generation::Major {
            ctx.major_requested = true;
        }
        self.inner.collect(&mut ctx, generation, reason, false)
    }

    /// Snapshot of the statistics
    pub fn stats(&self) -> GcStats {
        self.inner.stats.lock().clone()
    }

    /// Address range of the nursery
    pub fn nursery_range(&self) -> AddressRange {
        self.inner.nursery_range
    }

    /// Is `addr` inside the nursery
    pub fn in_nursery(&self, addr: Address) -> bool {
        self.inner.nursery_range.contains(addr)
    }

    /// Is `addr` inside a major section
    pub fn in_major_heap(&self, addr: Address) -> bool {
        self.inner.sections.find(addr).is_some()
    }

    /// Is `addr` inside a large object
    pub fn in_large_object_space(&self, addr: Address) -> bool {
        self.inner.los.contains(addr)
    }

    /// Number of attached mutators
    pub fn attached_threads(&self) -> usize {
        self.inner.safepoint.attached()
    }

    /// Run the remembered set consistency check outside the debug switch.
    /// Panics on a violation.
    ///
    /// Store buffers still held by mutators are not seen, so every attached
    /// thread (the caller included) should be in a safe region.
    pub fn verify(&self) {
        let ctx = self.inner.ctx.lock();
        let types = self.inner.types.snapshot();
        crate::verify::check_remembered_sets(&self.inner, &ctx, &types);
    }
}

impl std::fmt::Debug for GcHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcHeap")
            .field("config", &self.inner.config)
            .field("nursery", &self.inner.nursery_range)
            .finish_non_exhaustive()
    }
}
