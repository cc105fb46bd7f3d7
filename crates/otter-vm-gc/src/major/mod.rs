//! Major heap
//!
//! [`collect`] is strategy-agnostic: it pins, scans roots, drains and
//! sweeps through the [`MajorCollector`] trait. Strategies are picked at
//! startup from [`MajorKind`].

mod copying;
mod marksweep;

pub use copying::CopyingMajor;
pub use marksweep::MarkSweepMajor;

use crate::address::{Address, AddressRange};
use crate::config::MajorKind;
use crate::heap::{CollectorContext, HeapInner, LOS_THRESHOLD_SLACK};
use crate::log::gc_debug;
use crate::minor::{
    Phase, PhaseLog, gather_pin_candidates, install_remembered, pin_nursery,
    process_weak_references,
};
use crate::pin::PinQueue;
use crate::roots::RootKind;
use crate::section::{Section, SectionMap};
use crate::stats::PauseSummary;
use crate::trace::{CollectionKind, TraceEnv, TraceWorker};
use crate::types::TypeTable;
use crate::workers::GrayWorker;
use std::sync::Arc;

/// Local allocation buffer handed to a collector thread for promotion
pub struct Lab {
    section: Arc<Section>,
    next: Address,
    end: Address,
}

impl Lab {
    /// Buffer over `[start, end)` of `section`
    pub fn new(section: Arc<Section>, start: Address, end: Address) -> Self {
        Self {
            section,
            next: start,
            end,
        }
    }

    /// Bump-allocate `size` bytes
    #[inline]
    pub fn alloc(&mut self, size: usize) -> Option<Address> {
        let obj = self.next;
        let next = obj.offset(size);
        if next > self.end {
            return None;
        }
        self.next = next;
        Some(obj)
    }

    /// Bytes left
    pub fn remaining(&self) -> usize {
        self.end.diff(self.next)
    }

    /// Section the buffer lives in
    pub fn section(&self) -> &Arc<Section> {
        &self.section
    }
}

/// A major heap strategy
///
/// Methods taking `&self` may run on every collector thread at once;
/// `&mut self` methods run on the coordinator only.
pub trait MajorCollector: Send + Sync {
    /// Strategy selector this collector implements
    fn kind(&self) -> MajorKind;

    /// Bytes occupied by objects (live after the last sweep plus allocated
    /// since)
    fn used_bytes(&self) -> usize;

    /// Bytes reserved by sections
    fn heap_bytes(&self) -> usize;

    /// Allocate a small object outside a pause (degraded mode). Memory is
    /// zeroed.
    fn alloc_small(&self, size: usize) -> Option<Address> {
        let mut lab = self.alloc_lab(size, size)?;
        let obj = lab.alloc(size)?;
        lab.section().record_scan_start(obj);
        Some(obj)
    }

    /// Carve a zeroed buffer of at least `min` and at most `preferred`
    /// bytes. `None` only when the system is out of memory.
    fn alloc_lab(&self, min: usize, preferred: usize) -> Option<Lab>;

    /// A copy of a nursery object was written at `obj`
    fn note_promoted(&self, _obj: Address) {}

    /// Begin a major collection: snapshot the condemned sections
    fn start(&mut self);

    /// Candidates that fall into condemned sections
    fn find_pin_candidates(&self, queue: &PinQueue) -> Vec<Address>;

    /// Pin the objects the candidates resolve to and queue them for
    /// scanning. Returns the pinned objects with their sizes.
    fn pin_and_enqueue(
        &mut self,
        candidates: &[Address],
        types: &TypeTable,
        worker: &mut TraceWorker,
    ) -> Vec<(Address, usize)>;

    /// Is `addr` inside a section condemned by [`MajorCollector::start`]
    fn is_condemned(&self, addr: Address) -> bool;

    /// Mark or copy the condemned object `obj`, returning its address after
    /// the pause
    fn trace(&self, obj: Address, env: &TraceEnv<'_>, worker: &mut TraceWorker) -> Address;

    /// Address of the condemned object `obj` after the pause, or `None` if
    /// it was not reached
    fn live_address(&self, obj: Address) -> Option<Address>;

    /// Scan a gray object
    fn scan_object(&self, obj: Address, env: &TraceEnv<'_>, worker: &mut TraceWorker) {
        // SAFETY: gray objects are live, scanned once, and never being copied
        unsafe { env.scan_object(obj, worker) }
    }

    /// Reclaim everything not reached. Returns live bytes.
    fn sweep(&mut self, types: &TypeTable) -> usize;

    /// End of the major collection
    fn finish(&mut self);
}

/// Build the strategy selected by `kind`
pub fn new_major(
    kind: MajorKind,
    sections: Arc<SectionMap>,
    section_size: usize,
) -> Box<dyn MajorCollector> {
    match kind {
        MajorKind::Copying => Box::new(CopyingMajor::new(sections, section_size)),
        MajorKind::MarkSweep | MajorKind::MarkSweepParallel => {
            Box::new(MarkSweepMajor::new(kind, sections, section_size))
        }
    }
}

/// Run a major collection. The world is stopped and `ctx` is locked.
pub(crate) fn collect(
    heap: &HeapInner,
    ctx: &mut CollectorContext,
    types: &TypeTable,
    stacks: &[AddressRange],
) -> PauseSummary {
    let mut phases = PhaseLog::new(CollectionKind::Major);
    // every old-to-young slot is found again by tracing
    heap.remset.clear();
    let sections = heap.sections.snapshot();
    for section in &sections {
        section.clear_cards();
    }
    heap.los.clear_dirty();

    phases.enter(Phase::Pinning);
    ctx.nursery.prepare_for_collection();
    ctx.major.start();
    let large_objects = heap.los.objects();
    let mut ranges = vec![heap.nursery_range];
    ranges.extend(sections.iter().map(|s| s.range()));
    ranges.extend(
        large_objects
            .iter()
            .map(|&(start, size)| AddressRange::new(start, start.offset(size))),
    );
    let queue = gather_pin_candidates(&ctx.roots, stacks, &ranges);

    let mut seed = TraceWorker::new(0);
    let nursery_pinned = pin_nursery(&ctx.nursery, &queue, types);
    for &(obj, _) in &nursery_pinned {
        seed.push_gray(obj);
    }
    let candidates = ctx.major.find_pin_candidates(&queue);
    let major_pinned = ctx.major.pin_and_enqueue(&candidates, types, &mut seed);
    let mut los_pinned = 0;
    for &(start, size) in &large_objects {
        let hit = !queue
            .candidates_in(AddressRange::new(start, start.offset(size)))
            .is_empty();
        if hit && heap.los.mark(start) {
            seed.push_gray(start);
            los_pinned += 1;
        }
    }
    gc_debug!(
        candidates = queue.len(),
        nursery = nursery_pinned.len(),
        major = major_pinned.len(),
        large = los_pinned,
        "major pins resolved"
    );

    let CollectorContext {
        nursery,
        major,
        roots,
        finalizers,
        weak_links,
        ephemerons,
        pool,
        ..
    } = &mut *ctx;
    let env = TraceEnv::new(types, heap.nursery_range, CollectionKind::Major, &**major, &heap.los);
    let (finalized, mut workers) = pool.run(&env, |worker, drainer| {
        for section in seed.gray_queue().take_all_sections() {
            worker.gray_queue().add_section(section);
        }

        phases.enter(Phase::RootScan);
        env.scan_roots(roots, RootKind::Normal, worker);
        env.scan_roots(roots, RootKind::WriteBarrier, worker);
        finalizers.scan_ready(&env, worker);

        phases.enter(Phase::GrayDrain);
        drainer.drain(worker);

        phases.enter(Phase::Finalization);
        process_weak_references(&env, worker, drainer, finalizers, ephemerons, weak_links)
    });

    phases.enter(Phase::Sweep);
    let los = heap.los.sweep();
    let live = major.sweep(types);
    gc_debug!(
        live,
        large_live = los.live_bytes,
        large_freed = los.freed_objects,
        "major heap swept"
    );

    phases.enter(Phase::FragmentRebuild);
    nursery.rebuild(&nursery_pinned);
    major.finish();
    install_remembered(heap, &mut workers);
    phases.finish();

    ctx.los_threshold = los.live_bytes + LOS_THRESHOLD_SLACK;
    ctx.live_after_major = live;
    ctx.major_requested = false;

    PauseSummary {
        promoted_bytes: workers.iter().map(TraceWorker::promoted_bytes).sum(),
        pinned_objects: nursery_pinned.len() + major_pinned.len() + los_pinned,
        finalized_objects: finalized,
    }
}

/// Sorted section list lookup used by both strategies
pub(crate) fn find_condemned(condemned: &[Arc<Section>], addr: Address) -> Option<&Arc<Section>> {
    crate::section::find_in(condemned, addr)
}
