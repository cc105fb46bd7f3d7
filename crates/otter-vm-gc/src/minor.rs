//! Minor collection
//!
//! A minor collection empties the nursery. Objects pinned by conservative
//! roots stay where they are; every other reachable nursery object is
//! copied into the major heap and forwarded. Reachability comes from the
//! remembered set (or dirty cards), the precise roots, the conservative
//! stacks and the finalizer ready list.
//!
//! ```text
//! Idle -> Pinning -> RemsetReplay -> RootScan -> GrayDrain
//!      -> Finalization -> FragmentRebuild -> Idle
//! ```

use crate::address::{Address, AddressRange};
use crate::config::BarrierKind;
use crate::ephemeron::EphemeronTables;
use crate::finalization::FinalizerQueue;
use crate::heap::{CollectorContext, HeapInner};
use crate::log::gc_debug;
use crate::nursery::Nursery;
use crate::pin::{PinQueue, pin_candidates};
use crate::remset::RemsetEntry;
use crate::roots::{RootKind, RootRegistry};
use crate::section::{Section, WalkControl};
use crate::stats::PauseSummary;
use crate::trace::{CollectionKind, TraceEnv, TraceWorker};
use crate::types::TypeTable;
use crate::weak_ref::WeakLinks;
use crate::workers::Drainer;
use std::time::Instant;

/// Step of a pause
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Pinning,
    RemsetReplay,
    RootScan,
    GrayDrain,
    Finalization,
    Sweep,
    FragmentRebuild,
}

/// Logs how long each phase of a pause took
pub(crate) struct PhaseLog {
    kind: CollectionKind,
    phase: Phase,
    started: Instant,
}

impl PhaseLog {
    pub(crate) fn new(kind: CollectionKind) -> Self {
        Self {
            kind,
            phase: Phase::Idle,
            started: Instant::now(),
        }
    }

    pub(crate) fn enter(&mut self, next: Phase) {
        let now = Instant::now();
        gc_debug!(
            kind = ?self.kind,
            phase = ?self.phase,
            next = ?next,
            elapsed_us = now.duration_since(self.started).as_micros() as u64,
            "phase finished"
        );
        self.phase = next;
        self.started = now;
    }

    pub(crate) fn finish(&mut self) {
        self.enter(Phase::Idle);
    }
}

/// Gather candidates from the pinned root bucket and the thread stacks,
/// keeping those inside `ranges`
pub(crate) fn gather_pin_candidates(
    roots: &RootRegistry,
    stacks: &[AddressRange],
    ranges: &[AddressRange],
) -> PinQueue {
    let mut queue = PinQueue::new();
    for record in roots.iter(RootKind::Pinned) {
        let start = record.start.align_up();
        let end = record.start.offset(record.size).align_down();
        // SAFETY: registered root ranges stay readable until deregistered
        unsafe { queue.add_range(start, end, ranges) };
    }
    for stack in stacks {
        // SAFETY: stack bounds belong to parked threads or the collector
        unsafe { queue.add_range(stack.start, stack.end, ranges) };
    }
    queue.optimize();
    queue
}

/// Pin the nursery objects the candidates resolve to
pub(crate) fn pin_nursery(
    nursery: &Nursery,
    queue: &PinQueue,
    types: &TypeTable,
) -> Vec<(Address, usize)> {
    let section = nursery.section();
    // SAFETY: prepare_for_collection zeroed every byte outside objects and
    // nothing has been evacuated yet
    unsafe { pin_candidates(section, queue.candidates_in(nursery.range()), section.end(), types) }
}

/// Resolve finalizers, ephemerons and weak links once the strong graph is
/// drained. Returns the number of objects made ready for finalization.
pub(crate) fn process_weak_references(
    env: &TraceEnv<'_>,
    worker: &mut TraceWorker,
    drainer: &mut Drainer<'_, TraceEnv<'_>>,
    finalizers: &mut FinalizerQueue,
    ephemerons: &mut EphemeronTables,
    weak_links: &WeakLinks,
) -> usize {
    let mut finalized = 0;
    let mut rounds = 0;
    loop {
        rounds += 1;
        ephemerons.mark_to_fixed_point(env, worker, &mut |w| drainer.drain(w));
        let moved = finalizers.process(env, worker);
        if moved == 0 {
            break;
        }
        finalized += moved;
        drainer.drain(worker);
    }
    let cleared = ephemerons.clear_dead(env, worker);
    let (updated, nulled) = weak_links.process(env);
    gc_debug!(rounds, finalized, cleared, updated, nulled, "weak references processed");
    finalized
}

/// Record the slots still pointing into the nursery after a pause
pub(crate) fn install_remembered(heap: &HeapInner, workers: &mut [TraceWorker]) {
    let mut installed = 0;
    for worker in workers {
        let slots = worker.take_remembered();
        installed += slots.len();
        match heap.config.barrier {
            BarrierKind::Remset => {
                let mut entries: Vec<RemsetEntry> =
                    slots.into_iter().map(RemsetEntry::Location).collect();
                heap.remset.append(&mut entries);
            }
            BarrierKind::CardTable => {
                slots.into_iter().for_each(|slot| heap.mark_card(slot));
            }
        }
    }
    gc_debug!(installed, "remembered slots installed");
}

/// Replay the global store buffer list. Slots inside the nursery and inside
/// old ephemeron tables are skipped.
fn replay_remset(
    heap: &HeapInner,
    env: &TraceEnv<'_>,
    ephemerons: &EphemeronTables,
    worker: &mut TraceWorker,
) -> usize {
    let tables = ephemerons.old_table_ranges(env);
    let nursery = env.nursery();
    let skip = |slot: Address| nursery.contains(slot) || tables.iter().any(|t| t.contains(slot));
    let mut replayed = 0;
    for segment in heap.remset.take() {
        for entry in segment.entries() {
            replayed += 1;
            // SAFETY: entries name heap slots, objects and value arrays that
            // stay valid until the next major collection clears the set
            unsafe {
                match *entry {
                    RemsetEntry::Location(slot) => {
                        if !skip(slot) {
                            env.trace_slot(slot, worker);
                        }
                    }
                    RemsetEntry::Range { start, count } => {
                        if !skip(start) {
                            env.scan_range(start, count, worker);
                        }
                    }
                    RemsetEntry::Object(obj) => {
                        if !nursery.contains(obj) {
                            env.scan_object(obj, worker);
                        }
                    }
                    RemsetEntry::ValueType { dest, count, ty } => {
                        if !skip(dest) {
                            env.scan_value_types(dest, count, ty, worker);
                        }
                    }
                }
            }
        }
    }
    replayed
}

/// Scan every object overlapping a dirty card, then every dirty large
/// object
fn scan_cards(
    heap: &HeapInner,
    env: &TraceEnv<'_>,
    types: &TypeTable,
    worker: &mut TraceWorker,
) -> usize {
    let mut cards = 0;
    for section in heap.sections.snapshot() {
        for card in section.take_dirty_cards() {
            cards += 1;
            // SAFETY: major sections are walkable between pauses and only
            // grow by whole objects during this one
            unsafe { scan_card(&section, card, env, types, worker) };
        }
    }
    for obj in heap.los.take_dirty() {
        cards += 1;
        // SAFETY: dirty large objects are allocated objects
        unsafe { env.scan_object(obj, worker) };
    }
    cards
}

unsafe fn scan_card(
    section: &Section,
    card: AddressRange,
    env: &TraceEnv<'_>,
    types: &TypeTable,
    worker: &mut TraceWorker,
) {
    // SAFETY: forwarded to the caller
    unsafe {
        let from = section
            .find_object_containing(card.start, section.start(), types)
            .map_or(card.start, |(obj, _)| obj);
        section.walk(from, card.end, types, &mut |obj, _| {
            env.scan_object(obj, worker);
            WalkControl::Continue
        });
    }
}

/// Run a minor collection. The world is stopped and `ctx` is locked.
pub(crate) fn collect(
    heap: &HeapInner,
    ctx: &mut CollectorContext,
    types: &TypeTable,
    stacks: &[AddressRange],
) -> PauseSummary {
    let mut phases = PhaseLog::new(CollectionKind::Minor);
    phases.enter(Phase::Pinning);
    ctx.nursery.prepare_for_collection();
    let queue = gather_pin_candidates(&ctx.roots, stacks, &[heap.nursery_range]);
    let pinned = pin_nursery(&ctx.nursery, &queue, types);
    gc_debug!(candidates = queue.len(), pinned = pinned.len(), "nursery pinned");

    let CollectorContext {
        nursery,
        major,
        roots,
        finalizers,
        weak_links,
        ephemerons,
        pool,
        ..
    } = ctx;
    let env = TraceEnv::new(types, heap.nursery_range, CollectionKind::Minor, &**major, &heap.los);
    let (finalized, mut workers) = pool.run(&env, |worker, drainer| {
        for &(obj, _) in &pinned {
            worker.push_gray(obj);
        }

        phases.enter(Phase::RemsetReplay);
        let replayed = match heap.config.barrier {
            BarrierKind::Remset => replay_remset(heap, &env, ephemerons, worker),
            BarrierKind::CardTable => scan_cards(heap, &env, types, worker),
        };
        gc_debug!(replayed, "remembered set replayed");

        phases.enter(Phase::RootScan);
        env.scan_roots(roots, RootKind::Normal, worker);
        env.scan_roots(roots, RootKind::WriteBarrier, worker);
        finalizers.scan_ready(&env, worker);

        phases.enter(Phase::GrayDrain);
        drainer.drain(worker);

        phases.enter(Phase::Finalization);
        process_weak_references(&env, worker, drainer, finalizers, ephemerons, weak_links)
    });

    phases.enter(Phase::FragmentRebuild);
    nursery.rebuild(&pinned);
    install_remembered(heap, &mut workers);
    phases.finish();

    PauseSummary {
        promoted_bytes: workers.iter().map(TraceWorker::promoted_bytes).sum(),
        pinned_objects: pinned.len(),
        finalized_objects: finalized,
    }
}
