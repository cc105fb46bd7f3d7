//! Collector benchmarks
//!
//! Measures nursery allocation throughput and minor pause times.
//!
//! Run with: `cargo bench -p otter-vm-gc`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use otter_vm_gc::{
    Address, BarrierKind, Descriptor, GcConfig, GcHeap, Generation, MajorKind, RootDescriptor,
    StackBounds, TypeInfo,
};
use std::hint::black_box;
use std::time::{Duration, Instant};

fn heap(major: MajorKind, barrier: BarrierKind) -> GcHeap {
    GcHeap::new(GcConfig {
        nursery_size: 1024 * 1024,
        major,
        barrier,
        ..GcConfig::default()
    })
    .unwrap()
}

/// Allocation throughput on the TLAB fast path, collections included
fn allocation_throughput_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation_throughput");

    group.bench_function("pairs_10000", |b| {
        let heap = heap(MajorKind::Copying, BarrierKind::Remset);
        let pair = heap
            .register_type(TypeInfo::fixed("Pair", 2, Descriptor::all_refs(2)))
            .unwrap();
        let mut mutator = heap.attach(StackBounds::EMPTY);
        b.iter(|| {
            for _ in 0..10_000 {
                black_box(mutator.alloc(pair).unwrap());
            }
        });
    });

    group.bench_function("vectors_1000", |b| {
        let heap = heap(MajorKind::Copying, BarrierKind::Remset);
        let bytes = heap
            .register_type(TypeInfo::vector("Bytes", 1, otter_vm_gc::ElementRefs::PointerFree))
            .unwrap();
        let mut mutator = heap.attach(StackBounds::EMPTY);
        b.iter(|| {
            for len in 0..1000 {
                black_box(mutator.alloc_vector(bytes, len).unwrap());
            }
        });
    });

    group.finish();
}

/// Minor pause time with a rooted live list of varying length
fn minor_pause_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("minor_pause");

    for (name, major, barrier) in [
        ("copying_remset", MajorKind::Copying, BarrierKind::Remset),
        ("marksweep_cardtable", MajorKind::MarkSweep, BarrierKind::CardTable),
    ] {
        for live in [100usize, 1000, 10_000] {
            group.bench_with_input(BenchmarkId::new(name, live), &live, |b, &n| {
                b.iter_custom(|iters| {
                    let mut total = Duration::ZERO;
                    for _ in 0..iters {
                        let heap = heap(major, barrier);
                        let refs = heap.make_descriptor(&[0b01]);
                        let node = heap
                            .register_type(TypeInfo::fixed("Node", 2, refs))
                            .unwrap();
                        let mut mutator = heap.attach(StackBounds::EMPTY);
                        let mut root = Box::new(0usize);
                        let slot = Address::from_ptr(&mut *root as *mut usize);
                        unsafe {
                            mutator.register_root(
                                slot,
                                8,
                                RootDescriptor::Precise(Descriptor::all_refs(1)),
                            );
                        }
                        for i in 0..n {
                            let obj = mutator.alloc(node).unwrap();
                            unsafe {
                                obj.word(2).store(i);
                                mutator.store_field(obj, obj.word(1), slot.load_address());
                                slot.store_address(obj);
                            }
                            // one garbage object per live one
                            black_box(mutator.alloc(node).unwrap());
                        }

                        let start = Instant::now();
                        mutator
                            .request_collection(Generation::Nursery, "bench")
                            .unwrap();
                        total += start.elapsed();

                        mutator.deregister_root(slot);
                    }
                    total
                });
            });
        }
    }

    group.finish();
}

criterion_group!(benches, allocation_throughput_benchmark, minor_pause_benchmark);
criterion_main!(benches);
