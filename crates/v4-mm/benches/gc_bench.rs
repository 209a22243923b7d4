//! GC Performance Benchmarks
//!
//! Measures collection pause times and allocation throughput.
//!
//! Run with: `cargo bench -p v4-mm gc`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::cell::Cell;
use std::hint::black_box;
use v4_mm::{MemoryManager, MmConfig, Trace, Tracer, Value};

struct Node {
    next: Cell<Value>,
    payload: f64,
}

impl Trace for Node {
    fn trace(&self, tracer: &mut Tracer) {
        self.next.trace(tracer);
    }
}

/// Benchmark GC pause time for various heap sizes, half of the heap live
fn gc_pause_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("gc_pause");

    for num_objects in [100, 1000, 5000, 10000].iter() {
        group.bench_with_input(
            BenchmarkId::new("objects", num_objects),
            num_objects,
            |b, &n| {
                b.iter_custom(|iters| {
                    let mut total_duration = std::time::Duration::ZERO;

                    for _ in 0..iters {
                        let mm = MemoryManager::with_defaults();
                        mm.set_enable_gc(false);
                        let frame = mm.alloc_stack_frame(n / 2 + 1);

                        // Even-indexed objects stay rooted, odd ones become garbage
                        for i in 0..n {
                            let obj = mm.alloc_object(Node {
                                next: Cell::new(Value::undefined()),
                                payload: i as f64,
                            });
                            if i % 2 == 0 {
                                frame.set(i / 2, obj.to_value());
                            }
                        }
                        mm.set_enable_gc(true);

                        let start = std::time::Instant::now();
                        black_box(mm.run_gc());
                        total_duration += start.elapsed();

                        mm.dealloc_stack_frame(frame);
                    }

                    total_duration
                });
            },
        );
    }

    group.finish();
}

/// Benchmark allocation throughput across size classes
fn allocation_throughput_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation_throughput");

    for size in [32usize, 64, 128, 240].iter() {
        group.bench_with_input(BenchmarkId::new("raw_1000", size), size, |b, &size| {
            let mm = MemoryManager::with_defaults();
            b.iter(|| {
                for _ in 0..1000 {
                    black_box(mm.alloc(size));
                }
            });
        });
    }

    group.bench_function("linked_list_1000", |b| {
        let mm = MemoryManager::with_defaults();
        let frame = mm.alloc_stack_frame(1);
        b.iter(|| {
            frame.set(0, Value::undefined());
            for i in 0..1000 {
                let node = mm.alloc_object(Node {
                    next: Cell::new(frame.get(0)),
                    payload: i as f64,
                });
                frame.set(0, node.to_value());
            }
            black_box(frame.get(0));
        });
    });

    group.finish();
}

/// Allocation with a collection on every request
fn aggressive_mode_benchmark(c: &mut Criterion) {
    c.bench_function("aggressive_alloc_100", |b| {
        let mm = MemoryManager::new(MmConfig {
            aggressive_gc: true,
            ..MmConfig::default()
        });
        b.iter(|| {
            for _ in 0..100 {
                let node = mm.alloc_object(Node {
                    next: Cell::new(Value::undefined()),
                    payload: 0.0,
                });
                black_box(node.payload);
            }
        });
    });
}

criterion_group!(
    benches,
    gc_pause_benchmark,
    allocation_throughput_benchmark,
    aggressive_mode_benchmark
);
criterion_main!(benches);
