//! Allocation throughput benchmarks: bucket path, tree path, mixed churn,
//! and the process allocator as a baseline.

use std::alloc::Layout;
use std::hint::black_box;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use hypha_core::{Heap, HeapConfig};

struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}

fn bench_small_cycle(c: &mut Criterion) {
    let heap = Heap::new(HeapConfig::default()).expect("heap construction");
    let mut group = c.benchmark_group("small_cycle");
    group.throughput(Throughput::Elements(1));
    for size in [8usize, 64, 256, 512] {
        group.bench_function(format!("alloc_free_{size}"), |b| {
            b.iter(|| {
                let ptr = heap.allocate(black_box(size)).expect("bucket alloc");
                unsafe { heap.deallocate(ptr.as_ptr()) };
            })
        });
        group.bench_function(format!("system_baseline_{size}"), |b| {
            let layout = Layout::from_size_align(size, 8).expect("layout");
            b.iter(|| unsafe {
                let ptr = std::alloc::alloc(layout);
                std::alloc::dealloc(black_box(ptr), layout);
            })
        });
    }
    group.finish();
}

fn bench_large_cycle(c: &mut Criterion) {
    let heap = Heap::new(HeapConfig::default()).expect("heap construction");
    let mut group = c.benchmark_group("large_cycle");
    group.throughput(Throughput::Elements(1));
    for size in [1usize << 10, 1 << 14, 1 << 18] {
        group.bench_function(format!("alloc_free_{size}"), |b| {
            b.iter(|| {
                let ptr = heap.allocate(black_box(size)).expect("tree alloc");
                unsafe { heap.deallocate(ptr.as_ptr()) };
            })
        });
    }
    group.finish();
}

fn bench_aligned(c: &mut Criterion) {
    let heap = Heap::new(HeapConfig::default()).expect("heap construction");
    let mut group = c.benchmark_group("aligned");
    for align in [64usize, 1024, 4096] {
        group.bench_function(format!("alloc_free_4000_a{align}"), |b| {
            b.iter(|| {
                let ptr = heap
                    .allocate_aligned(black_box(4000), align)
                    .expect("aligned alloc");
                unsafe { heap.deallocate(ptr.as_ptr()) };
            })
        });
    }
    group.finish();
}

fn bench_mixed_churn(c: &mut Criterion) {
    let heap = Heap::new(HeapConfig::default()).expect("heap construction");
    let mut rng = XorShift64::new(0x9E3779B97F4A7C15);
    let mut live: Vec<(*mut u8, usize)> = Vec::with_capacity(256);
    c.bench_function("mixed_churn", |b| {
        b.iter(|| {
            if live.len() < 256 && rng.next() % 100 < 60 {
                let size = 1 + (rng.next() % 4096) as usize;
                if let Some(ptr) = heap.allocate(size) {
                    live.push((ptr.as_ptr(), size));
                }
            } else if !live.is_empty() {
                let pos = (rng.next() % live.len() as u64) as usize;
                let (ptr, _) = live.swap_remove(pos);
                unsafe { heap.deallocate(ptr) };
            }
        })
    });
    for (ptr, _) in live.drain(..) {
        unsafe { heap.deallocate(ptr) };
    }
}

fn bench_realloc_ladder(c: &mut Criterion) {
    let heap = Heap::new(HeapConfig::default()).expect("heap construction");
    c.bench_function("realloc_ladder_64_to_8192", |b| {
        b.iter(|| {
            let mut ptr = heap.allocate(64).expect("alloc").as_ptr();
            let mut size = 64usize;
            while size < 8192 {
                size *= 2;
                ptr = unsafe { heap.reallocate(ptr, size) }.expect("realloc").as_ptr();
            }
            unsafe { heap.deallocate(black_box(ptr)) };
        })
    });
}

criterion_group!(
    benches,
    bench_small_cycle,
    bench_large_cycle,
    bench_aligned,
    bench_mixed_churn,
    bench_realloc_ladder
);
criterion_main!(benches);
