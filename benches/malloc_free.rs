//! Allocator benchmarks.

use binmalloc::{BinnedMalloc, LockGranularity, MallocConfig, OsPageProvider};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn heap(granularity: LockGranularity) -> &'static BinnedMalloc {
    let config = MallocConfig {
        lock_granularity: granularity,
        ..MallocConfig::default()
    };
    Box::leak(Box::new(
        BinnedMalloc::with_config(OsPageProvider::new(), config).unwrap(),
    ))
}

fn bench_malloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768, 262_144];
    let uncached = heap(LockGranularity::FineGrained);
    let cached = heap(LockGranularity::FineGrained);
    cached.setup_tls_caches_on_current_thread().unwrap();

    let mut group = c.benchmark_group("malloc_free_cycle");
    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("uncached", size), &size, |b, &sz| {
            b.iter(|| {
                let p = uncached.malloc(criterion::black_box(sz), 0);
                // Safety: allocated above.
                unsafe { uncached.free(p) };
            });
        });
        group.bench_with_input(BenchmarkId::new("tls_cached", size), &size, |b, &sz| {
            b.iter(|| {
                let p = cached.malloc(criterion::black_box(sz), 0);
                // Safety: allocated above.
                unsafe { cached.free(p) };
            });
        });
        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &sz| {
            b.iter(|| {
                let v = vec![0u8; sz];
                criterion::black_box(v);
            });
        });
    }
    group.finish();
    cached.clear_and_disable_tls_caches_on_current_thread();
}

fn bench_malloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("malloc_burst");
    for granularity in [LockGranularity::Coarse, LockGranularity::FineGrained] {
        let heap = heap(granularity);
        group.bench_function(format!("1000x64B/{granularity:?}"), |b| {
            let mut ptrs = Vec::with_capacity(1000);
            b.iter(|| {
                ptrs.extend((0..1000).map(|_| heap.malloc(64, 0)));
                for p in ptrs.drain(..) {
                    // Safety: allocated above.
                    unsafe { heap.free(p) };
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_malloc_free_cycle, bench_malloc_burst);
criterion_main!(benches);
