//! # Bifrost Bus Benchmarks
//!
//! | Path | Target |
//! |------|--------|
//! | publish to N subscribers | linear in N, no allocation per subscriber |
//! | local request round trip | < 10µs |
//! | cache encache with one watcher | < 5µs |

use bifrost_bus::{EventBus, RequestOptions};
use bifrost_cache::{BusCache, CacheItem};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn bench_publish_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("bus-publish");
    group.measurement_time(Duration::from_secs(5));

    for subscribers in [1usize, 10, 100] {
        let bus = EventBus::with_defaults();
        let hits = Arc::new(AtomicU64::new(0));
        for _ in 0..subscribers {
            let hits = Arc::clone(&hits);
            bus.listen("bench", move |_| {
                hits.fetch_add(1, Ordering::Relaxed);
            });
        }

        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_with_input(
            BenchmarkId::new("fan_out", subscribers),
            &subscribers,
            |b, _| b.iter(|| bus.send("bench", black_box(42u64))),
        );
    }
    group.finish();
}

fn bench_request_round_trip(c: &mut Criterion) {
    let bus = EventBus::with_defaults();
    bus.respond_stream("echo", |req| *req.payload::<u64>().unwrap_or(&0))
        .expect("responder");

    c.bench_function("bus-request/round_trip", |b| {
        b.iter(|| {
            bus.request("echo", black_box(7u64), RequestOptions::default(), |r| {
                black_box(r.payload::<u64>().copied());
            })
            .expect("request")
        })
    });
}

#[derive(Clone)]
struct Counter(u64);

impl CacheItem for Counter {
    fn type_tag(&self) -> &str {
        "counter"
    }
}

fn bench_cache_encache(c: &mut Criterion) {
    let bus = EventBus::with_defaults();
    let cache: BusCache<Counter, u8> = BusCache::new(Arc::clone(&bus), "bench");
    let id = Uuid::new_v4();
    cache
        .on_change(id, &[])
        .subscribe(|change| {
            black_box(change.value.0);
        })
        .expect("subscribe");

    let mut n = 0u64;
    c.bench_function("cache/encache_watched", |b| {
        b.iter(|| {
            n += 1;
            cache.encache(id, Counter(n), 1);
        })
    });
}

criterion_group!(
    benches,
    bench_publish_fan_out,
    bench_request_round_trip,
    bench_cache_encache
);
criterion_main!(benches);
