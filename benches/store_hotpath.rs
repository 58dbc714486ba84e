//! Benchmarks for the cache hot path
//!
//! This benchmark measures:
//! - Store get/put under LRU bookkeeping
//! - Freshness classification
//! - Atomic invalidation batches
//! - Fresh reads through the engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use stalewise::cache::{CacheKey, CacheStore, FreshnessPolicy, StoreOp};
use stalewise::{CacheEngine, EngineConfig, ManualClock, MemorySecureStore};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

fn keys(ns: &str, n: usize) -> Vec<CacheKey> {
    (0..n)
        .map(|i| CacheKey::new(ns, &i.to_string()).unwrap())
        .collect()
}

fn filled_store(n: usize, now: SystemTime) -> (CacheStore<Value>, Vec<CacheKey>) {
    let store = CacheStore::new(NonZeroUsize::new(n).unwrap());
    let keys = keys("event-detail", n);
    for (i, key) in keys.iter().enumerate() {
        store.put(key, json!({ "id": i }), FreshnessPolicy::detail(), now);
    }
    (store, keys)
}

fn bench_store_get(c: &mut Criterion) {
    let now = SystemTime::now();
    let mut group = c.benchmark_group("store_get");

    for size in [64usize, 1024] {
        let (store, keys) = filled_store(size, now);
        group.throughput(Throughput::Elements(keys.len() as u64));
        group.bench_with_input(BenchmarkId::new("get", size), &keys, |b, keys| {
            b.iter(|| {
                for key in keys {
                    black_box(store.get(black_box(key), now));
                }
            })
        });
        group.bench_with_input(BenchmarkId::new("peek", size), &keys, |b, keys| {
            b.iter(|| {
                for key in keys {
                    black_box(store.peek(black_box(key), now));
                }
            })
        });
    }
    group.finish();
}

fn bench_store_put(c: &mut Criterion) {
    let now = SystemTime::now();
    let mut group = c.benchmark_group("store_put");
    let keys = keys("events-list", 2048);
    group.throughput(Throughput::Elements(keys.len() as u64));

    // capacity below the key count so every put past it evicts
    group.bench_function("put_with_eviction", |b| {
        let store = CacheStore::new(NonZeroUsize::new(512).unwrap());
        b.iter(|| {
            for key in &keys {
                store.put(key, json!(1), FreshnessPolicy::list(), now);
            }
        })
    });
    group.finish();
}

fn bench_classification(c: &mut Criterion) {
    let now = SystemTime::now();
    let (store, keys) = filled_store(1, now);
    let entry = store.entry(&keys[0]).unwrap();

    let mut group = c.benchmark_group("classify");
    for (label, age) in [("fresh", 60u64), ("stale", 26 * 60), ("expired", 31 * 60)] {
        let at = now + Duration::from_secs(age);
        group.bench_function(label, |b| b.iter(|| black_box(entry.classify(black_box(at)))));
    }
    group.finish();
}

fn bench_apply_batch(c: &mut Criterion) {
    let now = SystemTime::now();
    let mut group = c.benchmark_group("apply");

    group.bench_function("cascade_batch", |b| {
        let (store, keys) = filled_store(256, now);
        b.iter(|| {
            let ops = vec![
                StoreOp::Remove(keys[0].clone()),
                StoreOp::RemoveNamespace("events-list".to_string()),
                StoreOp::Put {
                    key: keys[1].clone(),
                    entry: stalewise::CacheEntry::new(json!(2), now, FreshnessPolicy::detail()),
                },
            ];
            black_box(store.apply(ops))
        })
    });
    group.finish();
}

fn bench_engine_fresh_read(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let engine = CacheEngine::builder()
        .with_config(EngineConfig::standard())
        .with_clock(Arc::new(ManualClock::default()))
        .with_secure_store(Arc::new(MemorySecureStore::new()))
        .build()
        .unwrap();
    let details = engine
        .register::<Value, _>("event-detail", |key: CacheKey| async move {
            Ok::<_, stalewise::Error>(json!({ "id": key.identity() }))
        })
        .unwrap();
    rt.block_on(details.read("42")).unwrap();

    c.bench_function("engine_fresh_read", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(details.read(black_box("42")).await.unwrap()) })
    });
}

criterion_group!(
    benches,
    bench_store_get,
    bench_store_put,
    bench_classification,
    bench_apply_batch,
    bench_engine_fresh_read
);
criterion_main!(benches);
