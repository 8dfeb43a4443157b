//! Benchmarks for the local tier and the cached read path
//!
//! Target: local hits well under a microsecond

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;
use smart_cache::cache::{
    CacheEntry, Codec, CompressionAlgorithm, CompressionConfig, LocalTier, LocalTierConfig,
};
use smart_cache::{CacheOptions, MemoryRemoteStore, TieredCache, TieredCacheConfig};
use std::sync::Arc;

fn bench_local_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_tier");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_with_eviction", |b| {
        let tier = LocalTier::new(LocalTierConfig {
            max_size_bytes: 1024 * 1024,
            max_items: 1000,
        });
        let mut counter = 0u64;

        b.iter(|| {
            counter += 1;
            let entry = CacheEntry::new(format!("key-{}", counter), json!(counter), 8, 300);
            let _ = tier.set(black_box(entry));
        });
    });

    group.finish();
}

fn bench_local_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_tier");
    group.throughput(Throughput::Elements(1));

    let tier = LocalTier::new(LocalTierConfig::default());
    for i in 0..1000 {
        let _ = tier.set(CacheEntry::new(format!("key-{:04}", i), json!({ "id": i }), 16, 300));
    }

    group.bench_function("get_hit", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let key = format!("key-{:04}", counter % 1000);
            black_box(tier.get(&key));
        });
    });

    group.finish();
}

fn bench_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let payload = json!({
        "id": 42,
        "description": "a fairly repetitive product description ".repeat(100),
    });

    for algorithm in [
        CompressionAlgorithm::Lz4,
        CompressionAlgorithm::Zstd,
        CompressionAlgorithm::Snappy,
    ] {
        let codec = Codec::with_config(CompressionConfig {
            algorithm,
            threshold_bytes: 0,
            ..Default::default()
        });
        group.bench_function(format!("encode_{}", algorithm), |b| {
            b.iter(|| codec.encode_for_storage("bench", black_box(&payload), true))
        });
    }

    group.finish();
}

fn bench_tiered_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("tiered_cache");
    group.throughput(Throughput::Elements(1));

    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = TieredCache::new(TieredCacheConfig::default(), Arc::new(MemoryRemoteStore::new())).unwrap();
    let options = CacheOptions::new();
    rt.block_on(async {
        for i in 0..1000 {
            let _ = cache.set(&format!("key-{:04}", i), &i, &options).await;
        }
    });

    group.bench_function("get_local_hit", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let key = format!("key-{:04}", counter % 1000);
            rt.block_on(async { black_box(cache.get::<u64>(&key, &options).await) })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_local_set,
    bench_local_get,
    bench_compression,
    bench_tiered_get,
);
criterion_main!(benches);
