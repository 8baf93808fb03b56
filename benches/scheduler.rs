//! Benchmarks for backend selection and resource locking
//!
//! Target: 10K placements/sec over 100 pools

use cinder_core::controlplane::{ResourceKey, ResourceLocks};
use cinder_core::domain::{BackendStats, PoolStats};
use cinder_core::scheduler::{BackendStateManager, FilterScheduler, RequestSpec, WeigherMultipliers};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;

fn scheduler_with_pools(backends: usize, pools_per_backend: usize) -> FilterScheduler {
    let state = Arc::new(BackendStateManager::new());
    for b in 0..backends {
        let pools = (0..pools_per_backend)
            .map(|p| {
                let mut pool = PoolStats::new(
                    format!("pool{}", p),
                    1000.0,
                    100.0 + ((b * pools_per_backend + p) % 900) as f64,
                );
                pool.thin_provisioning_support = p % 2 == 0;
                pool.capabilities
                    .insert("tier".to_string(), if p % 3 == 0 { "ssd" } else { "hdd" }.to_string());
                pool
            })
            .collect();
        let stats = BackendStats {
            volume_backend_name: format!("backend{}", b),
            vendor_name: "bench".to_string(),
            driver_version: "1.0".to_string(),
            storage_protocol: "iSCSI".to_string(),
            pools,
        };
        state.update_from_stats(&format!("node{}@backend{}", b, b), "nova", &stats);
    }
    FilterScheduler::new(state, WeigherMultipliers::default())
}

fn bench_select_backend(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler");
    group.throughput(Throughput::Elements(1));

    let scheduler = scheduler_with_pools(10, 10);
    let spec = RequestSpec::new(10);

    group.bench_function("select_backend_100_pools", |b| {
        b.iter(|| {
            let _ = scheduler.select_backend(black_box(&spec));
        });
    });

    let mut typed = RequestSpec::new(10);
    typed
        .extra_specs
        .insert("capabilities:tier".to_string(), "ssd".to_string());
    typed.availability_zone = Some("nova".to_string());

    group.bench_function("select_backend_with_extra_specs", |b| {
        b.iter(|| {
            let _ = scheduler.select_backend(black_box(&typed));
        });
    });

    group.finish();
}

fn bench_lock_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("resource_locks");
    group.throughput(Throughput::Elements(100));

    let rt = tokio::runtime::Runtime::new().unwrap();
    let locks = ResourceLocks::new();

    group.bench_function("concurrent_100_locks", |b| {
        b.to_async(&rt).iter(|| {
            let locks = locks.clone();
            async move {
                let mut handles = Vec::new();
                for i in 0..100 {
                    let locks = locks.clone();
                    handles.push(tokio::spawn(async move {
                        let key = ResourceKey::volume(format!("vol-{}", i % 10));
                        let _guard = locks.lock(key).await;
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            }
        });
    });

    group.bench_function("lock_all_volume_and_snapshot", |b| {
        let mut counter = 0u64;
        b.to_async(&rt).iter(|| {
            counter += 1;
            let keys = vec![
                ResourceKey::snapshot(format!("snap-{}", counter % 50)),
                ResourceKey::volume(format!("vol-{}", counter % 50)),
            ];
            let locks = locks.clone();
            async move {
                let _guards = locks.lock_all(black_box(keys)).await;
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_select_backend, bench_lock_throughput);
criterion_main!(benches);
