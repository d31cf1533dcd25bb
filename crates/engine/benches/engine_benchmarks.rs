use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use idmigrate_core::InMemoryIdentityApi;
use idmigrate_engine::rate::Unlimited;
use idmigrate_engine::{OrgCache, OrgCacheConfig, OrgKey, plan_chunks};

fn bench_chunk_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_chunks");
    for total_rows in [10_000u64, 1_000_000] {
        group.throughput(Throughput::Elements(total_rows));
        group.bench_with_input(BenchmarkId::from_parameter(total_rows), &total_rows, |b, &total_rows| {
            b.iter(|| black_box(plan_chunks(black_box(total_rows), 1_000)));
        });
    }
    group.finish();
}

/// Dry-run resolution: no remote calls, so this measures the cache itself
/// (single-flight bookkeeping, LRU store and stats).
fn bench_dry_run_resolution(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let keys: Vec<OrgKey> = (0..1_000).map(|i| OrgKey::external(format!("org-{}", i % 50))).collect();

    let mut group = c.benchmark_group("org_cache");
    group.throughput(Throughput::Elements(keys.len() as u64));
    group.bench_function("dry_run_resolve_1000_rows_50_orgs", |b| {
        b.iter(|| {
            rt.block_on(async {
                let cache = OrgCache::new(
                    InMemoryIdentityApi::arc(),
                    Arc::new(Unlimited),
                    OrgCacheConfig::default().with_dry_run(true),
                );
                for key in &keys {
                    black_box(cache.resolve(key, true, None).await.unwrap());
                }
                cache.stats()
            })
        });
    });
    group.finish();
}

criterion_group!(benches, bench_chunk_planning, bench_dry_run_resolution);
criterion_main!(benches);
