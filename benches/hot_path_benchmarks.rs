//! # Hot Path Benchmarks
//!
//! Instance selection and rate limit admission run on every proxied request.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use banking_gateway::middleware::rate_limiting::{InMemoryStore, RateLimit, RateLimitStore};
use banking_gateway::routing::RouteTable;
use banking_gateway::{LoadBalancingStrategy, ServiceRouter};

fn router_with(strategy: LoadBalancingStrategy, instances: u16) -> ServiceRouter {
    let router = ServiceRouter::new(strategy);
    for i in 0..instances {
        router.add_instance("accounts", &format!("accounts-{}", i), 8002, "http");
    }
    router
}

fn bench_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("instance_selection");
    group.throughput(Throughput::Elements(1));

    for strategy in [
        LoadBalancingStrategy::RoundRobin,
        LoadBalancingStrategy::LeastConnections,
        LoadBalancingStrategy::LeastResponseTime,
        LoadBalancingStrategy::Random,
    ] {
        for instances in [2u16, 16] {
            let router = router_with(strategy, instances);
            group.bench_with_input(
                BenchmarkId::new(strategy.as_str(), instances),
                &instances,
                |b, _| {
                    b.iter(|| {
                        let instance = router.select_instance(black_box("accounts"));
                        if let Some(instance) = instance {
                            router.record_completion(
                                "accounts",
                                instance.base_url(),
                                Duration::from_millis(3),
                                true,
                            );
                        }
                    })
                },
            );
        }
    }
    group.finish();
}

fn bench_route_resolution(c: &mut Criterion) {
    let table = RouteTable::default();
    c.bench_function("route_resolve", |b| {
        b.iter(|| table.resolve(black_box("/api/v1/transactions/8812/reversal")))
    });
}

fn bench_admission(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let store = InMemoryStore::new();
    let limit = RateLimit::new(1_000_000, Duration::from_secs(60));
    let clock = AtomicI64::new(1_700_000_000_000);

    let mut group = c.benchmark_group("rate_limit_admission");
    group.throughput(Throughput::Elements(1));
    for keys in [1usize, 1024] {
        group.bench_with_input(BenchmarkId::new("in_memory", keys), &keys, |b, &keys| {
            let mut n = 0usize;
            b.to_async(&rt).iter(|| {
                n = n.wrapping_add(1);
                let key = format!("rate_limit:user:u{}:GET:/api/v1/accounts", n % keys);
                let now = clock.fetch_add(1, Ordering::Relaxed);
                let store = &store;
                let limit = &limit;
                async move { store.admit(&key, limit, now).await }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_selection, bench_route_resolution, bench_admission);
criterion_main!(benches);
