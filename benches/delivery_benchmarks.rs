//! Benchmarks for the per-subscriber hot path of a dispatch.
//!
//! Every event passes filter evaluation, the rate limiter and the circuit
//! check for each interested subscriber, and is signed once per attempt.

use std::{hint::black_box, sync::Arc, time::Duration};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use outpost_core::{FilterGroup, FilterRule, RealClock, SubscriberId};
use outpost_delivery::{
    filter::evaluate_group, signing::sign_payload, CircuitBreakerManager, CircuitConfig,
    RateLimiterRegistry,
};
use outpost_testing::EventBuilder;
use serde_json::json;
use tokio::runtime::Runtime;

fn bench_filter_evaluation(c: &mut Criterion) {
    let document = EventBuilder::with_defaults()
        .field("tags", json!(["design", "review", "q3"]))
        .build()
        .to_document();

    let flat = FilterGroup::all(vec![
        FilterRule::new("event_type", "starts_with", "document."),
        FilterRule::new("payload.visibility", "eq", "public"),
        FilterRule::new("payload.revision", "gt", 1),
    ]);
    let nested = FilterGroup::any(vec![FilterRule::new("actor.type", "eq", "bot")])
        .with_group(FilterGroup::all(vec![
            FilterRule::new("payload.tags", "contains", "review"),
            FilterRule::new("resource.name", "regex", "^Design"),
            FilterRule::new("payload.archived", "exists", "").negated(),
        ]));

    let mut group = c.benchmark_group("filter");
    group.throughput(Throughput::Elements(1));
    group.bench_function("flat_all", |b| b.iter(|| evaluate_group(black_box(&flat), &document)));
    group.bench_function("nested_any", |b| {
        b.iter(|| evaluate_group(black_box(&nested), &document));
    });
    group.finish();
}

fn bench_signing(c: &mut Criterion) {
    let mut group = c.benchmark_group("signing");

    for size in [256usize, 4 * 1024, 64 * 1024] {
        let payload = vec![b'x'; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("hmac_sha256", size), &payload, |b, payload| {
            b.iter(|| sign_payload(black_box(payload), "whsec_benchmark"));
        });
    }

    group.finish();
}

fn bench_admission(c: &mut Criterion) {
    let Ok(rt) = Runtime::new() else {
        return;
    };
    let clock = Arc::new(RealClock::new());
    let limiter = RateLimiterRegistry::new(clock.clone());
    let circuits = CircuitBreakerManager::new(
        CircuitConfig { recovery_timeout: Duration::from_secs(30), ..CircuitConfig::default() },
        clock,
    );
    let subscriber = SubscriberId::new();
    rt.block_on(limiter.set_limit(subscriber, i64::from(i32::MAX)));

    let mut group = c.benchmark_group("admission");
    group.bench_function("rate_limiter_allow", |b| {
        b.to_async(&rt).iter(|| limiter.allow(black_box(subscriber)));
    });
    group.bench_function("circuit_allow", |b| {
        b.to_async(&rt).iter(|| circuits.allow(black_box(subscriber)));
    });
    group.finish();
}

criterion_group!(benches, bench_filter_evaluation, bench_signing, bench_admission);
criterion_main!(benches);
