//! Admission hot-path benchmarks
//!
//! Measures the per-request costs the gateway pays before any byte hits the
//! wire: group resolution, delay math, and limit-header parsing.
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use url::Url;

use apigate::headers::LimitSpec;
use apigate::limits::{GroupLimits, GroupQuotas};
use apigate::resolver::GroupResolver;

/// Benchmark URL-to-group resolution across resolver strategies
fn bench_group_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_resolution");
    group.throughput(Throughput::Elements(1));

    let anchored = GroupResolver::builder().anchor("api").build();
    let url = Url::parse("https://api.example.com/api/orders/42?page=2").unwrap();
    group.bench_function("anchor", |b| {
        b.iter(|| black_box(anchored.resolve(black_box(&url))))
    });

    let patterned = GroupResolver::builder()
        .pattern(r"^orders$", "orders")
        .unwrap()
        .pattern(r"^billing", "billing")
        .unwrap()
        .build();
    let url = Url::parse("https://api.example.com/v2/billing/7").unwrap();
    group.bench_function("pattern", |b| {
        b.iter(|| black_box(patterned.resolve(black_box(&url))))
    });

    let fallback = GroupResolver::builder().build();
    let url = Url::parse("https://api.example.com/misc/path#frag").unwrap();
    group.bench_function("fallback", |b| {
        b.iter(|| black_box(fallback.resolve(black_box(&url))))
    });

    group.finish();
}

/// Benchmark the per-dispatch accounting work
fn bench_delay_accounting(c: &mut Criterion) {
    let mut group = c.benchmark_group("delay_accounting");
    group.throughput(Throughput::Elements(1));

    let limits = GroupLimits::new("orders", &GroupQuotas::default());
    group.bench_function("calculate_delay", |b| {
        b.iter(|| black_box(limits.calculate_delay()))
    });

    group.bench_function("increment", |b| {
        b.iter(|| limits.increment())
    });

    group.finish();
}

/// Benchmark limit-header parsing and emission
fn bench_limit_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("limit_header");

    let value = "5 5;w=1, 100;w=60, 5000;w=3600, 100000;w=86400";
    group.bench_function("parse", |b| {
        b.iter(|| black_box(LimitSpec::parse(black_box(value))))
    });

    let spec = LimitSpec::parse(value).unwrap();
    group.bench_function("emit", |b| b.iter(|| black_box(spec.emit())));

    group.finish();
}

criterion_group!(
    benches,
    bench_group_resolution,
    bench_delay_accounting,
    bench_limit_header,
);

criterion_main!(benches);
