//! Benchmarks for the proxy data plane's hot lookup paths.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use meshproxy::headers::Headers;
use meshproxy::retry::RetryPolicy;
use meshproxy::router::{HeaderMatch, PathMatch, RouteEntry, RouteTable, Router};
use meshproxy::timeout::{ProxyTimeout, TimeoutPolicy};

fn bench_router(c: &mut Criterion) {
    let mut group = c.benchmark_group("router");
    group.throughput(Throughput::Elements(1));

    let mut routes = Vec::new();
    for i in 0..50 {
        routes.push(RouteEntry::new(
            format!("route-{}", i),
            PathMatch::prefix(format!("/api/v{}/", i)),
            format!("cluster-{}", i),
        ));
    }
    routes.push(
        RouteEntry::new("exact", PathMatch::exact("/api/v25/users"), "exact-cluster")
            .with_header(HeaderMatch::present("x-tenant")),
    );
    let table = RouteTable::with_routes(routes);

    let headers = Headers::from([
        (":path", "/api/v25/users"),
        ("host", "192.168.100.100"),
        ("x-tenant", "acme"),
    ]);

    group.bench_function("route_exact_match", |b| {
        b.iter(|| black_box(table.route(black_box(&headers), 1)).is_some())
    });

    let miss = Headers::from([(":path", "/other"), ("host", "192.168.100.100")]);
    group.bench_function("route_miss", |b| {
        b.iter(|| black_box(table.route(black_box(&miss), 1)).is_none())
    });

    group.finish();
}

fn bench_retry_policy(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_policy");
    group.throughput(Throughput::Elements(1));

    let policy = RetryPolicy::new().with_retryable_status_codes(vec![502, 503, 504]);

    group.bench_function("is_retryable_status", |b| {
        b.iter(|| black_box(policy.is_retryable_status(black_box(503))))
    });

    group.finish();
}

fn bench_timeout_parse(c: &mut Criterion) {
    let policy = TimeoutPolicy {
        global_timeout_ms: 30_000,
        per_try_timeout_ms: 500,
    };
    let headers = Headers::from([
        (":path", "/"),
        ("x-mesh-global-timeout-ms", "1000"),
        ("x-mesh-try-timeout-ms", "100"),
    ]);

    c.bench_function("timeout_parse_with_overrides", |b| {
        b.iter(|| black_box(ProxyTimeout::parse(black_box(&policy), black_box(&headers))))
    });
}

fn bench_headers(c: &mut Criterion) {
    let mut group = c.benchmark_group("headers");
    group.throughput(Throughput::Elements(1));

    let mut headers = Headers::new();
    for i in 0..16 {
        headers.set(format!("x-header-{}", i), "value");
    }

    group.bench_function("get_case_insensitive", |b| {
        b.iter(|| black_box(headers.get(black_box("X-HEADER-9"))))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_router,
    bench_retry_policy,
    bench_timeout_parse,
    bench_headers
);
criterion_main!(benches);
