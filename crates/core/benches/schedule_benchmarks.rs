use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use cakeday_core::schedule::{next_occurrence_utc, parse_time_zone, RetryPolicy};
use chrono::{DateTime, NaiveDate, Utc};

fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn bench_next_occurrence(c: &mut Criterion) {
    let mut group = c.benchmark_group("next_occurrence_utc");
    group.throughput(Throughput::Elements(1));

    let birth = NaiveDate::from_ymd_opt(1992, 2, 29).unwrap();
    for zone in ["UTC", "Asia/Jakarta", "America/New_York", "Pacific/Auckland"] {
        let tz = parse_time_zone(zone).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(zone), &tz, |b, tz| {
            b.iter(|| next_occurrence_utc(black_box(birth), *tz, black_box(now())).unwrap())
        });
    }

    group.finish();
}

fn bench_zone_lookup(c: &mut Criterion) {
    c.bench_function("parse_time_zone", |b| {
        b.iter(|| parse_time_zone(black_box("America/Argentina/Buenos_Aires")).unwrap())
    });
}

fn bench_retry_delay(c: &mut Criterion) {
    let policy = RetryPolicy::default();
    c.bench_function("retry_next_delay", |b| {
        b.iter(|| policy.next_delay(black_box(7)))
    });
}

criterion_group!(
    benches,
    bench_next_occurrence,
    bench_zone_lookup,
    bench_retry_delay
);
criterion_main!(benches);
