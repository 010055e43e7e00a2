use criterion::{black_box, criterion_group, criterion_main, Criterion};
use usage_aggregator::aggregate::base::group_bucket;
use usage_aggregator::aggregate::{reduce, rollup};
use usage_aggregator::lattice::AggregateKey;
use usage_aggregator::record::{AggregateRow, UsageRecord, VoNameRules};

const HOUR: i64 = 3600;
// 2024-01-10T00:00:00Z
const T0: i64 = 1_704_844_800;

fn records(n: i64) -> Vec<UsageRecord> {
    (0..n)
        .map(|i| UsageRecord {
            record_id: format!("job-{i}"),
            global_user_name: format!("/DC=org/CN=user{}", i % 64),
            vo_type: Some(if i % 3 == 0 { "voms" } else { "local" }.to_string()),
            vo_name: Some(format!("vo{}.production", i % 12)),
            machine_name: format!("ce{:02}.example.org", i % 16),
            status: Some(if i % 7 == 0 { "FAILED" } else { "DONE" }.to_string()),
            insert_time: T0 + HOUR,
            end_time: T0 + i % HOUR,
            cpu_duration: Some(i * 3),
            wall_duration: Some(i * 4),
            user_time: Some(i * 2),
            kernel_time: Some(i),
            major_page_faults: (i % 5 == 0).then_some(i),
        })
        .collect()
}

fn hourly_rows(rules: &VoNameRules) -> Vec<AggregateRow> {
    let records = records(4_096);
    (0..24)
        .flat_map(|h| group_bucket(&records, T0 + h * HOUR + HOUR - 1, HOUR, rules))
        .collect()
}

fn bench_base(c: &mut Criterion) {
    let rules = VoNameRules::default();
    let records = records(4_096);

    c.bench_function("base/group_bucket_4096", |b| {
        b.iter(|| {
            let rows = group_bucket(black_box(&records), T0 + HOUR - 1, HOUR, &rules);
            black_box(rows.len())
        })
    });
}

fn bench_reduce(c: &mut Criterion) {
    let rows = hourly_rows(&VoNameRules::default());

    c.bench_function("reduce/key_0_to_key_01", |b| {
        b.iter(|| black_box(reduce::group_rows(black_box(&rows), AggregateKey::Key01).len()))
    });
}

fn bench_rollup(c: &mut Criterion) {
    let rows = hourly_rows(&VoNameRules::default());

    c.bench_function("rollup/hour_to_day", |b| {
        b.iter(|| black_box(rollup::group_rows(black_box(&rows), T0, 24 * HOUR).len()))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_base(c);
    bench_reduce(c);
    bench_rollup(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
