use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use usage_aggregator::aggregate::{aggregate_base, align_down, bucket_end};
use usage_aggregator::clock::FixedClock;
use usage_aggregator::config::AggregationConfig;
use usage_aggregator::driver::{Driver, PassOutcome};
use usage_aggregator::lattice::{AggregateKey, REDUCTION_ORDER};
use usage_aggregator::metric::Metrics;
use usage_aggregator::query::machine_records;
use usage_aggregator::record::{AggregateRow, DimensionValues, UsageRecord, VoNameRules};
use usage_aggregator::store::MemoryStore;
use usage_aggregator::verify::verify_window;

const HOUR: i64 = 3600;
const DAY: i64 = 86_400;
// 2024-01-10T00:00:00Z
const T0: i64 = 1_704_844_800;

fn job(id: &str, machine: &str, end_time: i64, wall: i64) -> UsageRecord {
    UsageRecord {
        record_id: id.to_string(),
        global_user_name: "A".to_string(),
        vo_type: Some("voms".to_string()),
        vo_name: Some("X".to_string()),
        machine_name: machine.to_string(),
        status: Some("DONE".to_string()),
        insert_time: end_time + HOUR,
        end_time,
        cpu_duration: Some(wall / 2),
        wall_duration: Some(wall),
        ..Default::default()
    }
}

fn scenario_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.extend_records([
        job("r1", "M", T0 + 100, 100),
        job("r2", "M", T0 + 5_000, 50),
        job("r3", "M2", T0 + 40_000, 10),
    ]);
    store
}

fn config(resolution: i64, factors: Vec<i64>) -> AggregationConfig {
    AggregationConfig {
        resolution: Duration::from_secs(resolution as u64),
        factors,
        ..Default::default()
    }
}

fn rows_at(store: &MemoryStore, key: AggregateKey, resolution: i64) -> Vec<AggregateRow> {
    store
        .rows(key)
        .into_iter()
        .filter(|row| row.resolution == resolution)
        .collect()
}

fn jobs_and_wall(rows: &[AggregateRow]) -> Vec<(DimensionValues, i64, i64)> {
    rows.iter()
        .map(|row| (row.dims.clone(), row.metrics.n_jobs, row.metrics.wall_duration))
        .collect()
}

fn dims(
    user: Option<&str>,
    vo: Option<&str>,
    machine: Option<&str>,
    status: Option<&str>,
) -> DimensionValues {
    DimensionValues {
        user: user.map(str::to_string),
        vo: vo.map(str::to_string),
        machine: machine.map(str::to_string),
        status: status.map(str::to_string),
    }
}

/// Every row of every key.
fn snapshot(store: &MemoryStore) -> Vec<Vec<AggregateRow>> {
    AggregateKey::ALL.iter().map(|&key| store.rows(key)).collect()
}

/// Sums rows per (bucket, projected dimensions).
fn totals_by(
    rows: &[AggregateRow],
    key: AggregateKey,
) -> BTreeMap<(i64, DimensionValues), Metrics> {
    let mut out: BTreeMap<(i64, DimensionValues), Metrics> = BTreeMap::new();
    for row in rows {
        *out.entry((row.t_epoch, row.dims.project(key))).or_default() += row.metrics;
    }
    out
}

#[tokio::test]
async fn test_three_record_scenario() {
    let store = scenario_store();
    let driver = Driver::new(
        Arc::clone(&store),
        FixedClock::new(T0 + DAY),
        &config(DAY, vec![]),
    )
    .unwrap();

    let report = driver.run_window(T0).await.unwrap();
    assert_eq!(report.base.buckets, 1);
    assert_eq!(report.base.records_read, 3);

    let end = T0 + DAY - 1;

    let key_0 = rows_at(&store, AggregateKey::Key0, DAY);
    assert!(key_0.iter().all(|row| row.t_epoch == end));
    assert_eq!(
        jobs_and_wall(&key_0),
        vec![
            (dims(Some("A"), Some("X"), Some("M"), Some("DONE")), 2, 150),
            (dims(Some("A"), Some("X"), Some("M2"), Some("DONE")), 1, 10),
        ]
    );

    let key_01 = rows_at(&store, AggregateKey::Key01, DAY);
    assert_eq!(
        jobs_and_wall(&key_01),
        vec![
            (dims(Some("A"), Some("X"), Some("M"), None), 2, 150),
            (dims(Some("A"), Some("X"), Some("M2"), None), 1, 10),
        ]
    );

    let key_0211 = rows_at(&store, AggregateKey::Key0211, DAY);
    assert_eq!(
        jobs_and_wall(&key_0211),
        vec![(dims(Some("A"), None, None, None), 3, 160)]
    );
}

#[tokio::test]
async fn test_sum_conservation_across_buckets() {
    let store = Arc::new(MemoryStore::new());
    let mut expected = Metrics::zero();
    for i in 0..40 {
        let record = UsageRecord {
            record_id: format!("r{i}"),
            global_user_name: format!("user{}", i % 3),
            vo_type: Some("other".to_string()),
            vo_name: Some(format!("vo{}.prod", i % 2)),
            machine_name: format!("ce{}", i % 4),
            status: (i % 5 != 0).then(|| "DONE".to_string()),
            insert_time: T0 + 2 * DAY,
            end_time: T0 + i * 2_017,
            wall_duration: Some(i * 10),
            user_time: (i % 2 == 0).then_some(i),
            ..Default::default()
        };
        expected.add_record(&record);
        store.push_record(record);
    }

    let summary = aggregate_base(store.as_ref(), T0, HOUR, T0 + DAY, &VoNameRules::default())
        .await
        .unwrap();
    assert_eq!(summary.buckets, 24);
    assert_eq!(summary.records_read, 40);

    let actual: Metrics = rows_at(&store, AggregateKey::Key0, HOUR)
        .iter()
        .map(|row| row.metrics)
        .sum();
    assert_eq!(actual, expected);
}

#[tokio::test]
async fn test_reduction_equivalence_on_every_edge() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..30 {
        store.push_record(UsageRecord {
            record_id: format!("r{i}"),
            global_user_name: format!("user{}", i % 2),
            vo_type: Some("voms".to_string()),
            vo_name: Some(format!("vo{}", i % 3)),
            machine_name: format!("ce{}", i % 5),
            status: Some(if i % 4 == 0 { "FAILED" } else { "DONE" }.to_string()),
            insert_time: T0 + DAY,
            end_time: T0 + i * 900,
            cpu_duration: Some(i),
            wall_duration: Some(2 * i),
            ..Default::default()
        });
    }

    let driver = Driver::new(
        Arc::clone(&store),
        FixedClock::new(T0 + 12 * HOUR),
        &config(HOUR, vec![]),
    )
    .unwrap();
    driver.run_window(T0).await.unwrap();

    for edge in REDUCTION_ORDER {
        let parent = totals_by(&rows_at(&store, edge.parent, HOUR), edge.child);
        let child = totals_by(&rows_at(&store, edge.child, HOUR), edge.child);
        assert_eq!(parent, child, "edge {edge}");
    }
}

#[tokio::test]
async fn test_rollup_equivalence() {
    let store = scenario_store();
    store.push_record(job("r4", "M", T0 + 3 * DAY + 10, 7));

    let driver = Driver::new(
        Arc::clone(&store),
        FixedClock::new(T0 + 4 * DAY),
        &config(DAY, vec![7]),
    )
    .unwrap();
    let report = driver.run_window(T0).await.unwrap();
    assert_eq!(report.rolled.len(), 1);

    let week = 7 * DAY;

    for key in AggregateKey::ALL {
        let fine = rows_at(&store, key, DAY);
        let coarse = rows_at(&store, key, week);

        let mut expected: BTreeMap<(i64, DimensionValues), Metrics> = BTreeMap::new();
        for row in &fine {
            let end = bucket_end(align_down(row.t_epoch, week), week);
            *expected.entry((end, row.dims.clone())).or_default() += row.metrics;
        }
        assert_eq!(totals_by(&coarse, key), expected, "key {key}");
        assert!(coarse.iter().all(|row| (row.t_epoch + 1).rem_euclid(week) == 0));
    }
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let store = scenario_store();
    let driver = Driver::new(
        Arc::clone(&store),
        FixedClock::new(T0 + 2 * DAY),
        &config(HOUR, vec![24]),
    )
    .unwrap();

    driver.run_window(T0).await.unwrap();
    let first = snapshot(&store);

    driver.run_window(T0).await.unwrap();
    let second = snapshot(&store);

    assert_eq!(first, second);
    assert!(first.iter().all(|rows| !rows.is_empty()));
}

#[tokio::test]
async fn test_day_bucket_alignment() {
    let store = Arc::new(MemoryStore::new());
    let end_time = T0 + 3 * DAY + 12_345;
    store.push_record(job("r1", "M", end_time, 1));

    aggregate_base(
        store.as_ref(),
        T0 + 3 * DAY,
        DAY,
        T0 + 4 * DAY,
        &VoNameRules::default(),
    )
    .await
    .unwrap();

    let rows = rows_at(&store, AggregateKey::Key0, DAY);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].t_epoch, (end_time / DAY) * DAY + 86_399);
}

#[tokio::test]
async fn test_driver_passes_and_verification() {
    let store = Arc::new(MemoryStore::new());
    let clock = FixedClock::new(T0 + 2 * HOUR);
    let mut driver =
        Driver::new(Arc::clone(&store), clock.clone(), &config(HOUR, vec![24])).unwrap();
    driver.initialize().await.unwrap();

    assert_eq!(driver.run_pass().await.unwrap(), PassOutcome::Idle);

    // A late record lands in the first hour of the day.
    store.push_record(UsageRecord {
        insert_time: T0 + 2 * HOUR + 60,
        ..job("late", "M", T0 + 600, 40)
    });
    clock.advance(HOUR);

    let PassOutcome::Completed(report) = driver.run_pass().await.unwrap() else {
        panic!("expected a completed pass");
    };
    assert_eq!(report.window_start, T0);
    assert_eq!(report.base.records_read, 1);

    let rows = machine_records(store.as_ref(), "M", T0, T0 + HOUR, HOUR)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].metrics.wall_duration, 40);

    let report = verify_window(store.as_ref(), T0, T0 + 3 * HOUR, HOUR, driver.factors())
        .await
        .unwrap();
    assert!(report.passed(), "{:?}", report.failures().collect::<Vec<_>>());

    // Nothing new since the checkpoint moved.
    clock.advance(HOUR);
    assert_eq!(driver.run_pass().await.unwrap(), PassOutcome::Idle);
}
