use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::{bucket_end, validate_resolution, BaseSummary};
use crate::clock::format_epoch;
use crate::lattice::AggregateKey;
use crate::metric::Metrics;
use crate::record::{AggregateRow, DimensionValues, UsageRecord, VoNameRules};
use crate::store::{AggregateStore, RecordSource};

/// Rebuilds `key_0` at `resolution` for every bucket from `window_start` up
/// to `now`.
///
/// Existing `key_0` rows from `window_start` on are deleted once up front.
/// Each bucket is then fetched, grouped and inserted as its own batch.
/// `window_start` must be a multiple of `resolution`.
pub async fn aggregate_base<S>(
    store: &S,
    window_start: i64,
    resolution: i64,
    now: i64,
    rules: &VoNameRules,
) -> Result<BaseSummary>
where
    S: RecordSource + AggregateStore,
{
    validate_resolution(resolution)?;

    let key = AggregateKey::ROOT;
    let mut summary = BaseSummary {
        rows_deleted: store
            .delete_from(key, resolution, window_start)
            .await
            .with_context(|| format!("clearing {} from {window_start}", key.table()))?,
        ..Default::default()
    };

    info!(
        key = %key,
        resolution,
        window_start = %format_epoch(window_start),
        removed = summary.rows_deleted,
        "removed stale base rows",
    );

    let mut t = window_start;
    while t < now {
        let end = t.saturating_add(resolution);
        let records = store
            .records_ending_between(t, end)
            .await
            .with_context(|| format!("reading records ending in [{t}, {end})"))?;

        let rows = group_bucket(&records, bucket_end(t, resolution), resolution, rules);
        if !rows.is_empty() {
            store
                .insert(key, &rows)
                .await
                .with_context(|| format!("writing {} bucket {t}", key.table()))?;
        }

        debug!(
            bucket_start = t,
            records = records.len(),
            rows = rows.len(),
            "aggregated base bucket",
        );

        summary.buckets += 1;
        summary.records_read += records.len() as u64;
        summary.rows_written += rows.len() as u64;
        t = end;
    }

    Ok(summary)
}

/// Groups one bucket's records by (user, VO, machine, status) and sums
/// their metrics. Rows come back in dimension order.
pub fn group_bucket(
    records: &[UsageRecord],
    t_epoch: i64,
    resolution: i64,
    rules: &VoNameRules,
) -> Vec<AggregateRow> {
    let mut groups: BTreeMap<DimensionValues, Metrics> = BTreeMap::new();

    for record in records {
        groups
            .entry(DimensionValues::from_record(record, rules))
            .or_default()
            .add_record(record);
    }

    groups
        .into_iter()
        .map(|(dims, metrics)| AggregateRow {
            dims,
            resolution,
            t_epoch,
            metrics,
        })
        .collect()
}
