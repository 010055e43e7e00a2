use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::debug;

use super::{target_resolution, StepSummary};
use crate::lattice::AggregateKey;
use crate::metric::Metrics;
use crate::record::{AggregateRow, DimensionValues};
use crate::store::AggregateStore;

/// Rolls `key` up from `base_resolution` into `factor * base_resolution`
/// for buckets ending at or after `window_start`.
///
/// `window_start` should be a multiple of the target resolution.
pub async fn aggregate_by_resolution<S>(
    store: &S,
    key: AggregateKey,
    window_start: i64,
    base_resolution: i64,
    factor: i64,
) -> Result<StepSummary>
where
    S: AggregateStore,
{
    let target = target_resolution(base_resolution, factor)?;

    let fine = store
        .load_from(key, base_resolution, window_start)
        .await
        .with_context(|| format!("loading {} at {base_resolution}s", key.table()))?;

    let rows = group_rows(&fine, window_start, target);
    let written = rows.len() as u64;

    let replaced = store
        .replace_from(key, target, window_start, rows)
        .await
        .with_context(|| format!("replacing {} at {target}s", key.table()))?;

    debug!(
        key = %key,
        base_resolution,
        target,
        read = fine.len(),
        removed = replaced.deleted,
        written,
        "rolled up key",
    );

    Ok(StepSummary {
        rows_read: fine.len() as u64,
        rows_deleted: replaced.deleted,
        rows_written: replaced.inserted,
    })
}

/// End of the `target`-wide bucket, counted from `window_start`, that holds
/// a fine bucket ending at `t_epoch`.
pub fn coarse_end(t_epoch: i64, window_start: i64, target: i64) -> i64 {
    window_start + (t_epoch - window_start).div_euclid(target) * target + target - 1
}

/// Groups fine rows into coarse buckets per full dimension tuple.
pub fn group_rows(rows: &[AggregateRow], window_start: i64, target: i64) -> Vec<AggregateRow> {
    let mut groups: BTreeMap<(i64, DimensionValues), Metrics> = BTreeMap::new();

    for row in rows {
        let end = coarse_end(row.t_epoch, window_start, target);
        *groups.entry((end, row.dims.clone())).or_default() += row.metrics;
    }

    groups
        .into_iter()
        .map(|((t_epoch, dims), metrics)| AggregateRow {
            dims,
            resolution: target,
            t_epoch,
            metrics,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregationError;
    use crate::store::MemoryStore;

    const HOUR: i64 = 3600;

    fn vo_row(vo: &str, t_epoch: i64, n_jobs: i64) -> AggregateRow {
        AggregateRow {
            dims: DimensionValues {
                vo: Some(vo.to_string()),
                ..Default::default()
            },
            resolution: HOUR,
            t_epoch,
            metrics: Metrics {
                n_jobs,
                cpu_duration: n_jobs * 10,
                ..Metrics::zero()
            },
        }
    }

    #[test]
    fn test_coarse_end() {
        let day = 24 * HOUR;
        assert_eq!(coarse_end(HOUR - 1, 0, day), day - 1);
        assert_eq!(coarse_end(day - 1, 0, day), day - 1);
        assert_eq!(coarse_end(day + HOUR - 1, 0, day), 2 * day - 1);
        assert_eq!(coarse_end(day + HOUR - 1, day, day), 2 * day - 1);
    }

    #[test]
    fn test_group_rows_sums_fine_buckets() {
        let rows = [
            vo_row("atlas", HOUR - 1, 1),
            vo_row("atlas", 2 * HOUR - 1, 2),
            vo_row("cms", 2 * HOUR - 1, 5),
            vo_row("atlas", 5 * HOUR - 1, 4),
        ];
        let out = group_rows(&rows, 0, 4 * HOUR);

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].t_epoch, 4 * HOUR - 1);
        assert_eq!(out[0].dims.vo.as_deref(), Some("atlas"));
        assert_eq!(out[0].metrics.n_jobs, 3);
        assert_eq!(out[0].metrics.cpu_duration, 30);
        assert_eq!(out[0].resolution, 4 * HOUR);
        assert_eq!(out[1].dims.vo.as_deref(), Some("cms"));
        assert_eq!(out[2].t_epoch, 8 * HOUR - 1);
        assert_eq!(out[2].metrics.n_jobs, 4);
    }

    #[tokio::test]
    async fn test_aggregate_by_resolution_writes_target_resolution() {
        let store = MemoryStore::new();
        let key = AggregateKey::Key0321;
        store
            .insert(
                key,
                &[vo_row("atlas", HOUR - 1, 1), vo_row("atlas", 2 * HOUR - 1, 1)],
            )
            .await
            .unwrap();

        let summary = aggregate_by_resolution(&store, key, 0, HOUR, 24)
            .await
            .unwrap();
        assert_eq!(summary.rows_read, 2);
        assert_eq!(summary.rows_written, 1);

        let daily = store.load_from(key, 24 * HOUR, 0).await.unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].t_epoch, 24 * HOUR - 1);
        assert_eq!(daily[0].metrics.n_jobs, 2);

        // Fine rows stay in place.
        assert_eq!(store.load_from(key, HOUR, 0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_aggregate_by_resolution_rejects_factor_one() {
        let store = MemoryStore::new();
        let err = aggregate_by_resolution(&store, AggregateKey::Key0, 0, HOUR, 1)
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<AggregationError>(),
            Some(&AggregationError::InvalidFactor(1))
        );
    }
}
