use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::debug;

use super::{validate_resolution, AggregationError, StepSummary};
use crate::lattice::{is_reduction_edge, AggregateKey};
use crate::metric::Metrics;
use crate::record::{AggregateRow, DimensionValues};
use crate::store::AggregateStore;

/// Recomputes `child` from `parent` at `resolution` for buckets ending at
/// or after `window_start`.
///
/// `child` must be a direct lattice child of `parent`.
pub async fn aggregate_by_key<S>(
    store: &S,
    parent: AggregateKey,
    child: AggregateKey,
    window_start: i64,
    resolution: i64,
) -> Result<StepSummary>
where
    S: AggregateStore,
{
    if !is_reduction_edge(parent, child) {
        return Err(AggregationError::NotALatticeEdge { parent, child }.into());
    }
    validate_resolution(resolution)?;

    let parent_rows = store
        .load_from(parent, resolution, window_start)
        .await
        .with_context(|| format!("loading {} from {window_start}", parent.table()))?;

    let rows = group_rows(&parent_rows, child);
    let written = rows.len() as u64;

    let replaced = store
        .replace_from(child, resolution, window_start, rows)
        .await
        .with_context(|| format!("replacing {} from {window_start}", child.table()))?;

    debug!(
        parent = %parent,
        child = %child,
        resolution,
        read = parent_rows.len(),
        removed = replaced.deleted,
        written,
        "reduced key",
    );

    Ok(StepSummary {
        rows_read: parent_rows.len() as u64,
        rows_deleted: replaced.deleted,
        rows_written: replaced.inserted,
    })
}

/// Groups parent rows by (resolution, bucket end, child-projected tuple)
/// and sums their metrics.
pub fn group_rows(rows: &[AggregateRow], child: AggregateKey) -> Vec<AggregateRow> {
    let mut groups: BTreeMap<(i64, i64, DimensionValues), Metrics> = BTreeMap::new();

    for row in rows {
        *groups
            .entry((row.resolution, row.t_epoch, row.dims.project(child)))
            .or_default() += row.metrics;
    }

    groups
        .into_iter()
        .map(|((resolution, t_epoch, dims), metrics)| AggregateRow {
            dims,
            resolution,
            t_epoch,
            metrics,
        })
        .collect()
}
