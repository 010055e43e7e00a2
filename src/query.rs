//! Read helpers for reporting front-ends.

use anyhow::Result;

use crate::aggregate::{validate_resolution, AggregationError};
use crate::lattice::{AggregateKey, Dimension};
use crate::record::{AggregateRow, DimensionValues};
use crate::store::{AggregateQuery, AggregateStore};

/// Converts the continuous interval `[q_start, q_end)` into bucket-end
/// bounds at resolution `resolution`:
/// `[q_start - q_start mod R, q_end - q_end mod R + R - 1]`.
pub fn sampling_aligned_interval(
    q_start: i64,
    q_end: i64,
    resolution: i64,
) -> Result<(i64, i64), AggregationError> {
    validate_resolution(resolution)?;
    let lo = q_start - q_start.rem_euclid(resolution);
    let hi = q_end - q_end.rem_euclid(resolution) + resolution - 1;
    Ok((lo, hi))
}

/// Builds the query for every bucket overlapping `[q_start, q_end)`.
///
/// The last covered second is `q_end - 1`, so the bucket that starts at an
/// aligned `q_end` is not returned.
pub fn interval_query(
    q_start: i64,
    q_end: i64,
    resolution: i64,
    dims: DimensionValues,
) -> Result<AggregateQuery> {
    let (lo, hi) = sampling_aligned_interval(q_start, q_end.saturating_sub(1), resolution)?;
    Ok(AggregateQuery::new(resolution, lo, hi).with_dims(dims))
}

/// Rows of `key` matching `dims` for `[q_start, q_end)`.
pub async fn aggregate_records<S: AggregateStore>(
    store: &S,
    key: AggregateKey,
    dims: DimensionValues,
    q_start: i64,
    q_end: i64,
    resolution: i64,
) -> Result<Vec<AggregateRow>> {
    let query = interval_query(q_start, q_end, resolution, dims)?;
    store.query(key, &query).await
}

/// Per-user usage from the `user` aggregate.
pub async fn user_records<S: AggregateStore>(
    store: &S,
    user: &str,
    q_start: i64,
    q_end: i64,
    resolution: i64,
) -> Result<Vec<AggregateRow>> {
    let mut dims = DimensionValues::default();
    dims.set(Dimension::User, Some(user.to_string()));
    aggregate_records(store, AggregateKey::Key0211, dims, q_start, q_end, resolution).await
}

/// Per-machine usage from the `machine` aggregate.
pub async fn machine_records<S: AggregateStore>(
    store: &S,
    machine: &str,
    q_start: i64,
    q_end: i64,
    resolution: i64,
) -> Result<Vec<AggregateRow>> {
    let mut dims = DimensionValues::default();
    dims.set(Dimension::Machine, Some(machine.to_string()));
    aggregate_records(store, AggregateKey::Key0411, dims, q_start, q_end, resolution).await
}
