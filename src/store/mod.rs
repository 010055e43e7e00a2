pub mod clickhouse;
pub mod memory;

use std::future::Future;

use anyhow::Result;

use crate::lattice::AggregateKey;
use crate::record::{AggregateRow, DimensionValues, UsageRecord};

pub use self::clickhouse::ClickHouseStore;
pub use self::memory::MemoryStore;

/// Read access to the raw usage records.
pub trait RecordSource: Send + Sync {
    /// Records whose end time falls in `[start, end)`.
    fn records_ending_between(
        &self,
        start: i64,
        end: i64,
    ) -> impl Future<Output = Result<Vec<UsageRecord>>> + Send;

    /// The record with the smallest end time among those inserted at or
    /// after `since`.
    fn oldest_inserted_since(
        &self,
        since: i64,
    ) -> impl Future<Output = Result<Option<UsageRecord>>> + Send;
}

/// Read/write access to the fifteen aggregate tables.
///
/// Every range operation selects rows of one key at one resolution with
/// `t_epoch >= from`.
pub trait AggregateStore: Send + Sync {
    /// Deletes the selected rows, returning how many were removed.
    fn delete_from(
        &self,
        key: AggregateKey,
        resolution: i64,
        from: i64,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Inserts a batch of rows for `key`.
    fn insert(
        &self,
        key: AggregateKey,
        rows: &[AggregateRow],
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Deletes the selected rows and inserts `rows` in their place as one
    /// unit.
    fn replace_from(
        &self,
        key: AggregateKey,
        resolution: i64,
        from: i64,
        rows: Vec<AggregateRow>,
    ) -> impl Future<Output = Result<ReplaceSummary>> + Send;

    /// Loads the selected rows.
    fn load_from(
        &self,
        key: AggregateKey,
        resolution: i64,
        from: i64,
    ) -> impl Future<Output = Result<Vec<AggregateRow>>> + Send;

    /// Largest bucket end stored for `key` at `resolution`.
    fn latest_bucket_end(
        &self,
        key: AggregateKey,
        resolution: i64,
    ) -> impl Future<Output = Result<Option<i64>>> + Send;

    /// Rows of `key` matching a reporting query.
    fn query(
        &self,
        key: AggregateKey,
        query: &AggregateQuery,
    ) -> impl Future<Output = Result<Vec<AggregateRow>>> + Send;
}

/// Row counts of one delete-then-insert unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub deleted: u64,
    pub inserted: u64,
}

/// Reporting filter: dimension values that must match, one resolution and
/// an inclusive `t_epoch` range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateQuery {
    pub dims: DimensionValues,
    pub resolution: i64,
    pub t_from: i64,
    pub t_to: i64,
}

impl AggregateQuery {
    pub fn new(resolution: i64, t_from: i64, t_to: i64) -> Self {
        Self {
            dims: DimensionValues::default(),
            resolution,
            t_from,
            t_to,
        }
    }

    pub fn with_dims(mut self, dims: DimensionValues) -> Self {
        self.dims = dims;
        self
    }

    /// True if a row of `key` falls inside this query. Filters on
    /// dimensions `key` does not retain are ignored.
    pub fn matches(&self, key: AggregateKey, row: &AggregateRow) -> bool {
        row.resolution == self.resolution
            && row.t_epoch >= self.t_from
            && row.t_epoch <= self.t_to
            && row.dims.matches(&self.dims.project(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::Dimension;
    use crate::metric::Metrics;

    fn row(user: &str, resolution: i64, t_epoch: i64) -> AggregateRow {
        AggregateRow {
            dims: DimensionValues {
                user: Some(user.to_string()),
                ..Default::default()
            },
            resolution,
            t_epoch,
            metrics: Metrics::zero(),
        }
    }

    #[test]
    fn test_query_bounds_are_inclusive() {
        let q = AggregateQuery::new(3600, 3599, 7199);
        let key = AggregateKey::Key0211;
        assert!(q.matches(key, &row("a", 3600, 3599)));
        assert!(q.matches(key, &row("a", 3600, 7199)));
        assert!(!q.matches(key, &row("a", 3600, 10_799)));
        assert!(!q.matches(key, &row("a", 86_400, 3599)));
    }

    #[test]
    fn test_query_dimension_filter() {
        let mut dims = DimensionValues::default();
        dims.set(Dimension::User, Some("alice".to_string()));
        let q = AggregateQuery::new(60, 0, 1_000).with_dims(dims);
        assert!(q.matches(AggregateKey::Key0211, &row("alice", 60, 59)));
        assert!(!q.matches(AggregateKey::Key0211, &row("bob", 60, 59)));
    }

    #[test]
    fn test_query_ignores_dimensions_key_drops() {
        let mut dims = DimensionValues::default();
        dims.set(Dimension::User, Some("alice".to_string()));
        dims.set(Dimension::Machine, Some("ce01".to_string()));
        let q = AggregateQuery::new(60, 0, 1_000).with_dims(dims);

        let machine_row = AggregateRow {
            dims: DimensionValues {
                machine: Some("ce01".to_string()),
                ..Default::default()
            },
            resolution: 60,
            t_epoch: 59,
            metrics: Metrics::zero(),
        };
        assert!(q.matches(AggregateKey::Key0411, &machine_row));
        assert!(!q.matches(AggregateKey::Key0211, &row("bob", 60, 59)));
    }
}
