use std::collections::BTreeMap;

use anyhow::{bail, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use super::{AggregateQuery, AggregateStore, RecordSource, ReplaceSummary};
use crate::lattice::AggregateKey;
use crate::metric::Metrics;
use crate::record::{AggregateRow, DimensionValues, UsageRecord};

/// Row identity within one key table.
type RowId = (i64, i64, DimensionValues);

/// In-process store holding raw records and all aggregate tables.
///
/// Each key table sits behind its own map entry, so a `replace_from` on one
/// key is atomic with respect to readers of that key.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<Vec<UsageRecord>>,
    tables: DashMap<AggregateKey, BTreeMap<RowId, Metrics>>,
    failing_key: Mutex<Option<AggregateKey>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("records", &self.records.read().len())
            .field("tables", &self.tables.len())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw record.
    pub fn push_record(&self, record: UsageRecord) {
        self.records.write().push(record);
    }

    pub fn extend_records<I: IntoIterator<Item = UsageRecord>>(&self, records: I) {
        self.records.write().extend(records);
    }

    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }

    /// Number of rows stored for `key` across all resolutions.
    pub fn row_count(&self, key: AggregateKey) -> usize {
        self.tables.get(&key).map_or(0, |t| t.len())
    }

    /// Every row of `key`, ordered by resolution, bucket end and dimensions.
    pub fn rows(&self, key: AggregateKey) -> Vec<AggregateRow> {
        self.tables
            .get(&key)
            .map(|t| t.iter().map(to_row).collect())
            .unwrap_or_default()
    }

    /// Makes every write to `key` fail until cleared.
    pub fn fail_writes_to(&self, key: Option<AggregateKey>) {
        *self.failing_key.lock() = key;
    }

    fn check_writable(&self, key: AggregateKey) -> Result<()> {
        if *self.failing_key.lock() == Some(key) {
            bail!("injected write failure on {}", key.table());
        }
        Ok(())
    }
}

fn to_row((id, metrics): (&RowId, &Metrics)) -> AggregateRow {
    let (resolution, t_epoch, dims) = id;
    AggregateRow {
        dims: dims.clone(),
        resolution: *resolution,
        t_epoch: *t_epoch,
        metrics: *metrics,
    }
}

fn row_id(key: AggregateKey, row: &AggregateRow) -> RowId {
    (row.resolution, row.t_epoch, row.dims.project(key))
}

fn insert_rows(
    key: AggregateKey,
    table: &mut BTreeMap<RowId, Metrics>,
    rows: &[AggregateRow],
) -> Result<u64> {
    let mut staged = BTreeMap::new();
    for row in rows {
        let id = row_id(key, row);
        if table.contains_key(&id) || staged.contains_key(&id) {
            bail!(
                "duplicate row in {} at resolution {} t_epoch {}",
                key.table(),
                row.resolution,
                row.t_epoch
            );
        }
        staged.insert(id, row.metrics);
    }

    let inserted = staged.len() as u64;
    table.append(&mut staged);
    Ok(inserted)
}

fn delete_rows(table: &mut BTreeMap<RowId, Metrics>, resolution: i64, from: i64) -> u64 {
    let before = table.len();
    table.retain(|(res, t_epoch, _), _| !(*res == resolution && *t_epoch >= from));
    (before - table.len()) as u64
}

impl RecordSource for MemoryStore {
    async fn records_ending_between(&self, start: i64, end: i64) -> Result<Vec<UsageRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.end_time >= start && r.end_time < end)
            .cloned()
            .collect())
    }

    async fn oldest_inserted_since(&self, since: i64) -> Result<Option<UsageRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.insert_time >= since)
            .min_by_key(|r| r.end_time)
            .cloned())
    }
}

impl AggregateStore for MemoryStore {
    async fn delete_from(&self, key: AggregateKey, resolution: i64, from: i64) -> Result<u64> {
        self.check_writable(key)?;
        Ok(self
            .tables
            .get_mut(&key)
            .map_or(0, |mut t| delete_rows(&mut t, resolution, from)))
    }

    async fn insert(&self, key: AggregateKey, rows: &[AggregateRow]) -> Result<u64> {
        self.check_writable(key)?;
        if rows.is_empty() {
            return Ok(0);
        }
        let mut table = self.tables.entry(key).or_default();
        insert_rows(key, &mut table, rows)
    }

    async fn replace_from(
        &self,
        key: AggregateKey,
        resolution: i64,
        from: i64,
        rows: Vec<AggregateRow>,
    ) -> Result<ReplaceSummary> {
        self.check_writable(key)?;
        let mut table = self.tables.entry(key).or_default();

        // Stage on a copy so a rejected batch leaves the table untouched.
        let mut next = table.clone();
        let deleted = delete_rows(&mut next, resolution, from);
        let inserted = insert_rows(key, &mut next, &rows)?;
        *table = next;

        Ok(ReplaceSummary { deleted, inserted })
    }

    async fn load_from(
        &self,
        key: AggregateKey,
        resolution: i64,
        from: i64,
    ) -> Result<Vec<AggregateRow>> {
        let Some(table) = self.tables.get(&key) else {
            return Ok(Vec::new());
        };
        Ok(table
            .iter()
            .filter(|((res, t_epoch, _), _)| *res == resolution && *t_epoch >= from)
            .map(to_row)
            .collect())
    }

    async fn latest_bucket_end(&self, key: AggregateKey, resolution: i64) -> Result<Option<i64>> {
        Ok(self.tables.get(&key).and_then(|t| {
            t.keys()
                .filter(|(res, _, _)| *res == resolution)
                .map(|(_, t_epoch, _)| *t_epoch)
                .max()
        }))
    }

    async fn query(&self, key: AggregateKey, query: &AggregateQuery) -> Result<Vec<AggregateRow>> {
        let Some(table) = self.tables.get(&key) else {
            return Ok(Vec::new());
        };
        Ok(table
            .iter()
            .map(to_row)
            .filter(|row| query.matches(key, row))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(user: &str, resolution: i64, t_epoch: i64, n_jobs: i64) -> AggregateRow {
        AggregateRow {
            dims: DimensionValues {
                user: Some(user.to_string()),
                ..Default::default()
            },
            resolution,
            t_epoch,
            metrics: Metrics {
                n_jobs,
                ..Metrics::zero()
            },
        }
    }

    fn record(id: &str, insert_time: i64, end_time: i64) -> UsageRecord {
        UsageRecord {
            record_id: id.to_string(),
            insert_time,
            end_time,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_records_ending_between_is_half_open() {
        let store = MemoryStore::new();
        store.extend_records([record("a", 0, 10), record("b", 0, 20), record("c", 0, 30)]);

        let found = store.records_ending_between(10, 30).await.unwrap();
        let ids: Vec<&str> = found.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_oldest_inserted_since_orders_by_end_time() {
        let store = MemoryStore::new();
        store.extend_records([
            record("old", 100, 5),
            record("late", 500, 400),
            record("early", 600, 50),
        ]);

        let found = store.oldest_inserted_since(200).await.unwrap().unwrap();
        assert_eq!(found.record_id, "early");
        assert!(store.oldest_inserted_since(601).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_identity() {
        let store = MemoryStore::new();
        let key = AggregateKey::Key0211;
        store.insert(key, &[row("a", 60, 59, 1)]).await.unwrap();

        let err = store.insert(key, &[row("a", 60, 59, 2)]).await;
        assert!(err.is_err());
        assert_eq!(store.row_count(key), 1);
    }

    #[tokio::test]
    async fn test_insert_projects_dimensions() {
        let store = MemoryStore::new();
        let mut r = row("a", 60, 59, 1);
        r.dims.machine = Some("m".to_string());
        store.insert(AggregateKey::Key0211, &[r]).await.unwrap();

        let rows = store.rows(AggregateKey::Key0211);
        assert_eq!(rows[0].dims.machine, None);
    }

    #[tokio::test]
    async fn test_delete_from_only_touches_resolution_and_range() {
        let store = MemoryStore::new();
        let key = AggregateKey::Key0211;
        store
            .insert(
                key,
                &[row("a", 60, 59, 1), row("a", 60, 119, 1), row("a", 120, 119, 1)],
            )
            .await
            .unwrap();

        let deleted = store.delete_from(key, 60, 100).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.row_count(key), 2);
        assert_eq!(store.latest_bucket_end(key, 60).await.unwrap(), Some(59));
        assert_eq!(store.latest_bucket_end(key, 120).await.unwrap(), Some(119));
        assert_eq!(store.latest_bucket_end(key, 180).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_replace_from_is_all_or_nothing() {
        let store = MemoryStore::new();
        let key = AggregateKey::Key0211;
        store.insert(key, &[row("a", 60, 59, 1)]).await.unwrap();

        let bad = vec![row("b", 60, 59, 1), row("b", 60, 59, 2)];
        assert!(store.replace_from(key, 60, 0, bad).await.is_err());
        assert_eq!(store.rows(key), vec![row("a", 60, 59, 1)]);

        let summary = store
            .replace_from(key, 60, 0, vec![row("b", 60, 59, 3)])
            .await
            .unwrap();
        assert_eq!(
            summary,
            ReplaceSummary {
                deleted: 1,
                inserted: 1
            }
        );
        assert_eq!(store.rows(key), vec![row("b", 60, 59, 3)]);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryStore::new();
        let key = AggregateKey::Key01;
        store.fail_writes_to(Some(key));
        assert!(store.insert(key, &[row("a", 60, 59, 1)]).await.is_err());
        assert!(store.insert(AggregateKey::Key02, &[]).await.is_ok());

        store.fail_writes_to(None);
        assert!(store.insert(key, &[row("a", 60, 59, 1)]).await.is_ok());
    }

    #[tokio::test]
    async fn test_query_agrees_with_clickhouse_filter() {
        let store = MemoryStore::new();
        let key = AggregateKey::Key0411;
        let mut r = row("ignored", 60, 59, 4);
        r.dims.machine = Some("ce01".to_string());
        store.insert(key, &[r]).await.unwrap();

        let dims = DimensionValues {
            user: Some("alice".to_string()),
            machine: Some("ce01".to_string()),
            ..Default::default()
        };
        let query = AggregateQuery::new(60, 0, 59).with_dims(dims);

        let rows = store.query(key, &query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].metrics.n_jobs, 4);

        let sql = crate::store::clickhouse::query_sql("usage", key, &query);
        assert!(sql.contains("machine_name = 'ce01'"));
        assert!(!sql.contains("global_user_name ="));
    }
}
