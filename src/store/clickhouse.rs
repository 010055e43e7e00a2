use std::fmt::Write;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clickhouse_rs::types::{Block, Complex};
use clickhouse_rs::Pool;

use super::{AggregateQuery, AggregateStore, RecordSource, ReplaceSummary};
use crate::export::health::HealthMetrics;
use crate::lattice::AggregateKey;
use crate::metric::Metrics;
use crate::record::{AggregateRow, DimensionValues, UsageRecord};

/// Raw record table name.
pub const RECORDS_TABLE: &str = "usage_records";

const METRIC_COLUMNS: &str =
    "n_jobs, cpu_duration, wall_duration, user_time, kernel_time, major_page_faults";

const RECORD_COLUMNS: &str = "record_id, global_user_name, vo_type, vo_name, machine_name, status, \
     toInt64(toUnixTimestamp(insert_time)) AS insert_epoch, \
     toInt64(toUnixTimestamp(end_time)) AS end_epoch, \
     cpu_duration, wall_duration, user_time, kernel_time, major_page_faults";

/// Aggregate store and record source backed by ClickHouse.
///
/// One table per aggregate key, plus the raw `usage_records` table. Every
/// call is bounded by the configured query timeout.
pub struct ClickHouseStore {
    pool: Pool,
    database: String,
    query_timeout: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl ClickHouseStore {
    pub fn new(
        pool: Pool,
        database: String,
        query_timeout: Duration,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            pool,
            database,
            query_timeout,
            health,
        }
    }

    /// Runs `fut` under the query timeout and records its duration and
    /// failure in health metrics.
    async fn timed<T, F>(&self, operation: &str, table: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "{operation} on {table} timed out after {:?}",
                self.query_timeout
            )),
        };

        if let Some(health) = &self.health {
            health
                .clickhouse_duration
                .with_label_values(&[operation, table])
                .observe(start.elapsed().as_secs_f64());
            if result.is_err() {
                health
                    .clickhouse_errors
                    .with_label_values(&[operation, table])
                    .inc();
            }
        }

        result
    }

    async fn fetch(&self, sql: &str, what: &str) -> Result<Block<Complex>> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .with_context(|| format!("getting handle for {what}"))?;

        handle
            .query(sql)
            .fetch_all()
            .await
            .with_context(|| format!("querying {what}"))
    }

    async fn fetch_rows(&self, key: AggregateKey, sql: &str) -> Result<Vec<AggregateRow>> {
        let block = self.fetch(sql, key.table()).await?;
        rows_from_block(key, &block)
    }
}

impl RecordSource for ClickHouseStore {
    async fn records_ending_between(&self, start: i64, end: i64) -> Result<Vec<UsageRecord>> {
        let sql = records_between_sql(&self.database, start, end);
        self.timed("select", RECORDS_TABLE, async {
            let block = self.fetch(&sql, RECORDS_TABLE).await?;
            records_from_block(&block)
        })
        .await
    }

    async fn oldest_inserted_since(&self, since: i64) -> Result<Option<UsageRecord>> {
        let sql = oldest_since_sql(&self.database, since);
        self.timed("select", RECORDS_TABLE, async {
            let block = self.fetch(&sql, RECORDS_TABLE).await?;
            Ok(records_from_block(&block)?.into_iter().next())
        })
        .await
    }
}

impl AggregateStore for ClickHouseStore {
    async fn delete_from(&self, key: AggregateKey, resolution: i64, from: i64) -> Result<u64> {
        let table = key.table();
        self.timed("delete", table, async {
            let mut handle = self
                .pool
                .get_handle()
                .await
                .context("getting handle for delete")?;

            let count = count_in_range(&mut handle, &self.database, key, resolution, from).await?;
            if count > 0 {
                handle
                    .execute(delete_sql(&self.database, key, resolution, from).as_str())
                    .await
                    .with_context(|| format!("deleting from {table}"))?;
            }

            Ok(count)
        })
        .await
    }

    async fn insert(&self, key: AggregateKey, rows: &[AggregateRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let table = key.table();
        let sql = insert_sql(&self.database, key, rows);
        self.timed("insert", table, async {
            let mut handle = self
                .pool
                .get_handle()
                .await
                .context("getting handle for insert")?;

            handle
                .execute(sql.as_str())
                .await
                .with_context(|| format!("sending {table} batch"))?;

            Ok(rows.len() as u64)
        })
        .await
    }

    /// Not atomic: the delete and the insert are separate statements, so a
    /// reader can see the emptied range and a failure between them leaves it
    /// empty until the next pass. Callers must not run units for the same
    /// key concurrently.
    async fn replace_from(
        &self,
        key: AggregateKey,
        resolution: i64,
        from: i64,
        rows: Vec<AggregateRow>,
    ) -> Result<ReplaceSummary> {
        let table = key.table();
        self.timed("replace", table, async {
            // Delete and insert share one connection.
            let mut handle = self
                .pool
                .get_handle()
                .await
                .context("getting handle for replace")?;

            let deleted =
                count_in_range(&mut handle, &self.database, key, resolution, from).await?;
            if deleted > 0 {
                handle
                    .execute(delete_sql(&self.database, key, resolution, from).as_str())
                    .await
                    .with_context(|| format!("deleting from {table}"))?;
            }

            if !rows.is_empty() {
                handle
                    .execute(insert_sql(&self.database, key, &rows).as_str())
                    .await
                    .with_context(|| format!("sending {table} batch"))?;
            }

            Ok(ReplaceSummary {
                deleted,
                inserted: rows.len() as u64,
            })
        })
        .await
    }

    async fn load_from(
        &self,
        key: AggregateKey,
        resolution: i64,
        from: i64,
    ) -> Result<Vec<AggregateRow>> {
        let sql = load_sql(&self.database, key, resolution, from);
        self.timed("select", key.table(), self.fetch_rows(key, &sql))
            .await
    }

    async fn latest_bucket_end(&self, key: AggregateKey, resolution: i64) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT count() AS n, max(t_epoch) AS latest FROM {}.{} \
             WHERE resolution = {resolution}",
            self.database,
            key.table()
        );
        self.timed("select", key.table(), async {
            let block = self.fetch(&sql, key.table()).await?;
            let Some(row) = block.rows().next() else {
                return Ok(None);
            };
            let n: u64 = row.get("n").context("reading row count")?;
            if n == 0 {
                return Ok(None);
            }
            let latest: i64 = row.get("latest").context("reading latest t_epoch")?;
            Ok(Some(latest))
        })
        .await
    }

    async fn query(&self, key: AggregateKey, query: &AggregateQuery) -> Result<Vec<AggregateRow>> {
        let sql = query_sql(&self.database, key, query);
        self.timed("query", key.table(), self.fetch_rows(key, &sql))
            .await
    }
}

async fn count_in_range(
    handle: &mut clickhouse_rs::ClientHandle,
    database: &str,
    key: AggregateKey,
    resolution: i64,
    from: i64,
) -> Result<u64> {
    let sql = format!(
        "SELECT count() AS n FROM {database}.{} WHERE {}",
        key.table(),
        range_predicate(resolution, from)
    );
    let block = handle
        .query(sql.as_str())
        .fetch_all()
        .await
        .with_context(|| format!("counting rows in {}", key.table()))?;

    match block.rows().next() {
        Some(row) => row.get("n").context("reading row count"),
        None => Ok(0),
    }
}

fn range_predicate(resolution: i64, from: i64) -> String {
    format!("resolution = {resolution} AND t_epoch >= {from}")
}

fn key_columns(key: AggregateKey) -> String {
    let mut columns = String::with_capacity(96);
    for dim in key.dimensions() {
        columns.push_str(dim.column());
        columns.push_str(", ");
    }
    columns.push_str("resolution, t_epoch, ");
    columns.push_str(METRIC_COLUMNS);
    columns
}

/// Builds one multi-row INSERT for an aggregate table.
pub(crate) fn insert_sql(database: &str, key: AggregateKey, rows: &[AggregateRow]) -> String {
    let columns = key_columns(key);
    let mut sql = String::with_capacity(64 + columns.len() + rows.len() * 160);
    let _ = write!(sql, "INSERT INTO {database}.{} ({columns}) VALUES ", key.table());

    for (idx, row) in rows.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }

        sql.push('(');
        for dim in key.dimensions() {
            let value = row.dims.get(*dim).unwrap_or_default();
            let _ = write!(sql, "'{}', ", escape_sql(value));
        }
        let m = &row.metrics;
        let _ = write!(
            sql,
            "{}, {}, {}, {}, {}, {}, {}, {})",
            row.resolution,
            row.t_epoch,
            m.n_jobs,
            m.cpu_duration,
            m.wall_duration,
            m.user_time,
            m.kernel_time,
            m.major_page_faults,
        );
    }

    sql
}

pub(crate) fn delete_sql(database: &str, key: AggregateKey, resolution: i64, from: i64) -> String {
    format!(
        "DELETE FROM {database}.{} WHERE {}",
        key.table(),
        range_predicate(resolution, from)
    )
}

pub(crate) fn load_sql(database: &str, key: AggregateKey, resolution: i64, from: i64) -> String {
    format!(
        "SELECT {} FROM {database}.{} WHERE {}",
        key_columns(key),
        key.table(),
        range_predicate(resolution, from)
    )
}

pub(crate) fn query_sql(database: &str, key: AggregateKey, query: &AggregateQuery) -> String {
    let mut sql = format!(
        "SELECT {} FROM {database}.{} WHERE resolution = {} AND t_epoch >= {} AND t_epoch <= {}",
        key_columns(key),
        key.table(),
        query.resolution,
        query.t_from,
        query.t_to,
    );

    for dim in key.dimensions() {
        if let Some(value) = query.dims.get(*dim) {
            let _ = write!(sql, " AND {} = '{}'", dim.column(), escape_sql(value));
        }
    }

    sql.push_str(" ORDER BY t_epoch");
    sql
}

/// Raw reads use `FINAL` so a record inserted twice is returned once.
pub(crate) fn records_between_sql(database: &str, start: i64, end: i64) -> String {
    format!(
        "SELECT {RECORD_COLUMNS} FROM {database}.{RECORDS_TABLE} FINAL \
         WHERE end_time >= toDateTime({start}) AND end_time < toDateTime({end})"
    )
}

pub(crate) fn oldest_since_sql(database: &str, since: i64) -> String {
    format!(
        "SELECT {RECORD_COLUMNS} FROM {database}.{RECORDS_TABLE} FINAL \
         WHERE insert_time >= toDateTime({since}) ORDER BY end_time LIMIT 1"
    )
}

fn rows_from_block(key: AggregateKey, block: &Block<Complex>) -> Result<Vec<AggregateRow>> {
    let mut rows = Vec::with_capacity(block.row_count());

    for row in block.rows() {
        let mut dims = DimensionValues::default();
        for dim in key.dimensions() {
            let value: String = row
                .get(dim.column())
                .with_context(|| format!("reading {}", dim.column()))?;
            dims.set(*dim, Some(value));
        }

        rows.push(AggregateRow {
            dims,
            resolution: row.get("resolution").context("reading resolution")?,
            t_epoch: row.get("t_epoch").context("reading t_epoch")?,
            metrics: Metrics {
                n_jobs: row.get("n_jobs").context("reading n_jobs")?,
                cpu_duration: row.get("cpu_duration").context("reading cpu_duration")?,
                wall_duration: row.get("wall_duration").context("reading wall_duration")?,
                user_time: row.get("user_time").context("reading user_time")?,
                kernel_time: row.get("kernel_time").context("reading kernel_time")?,
                major_page_faults: row
                    .get("major_page_faults")
                    .context("reading major_page_faults")?,
            },
        });
    }

    Ok(rows)
}

fn records_from_block(block: &Block<Complex>) -> Result<Vec<UsageRecord>> {
    let mut records = Vec::with_capacity(block.row_count());

    for row in block.rows() {
        records.push(UsageRecord {
            record_id: row.get("record_id").context("reading record_id")?,
            global_user_name: row
                .get("global_user_name")
                .context("reading global_user_name")?,
            vo_type: row.get("vo_type").context("reading vo_type")?,
            vo_name: row.get("vo_name").context("reading vo_name")?,
            machine_name: row.get("machine_name").context("reading machine_name")?,
            status: row.get("status").context("reading status")?,
            insert_time: row.get("insert_epoch").context("reading insert_time")?,
            end_time: row.get("end_epoch").context("reading end_time")?,
            cpu_duration: row.get("cpu_duration").context("reading cpu_duration")?,
            wall_duration: row.get("wall_duration").context("reading wall_duration")?,
            user_time: row.get("user_time").context("reading user_time")?,
            kernel_time: row.get("kernel_time").context("reading kernel_time")?,
            major_page_faults: row
                .get("major_page_faults")
                .context("reading major_page_faults")?,
        });
    }

    Ok(records)
}

/// Escapes a string value for SQL insertion (single-quote escaping).
pub(crate) fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
