//! Consistency checks between raw records and stored aggregates.

use std::fmt;

use anyhow::{Context, Result};

use crate::aggregate::{align_down, target_resolution, validate_resolution};
use crate::lattice::{AggregateKey, REDUCTION_ORDER};
use crate::metric::Metrics;
use crate::store::{AggregateStore, RecordSource};

/// One compared pair of totals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: String,
    pub expected: Metrics,
    pub actual: Metrics,
}

impl Check {
    pub fn passed(&self) -> bool {
        self.expected == self.actual
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed() { "ok" } else { "MISMATCH" };
        write!(
            f,
            "{verdict:>8}  {}: expected {} jobs / {} wall, got {} jobs / {} wall",
            self.name,
            self.expected.n_jobs,
            self.expected.wall_duration,
            self.actual.n_jobs,
            self.actual.wall_duration,
        )
    }
}

/// All checks of one verification run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub checks: Vec<Check>,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(Check::passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.passed())
    }
}

/// Compares totals over the buckets covering `[from, to)`:
/// raw records against `key_0` (job count and wall time), every parent
/// against its reduced child, and every key against its roll-ups.
pub async fn verify_window<S>(
    store: &S,
    from: i64,
    to: i64,
    resolution: i64,
    factors: &[i64],
) -> Result<VerifyReport>
where
    S: RecordSource + AggregateStore,
{
    validate_resolution(resolution)?;
    let lo = align_down(from, resolution);
    let hi = align_down(to.saturating_sub(1), resolution) + resolution;

    let mut report = VerifyReport::default();

    let mut raw = Metrics::zero();
    for record in store
        .records_ending_between(lo, hi)
        .await
        .context("reading raw records")?
    {
        raw.add_record(&record);
    }
    let base = sum_range(store, AggregateKey::ROOT, resolution, lo, hi).await?;
    report.checks.push(Check {
        name: format!("raw -> {} @{resolution}s", AggregateKey::ROOT),
        expected: jobs_and_wall(&raw),
        actual: jobs_and_wall(&base),
    });

    for edge in REDUCTION_ORDER {
        report.checks.push(Check {
            name: format!("{edge} @{resolution}s"),
            expected: sum_range(store, edge.parent, resolution, lo, hi).await?,
            actual: sum_range(store, edge.child, resolution, lo, hi).await?,
        });
    }

    for &factor in factors {
        let target = target_resolution(resolution, factor)?;
        let coarse_lo = align_down(lo, target);
        let coarse_hi = align_down(hi - 1, target) + target;

        for key in AggregateKey::ALL {
            report.checks.push(Check {
                name: format!("{key} @{resolution}s -> @{target}s"),
                expected: sum_range(store, key, resolution, coarse_lo, coarse_hi).await?,
                actual: sum_range(store, key, target, coarse_lo, coarse_hi).await?,
            });
        }
    }

    Ok(report)
}

/// Sums the rows of `key` at `resolution` with `lo <= t_epoch < hi`.
async fn sum_range<S: AggregateStore>(
    store: &S,
    key: AggregateKey,
    resolution: i64,
    lo: i64,
    hi: i64,
) -> Result<Metrics> {
    let rows = store
        .load_from(key, resolution, lo)
        .await
        .with_context(|| format!("loading {} at {resolution}s", key.table()))?;

    Ok(rows
        .iter()
        .filter(|row| row.t_epoch < hi)
        .map(|row| row.metrics)
        .sum())
}

fn jobs_and_wall(m: &Metrics) -> Metrics {
    Metrics {
        n_jobs: m.n_jobs,
        wall_duration: m.wall_duration,
        ..Metrics::zero()
    }
}
