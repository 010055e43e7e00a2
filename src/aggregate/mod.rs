//! The three aggregation steps: raw records into `key_0`, dimension
//! reduction along lattice edges, and resolution roll-up by integer factors.
//!
//! Every step deletes the target range before writing it again, so any step
//! can be re-run over an overlapping window.

pub mod base;
pub mod reduce;
pub mod rollup;

use thiserror::Error;

use crate::lattice::AggregateKey;

pub use self::base::aggregate_base;
pub use self::reduce::aggregate_by_key;
pub use self::rollup::aggregate_by_resolution;

/// Invalid arguments to an aggregation step. Raised before the store is
/// touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("resolution must be > 0, got {0}")]
    InvalidResolution(i64),

    #[error("roll-up factor must be > 1, got {0}")]
    InvalidFactor(i64),

    #[error("resolution {resolution} * factor {factor} overflows")]
    ResolutionOverflow { resolution: i64, factor: i64 },

    #[error("{child} is not a direct reduction of {parent}")]
    NotALatticeEdge {
        parent: AggregateKey,
        child: AggregateKey,
    },
}

/// Row counts of one reduction or roll-up step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepSummary {
    pub rows_read: u64,
    pub rows_deleted: u64,
    pub rows_written: u64,
}

impl StepSummary {
    pub fn merge(&mut self, other: &StepSummary) {
        self.rows_read = self.rows_read.saturating_add(other.rows_read);
        self.rows_deleted = self.rows_deleted.saturating_add(other.rows_deleted);
        self.rows_written = self.rows_written.saturating_add(other.rows_written);
    }
}

/// Counts of one base aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BaseSummary {
    pub buckets: u64,
    pub records_read: u64,
    pub rows_deleted: u64,
    pub rows_written: u64,
}

pub fn validate_resolution(resolution: i64) -> Result<(), AggregationError> {
    if resolution <= 0 {
        return Err(AggregationError::InvalidResolution(resolution));
    }
    Ok(())
}

/// Resolution of a roll-up by `factor` over `resolution`.
pub fn target_resolution(resolution: i64, factor: i64) -> Result<i64, AggregationError> {
    validate_resolution(resolution)?;
    if factor <= 1 {
        return Err(AggregationError::InvalidFactor(factor));
    }
    resolution
        .checked_mul(factor)
        .ok_or(AggregationError::ResolutionOverflow { resolution, factor })
}

/// Largest multiple of `resolution` not greater than `t`.
pub fn align_down(t: i64, resolution: i64) -> i64 {
    t.div_euclid(resolution) * resolution
}

/// Inclusive last second of the bucket starting at `start`.
pub const fn bucket_end(start: i64, resolution: i64) -> i64 {
    start + resolution - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_resolution() {
        assert_eq!(target_resolution(3600, 24), Ok(86_400));
        assert_eq!(
            target_resolution(3600, 1),
            Err(AggregationError::InvalidFactor(1))
        );
        assert_eq!(
            target_resolution(0, 2),
            Err(AggregationError::InvalidResolution(0))
        );
        assert_eq!(
            target_resolution(i64::MAX / 2, 3),
            Err(AggregationError::ResolutionOverflow {
                resolution: i64::MAX / 2,
                factor: 3
            })
        );
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(1_700_000_000, 86_400), 1_699_920_000);
        assert_eq!(align_down(86_400, 86_400), 86_400);
        assert_eq!(align_down(-1, 60), -60);
    }

    #[test]
    fn test_day_bucket_end() {
        // 2023-11-14T22:13:20Z falls in the bucket ending 23:59:59.
        let e = 1_700_000_000;
        assert_eq!(
            bucket_end(align_down(e, 86_400), 86_400),
            (e / 86_400) * 86_400 + 86_399
        );
        assert_eq!((bucket_end(align_down(e, 86_400), 86_400) + 1) % 86_400, 0);
    }
}
