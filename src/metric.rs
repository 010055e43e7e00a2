use std::iter::Sum;
use std::ops::AddAssign;

use crate::record::UsageRecord;

/// The six summable quantities carried by every aggregate row.
///
/// All fields combine by addition only, so buckets and dimension groups can
/// be merged in any order. Additions saturate instead of wrapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Metrics {
    pub n_jobs: i64,
    pub cpu_duration: i64,
    pub wall_duration: i64,
    pub user_time: i64,
    pub kernel_time: i64,
    pub major_page_faults: i64,
}

impl Metrics {
    pub const fn zero() -> Self {
        Self {
            n_jobs: 0,
            cpu_duration: 0,
            wall_duration: 0,
            user_time: 0,
            kernel_time: 0,
            major_page_faults: 0,
        }
    }

    /// Adds another accumulator field by field.
    pub fn add(&mut self, other: &Metrics) {
        self.n_jobs = self.n_jobs.saturating_add(other.n_jobs);
        self.cpu_duration = self.cpu_duration.saturating_add(other.cpu_duration);
        self.wall_duration = self.wall_duration.saturating_add(other.wall_duration);
        self.user_time = self.user_time.saturating_add(other.user_time);
        self.kernel_time = self.kernel_time.saturating_add(other.kernel_time);
        self.major_page_faults = self
            .major_page_faults
            .saturating_add(other.major_page_faults);
    }

    /// Adds one raw record: one job, plus its measured quantities with
    /// missing values counted as zero.
    pub fn add_record(&mut self, record: &UsageRecord) {
        self.add(&Metrics {
            n_jobs: 1,
            cpu_duration: record.cpu_duration.unwrap_or(0),
            wall_duration: record.wall_duration.unwrap_or(0),
            user_time: record.user_time.unwrap_or(0),
            kernel_time: record.kernel_time.unwrap_or(0),
            major_page_faults: record.major_page_faults.unwrap_or(0),
        });
    }

    pub fn reset(&mut self) {
        *self = Self::zero();
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }
}

impl AddAssign for Metrics {
    fn add_assign(&mut self, rhs: Self) {
        self.add(&rhs);
    }
}

impl AddAssign<&Metrics> for Metrics {
    fn add_assign(&mut self, rhs: &Metrics) {
        self.add(rhs);
    }
}

impl Sum for Metrics {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), |mut acc, m| {
            acc += m;
            acc
        })
    }
}

impl<'a> Sum<&'a Metrics> for Metrics {
    fn sum<I: Iterator<Item = &'a Metrics>>(iter: I) -> Self {
        iter.fold(Self::zero(), |mut acc, m| {
            acc += m;
            acc
        })
    }
}
