use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Seconds in one UTC day.
pub const SECONDS_PER_DAY: i64 = 86_400;

/// Source of the current wall-clock time in epoch seconds.
pub trait Clock: Send + Sync {
    fn now_epoch(&self) -> i64;
}

/// Wall clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Manually driven clock. Clones share the same instant.
#[derive(Clone)]
pub struct FixedClock {
    now: Arc<AtomicI64>,
}

impl std::fmt::Debug for FixedClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedClock")
            .field("now", &self.now.load(Ordering::Relaxed))
            .finish()
    }
}

impl FixedClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(now)),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::Relaxed);
    }

    /// Moves the clock forward by `secs` seconds.
    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::Relaxed);
    }
}

impl Clock for FixedClock {
    fn now_epoch(&self) -> i64 {
        self.now.load(Ordering::Relaxed)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_epoch(&self) -> i64 {
        (**self).now_epoch()
    }
}

/// Start of the UTC day containing `epoch`.
pub fn floor_day(epoch: i64) -> i64 {
    epoch.div_euclid(SECONDS_PER_DAY) * SECONDS_PER_DAY
}

/// Renders an epoch for log output, falling back to the raw number.
pub fn format_epoch(epoch: i64) -> String {
    match DateTime::<Utc>::from_timestamp(epoch, 0) {
        Some(dt) => dt.to_rfc3339(),
        None => epoch.to_string(),
    }
}
