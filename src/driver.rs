use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::aggregate::{
    aggregate_base, aggregate_by_key, aggregate_by_resolution, align_down, target_resolution,
    BaseSummary, StepSummary,
};
use crate::clock::{floor_day, format_epoch, Clock, SECONDS_PER_DAY};
use crate::config::AggregationConfig;
use crate::export::health::HealthMetrics;
use crate::lattice::{validate_reduction_order, AggregateKey, REDUCTION_ORDER};
use crate::record::VoNameRules;
use crate::store::{AggregateStore, RecordSource};

/// Result of one driver pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// No record was inserted since the checkpoint.
    Idle,
    Completed(PassReport),
}

/// What one window run touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub window_start: i64,
    pub base: BaseSummary,
    pub reduced: StepSummary,
    /// Roll-up totals per factor, ascending.
    pub rolled: Vec<(i64, StepSummary)>,
}

/// Runs aggregation passes against one store and tracks the checkpoint.
///
/// A pass looks up the oldest record inserted since the checkpoint, moves
/// the checkpoint to `now - margin`, then rebuilds `key_0`, all reductions
/// and all roll-ups from that record's bucket onward. A failed window is
/// remembered and the next pass starts no later than it, even when nothing
/// new was inserted.
pub struct Driver<S, C> {
    store: Arc<S>,
    clock: C,
    resolution: i64,
    factors: Vec<i64>,
    refresh_days_back: i64,
    checkpoint_margin: i64,
    rules: VoNameRules,
    checkpoint: i64,
    /// Start of the last failed window, rebuilt by the next pass.
    retry_from: Option<i64>,
    health: Option<Arc<HealthMetrics>>,
}

impl<S, C> Driver<S, C>
where
    S: RecordSource + AggregateStore,
    C: Clock,
{
    /// Validates the settings and the reduction schedule.
    ///
    /// Factors are sorted ascending with duplicates removed. The checkpoint
    /// starts at zero until [`Driver::initialize`] runs.
    pub fn new(store: Arc<S>, clock: C, cfg: &AggregationConfig) -> Result<Self> {
        cfg.validate()?;
        validate_reduction_order(&REDUCTION_ORDER).context("invalid reduction schedule")?;

        let resolution = cfg.resolution_secs()?;
        let mut factors = cfg.factors.clone();
        factors.sort_unstable();
        factors.dedup();
        for &factor in &factors {
            target_resolution(resolution, factor)?;
        }

        Ok(Self {
            store,
            clock,
            resolution,
            factors,
            refresh_days_back: cfg.refresh_days_back,
            checkpoint_margin: cfg.checkpoint_margin_secs()?,
            rules: VoNameRules::new(cfg.full_name_vo_types.iter().cloned()),
            checkpoint: 0,
            retry_from: None,
            health: None,
        })
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn checkpoint(&self) -> i64 {
        self.checkpoint
    }

    pub fn set_checkpoint(&mut self, checkpoint: i64) {
        self.checkpoint = checkpoint;
        self.publish_checkpoint();
    }

    /// Window start a failed pass left behind, if any.
    pub fn retry_from(&self) -> Option<i64> {
        self.retry_from
    }

    pub fn resolution(&self) -> i64 {
        self.resolution
    }

    pub fn factors(&self) -> &[i64] {
        &self.factors
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Derives the start-up checkpoint from the store contents.
    ///
    /// Starts `refresh_days_back` days before today's UTC midnight, or at the
    /// start of the newest `key_0` bucket when that is older.
    pub async fn initialize(&mut self) -> Result<i64> {
        let now = self.clock.now_epoch();
        let refresh_floor = floor_day(now) - self.refresh_days_back * SECONDS_PER_DAY;

        let latest_end = self
            .store
            .latest_bucket_end(AggregateKey::ROOT, self.resolution)
            .await
            .context("reading latest base bucket")?;

        let checkpoint = match latest_end {
            Some(end) => refresh_floor.min(end - self.resolution + 1),
            None => refresh_floor,
        };

        info!(
            checkpoint = %format_epoch(checkpoint),
            refresh_days_back = self.refresh_days_back,
            latest_bucket_end = ?latest_end,
            "initialized checkpoint",
        );

        self.set_checkpoint(checkpoint);
        Ok(checkpoint)
    }

    /// Runs one pass. Errors abort the remaining steps and leave the
    /// checkpoint advanced; the failed window is retried next time.
    pub async fn run_pass(&mut self) -> Result<PassOutcome> {
        let started = Instant::now();
        let result = self.pass().await;

        if let Some(health) = &self.health {
            health.pass_duration.observe(started.elapsed().as_secs_f64());
            match &result {
                Ok(PassOutcome::Idle) => health.idle_passes.inc(),
                Ok(PassOutcome::Completed(_)) => {
                    health.passes.inc();
                    health.last_success.set(self.clock.now_epoch() as f64);
                }
                Err(_) => health.pass_failures.inc(),
            }
        }

        result
    }

    async fn pass(&mut self) -> Result<PassOutcome> {
        let now = self.clock.now_epoch();
        let oldest = self
            .store
            .oldest_inserted_since(self.checkpoint)
            .await
            .context("looking up oldest new record")?;

        let previous = self.checkpoint;
        self.set_checkpoint(now - self.checkpoint_margin);

        let oldest_start = oldest.map(|record| align_down(record.end_time, self.resolution));
        let Some(window_start) = oldest_start.into_iter().chain(self.retry_from).min() else {
            debug!(since = %format_epoch(previous), "no new records");
            return Ok(PassOutcome::Idle);
        };

        info!(
            since = %format_epoch(previous),
            checkpoint = %format_epoch(self.checkpoint),
            window_start = %format_epoch(window_start),
            retry = self.retry_from.is_some(),
            "starting aggregation pass",
        );

        match self.run_window(window_start).await {
            Ok(report) => {
                self.retry_from = None;
                Ok(PassOutcome::Completed(report))
            }
            Err(e) => {
                self.retry_from = Some(window_start);
                Err(e)
            }
        }
    }

    /// Rebuilds everything from `window_start` up to now without touching
    /// the checkpoint. `window_start` must be a multiple of the resolution.
    pub async fn run_window(&self, window_start: i64) -> Result<PassReport> {
        let now = self.clock.now_epoch();
        let store = self.store.as_ref();
        let resolution = self.resolution;

        if let Some(health) = &self.health {
            health.window_start.set(window_start as f64);
        }

        let step = Instant::now();
        let base = aggregate_base(store, window_start, resolution, now, &self.rules)
            .await
            .context("base aggregation")?;
        self.observe_step("base", step);
        self.record_rows(
            AggregateKey::ROOT,
            resolution,
            base.rows_deleted,
            base.rows_written,
        );
        if let Some(health) = &self.health {
            health.records_read.inc_by(base.records_read as f64);
        }

        let step = Instant::now();
        let mut reduced = StepSummary::default();
        for edge in REDUCTION_ORDER {
            let summary =
                aggregate_by_key(store, edge.parent, edge.child, window_start, resolution)
                    .await
                    .with_context(|| format!("reducing {edge}"))?;
            self.record_rows(
                edge.child,
                resolution,
                summary.rows_deleted,
                summary.rows_written,
            );
            reduced.merge(&summary);
        }
        self.observe_step("reduce", step);

        let step = Instant::now();
        let mut rolled = Vec::with_capacity(self.factors.len());
        for &factor in &self.factors {
            let target = target_resolution(resolution, factor)?;
            let aligned = align_down(window_start, target);

            let mut total = StepSummary::default();
            for key in AggregateKey::ALL {
                let summary = aggregate_by_resolution(store, key, aligned, resolution, factor)
                    .await
                    .with_context(|| format!("rolling up {key} by {factor}"))?;
                self.record_rows(key, target, summary.rows_deleted, summary.rows_written);
                total.merge(&summary);
            }

            debug!(
                factor,
                target,
                window_start = aligned,
                rows = total.rows_written,
                "rolled up factor",
            );
            rolled.push((factor, total));
        }
        self.observe_step("rollup", step);

        info!(
            window_start = %format_epoch(window_start),
            buckets = base.buckets,
            records = base.records_read,
            base_rows = base.rows_written,
            reduced_rows = reduced.rows_written,
            rolled_rows = rolled.iter().map(|(_, s)| s.rows_written).sum::<u64>(),
            "aggregation pass completed",
        );

        Ok(PassReport {
            window_start,
            base,
            reduced,
            rolled,
        })
    }

    fn publish_checkpoint(&self) {
        if let Some(health) = &self.health {
            health.checkpoint.set(self.checkpoint as f64);
        }
    }

    fn observe_step(&self, step: &str, started: Instant) {
        if let Some(health) = &self.health {
            health
                .step_duration
                .with_label_values(&[step])
                .observe(started.elapsed().as_secs_f64());
        }
    }

    fn record_rows(&self, key: AggregateKey, resolution: i64, deleted: u64, written: u64) {
        if let Some(health) = &self.health {
            health.record_rows(key.name(), resolution, deleted, written);
        }
    }
}
