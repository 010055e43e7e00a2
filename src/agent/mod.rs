use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::driver::{Driver, PassOutcome};
use crate::export::health::HealthMetrics;
use crate::export::ClickHouseWriter;
use crate::migrate::Migrator;
use crate::store::{AggregateStore, ClickHouseStore, RecordSource};

/// Runs the aggregation driver on a fixed interval against ClickHouse.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    ch_writer: Option<ClickHouseWriter>,
    worker: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            ch_writer: None,
            worker: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Connects, migrates, initializes the checkpoint and starts the pass
    /// loop.
    pub async fn start(&mut self) -> Result<()> {
        // Health server first so probes respond during migrations.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let driver = self.connect().await?;

        let mut driver = driver.with_health(Arc::clone(&self.health));
        driver
            .initialize()
            .await
            .context("initializing checkpoint")?;

        info!(
            interval = ?self.cfg.interval,
            resolution = driver.resolution(),
            factors = ?driver.factors(),
            "aggregation loop started",
        );

        self.worker = Some(tokio::spawn(run_loop(
            driver,
            self.cfg.interval,
            self.cancel.clone(),
        )));

        Ok(())
    }

    /// Opens the pool, applies migrations when enabled and builds the
    /// driver. Used by both the daemon and one-shot commands.
    pub async fn connect(&mut self) -> Result<Driver<ClickHouseStore, SystemClock>> {
        let mut writer = ClickHouseWriter::new(self.cfg.clickhouse.clone())
            .with_health(Arc::clone(&self.health));
        writer.start().await.context("starting ClickHouse writer")?;

        if self.cfg.clickhouse.migrations.enabled {
            info!("running ClickHouse migrations...");
            let status = writer
                .migrator()?
                .up()
                .await
                .context("applying ClickHouse migrations")?;
            info!(%status, "ClickHouse migrations applied");
        }

        let store = Arc::new(writer.store()?);
        self.ch_writer = Some(writer);

        Driver::new(store, SystemClock, &self.cfg.aggregation)
    }

    /// Stops the loop after any in-flight pass, then closes connections.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!(error = %e, "aggregation loop panicked");
            }
        }

        if let Some(writer) = &mut self.ch_writer {
            if let Err(e) = writer.stop().await {
                error!(error = %e, "error stopping ClickHouse writer");
            }
        }

        self.health.stop().await?;

        Ok(())
    }
}

/// Runs one pass per tick until `cancel` fires. A pass in progress always
/// finishes; ticks missed while it runs are delayed, not bunched.
pub async fn run_loop<S, C>(mut driver: Driver<S, C>, interval: Duration, cancel: CancellationToken)
where
    S: RecordSource + AggregateStore,
    C: Clock,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("aggregation loop stopped");
                return;
            }
            _ = ticker.tick() => {
                match driver.run_pass().await {
                    Ok(PassOutcome::Idle) => {}
                    Ok(PassOutcome::Completed(report)) => {
                        debug!(
                            window_start = report.window_start,
                            base_rows = report.base.rows_written,
                            "pass finished",
                        );
                    }
                    Err(e) => {
                        error!(
                            error = %format!("{e:#}"),
                            checkpoint = driver.checkpoint(),
                            "aggregation pass failed, retrying next tick",
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::AggregationConfig;
    use crate::lattice::AggregateKey;
    use crate::record::UsageRecord;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_run_loop_processes_and_stops() {
        let store = Arc::new(MemoryStore::new());
        store.push_record(UsageRecord {
            record_id: "r1".to_string(),
            global_user_name: "alice".to_string(),
            machine_name: "ce01".to_string(),
            insert_time: 7_200,
            end_time: 3_700,
            ..Default::default()
        });

        let cfg = AggregationConfig {
            resolution: Duration::from_secs(3600),
            ..Default::default()
        };
        let driver = Driver::new(Arc::clone(&store), FixedClock::new(10_800), &cfg).unwrap();

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_loop(
            driver,
            Duration::from_millis(10),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        worker.await.unwrap();

        let rows = store.rows(AggregateKey::Key0411);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].t_epoch, 7_199);
    }
}
