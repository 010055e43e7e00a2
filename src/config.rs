use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::record::DEFAULT_FULL_NAME_VO_TYPES;

/// Top-level configuration for the usage aggregator.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Time between aggregation passes. Default: 10m.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Aggregation engine settings.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// ClickHouse connection configuration.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Aggregation engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Base bucket width. Default: 1d.
    #[serde(default = "default_resolution", with = "humantime_serde")]
    pub resolution: Duration,

    /// Roll-up factors applied to the base resolution, each > 1.
    #[serde(default)]
    pub factors: Vec<i64>,

    /// Days of history reprocessed on start-up. Default: 28.
    #[serde(default = "default_refresh_days_back")]
    pub refresh_days_back: i64,

    /// Safety margin subtracted from "now" when advancing the checkpoint.
    /// Default: 5m.
    #[serde(default = "default_checkpoint_margin", with = "humantime_serde")]
    pub checkpoint_margin: Duration,

    /// VO types whose VO string is already the full VO name.
    #[serde(default = "default_full_name_vo_types")]
    pub full_name_vo_types: Vec<String>,
}

impl AggregationConfig {
    /// Base resolution in whole seconds.
    pub fn resolution_secs(&self) -> Result<i64> {
        i64::try_from(self.resolution.as_secs()).context("aggregation.resolution is too large")
    }

    /// Checkpoint margin in whole seconds.
    pub fn checkpoint_margin_secs(&self) -> Result<i64> {
        i64::try_from(self.checkpoint_margin.as_secs())
            .context("aggregation.checkpoint_margin is too large")
    }
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Database holding raw records and aggregates. Default: "usage".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Upper bound for any single ClickHouse call. Default: 30s.
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Duration,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_resolution() -> Duration {
    Duration::from_secs(86_400)
}

fn default_refresh_days_back() -> i64 {
    28
}

fn default_checkpoint_margin() -> Duration {
    Duration::from_secs(300)
}

fn default_full_name_vo_types() -> Vec<String> {
    DEFAULT_FULL_NAME_VO_TYPES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_database() -> String {
    "usage".to_string()
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait implementations ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            interval: default_interval(),
            aggregation: AggregationConfig::default(),
            clickhouse: ClickHouseConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            factors: Vec::new(),
            refresh_days_back: default_refresh_days_back(),
            checkpoint_margin: default_checkpoint_margin(),
            full_name_vo_types: default_full_name_vo_types(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            query_timeout: default_query_timeout(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            bail!("interval must be positive");
        }

        self.aggregation.validate()?;

        if self.clickhouse.endpoint.is_empty() {
            bail!("clickhouse.endpoint is required");
        }

        if self.clickhouse.database.is_empty() {
            bail!("clickhouse.database is required");
        }

        if self.clickhouse.query_timeout.is_zero() {
            bail!("clickhouse.query_timeout must be positive");
        }

        Ok(())
    }
}

impl AggregationConfig {
    /// Checks the engine settings on their own, without connection details.
    pub fn validate(&self) -> Result<()> {
        let resolution = self.resolution_secs()?;
        if resolution <= 0 {
            bail!("aggregation.resolution must be at least 1s");
        }

        if self.resolution.subsec_nanos() != 0 {
            bail!("aggregation.resolution must be a whole number of seconds");
        }

        for &factor in &self.factors {
            if factor <= 1 {
                bail!("aggregation.factors must all be > 1, got {factor}");
            }
            if resolution.checked_mul(factor).is_none() {
                bail!("aggregation.factors: {factor} x {resolution}s overflows");
            }
        }

        if self.refresh_days_back < 0 {
            bail!("aggregation.refresh_days_back must not be negative");
        }

        self.checkpoint_margin_secs()?;

        Ok(())
    }
}
