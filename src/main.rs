use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use usage_aggregator::agent::Agent;
use usage_aggregator::aggregate::align_down;
use usage_aggregator::config::Config;
use usage_aggregator::driver::PassOutcome;
use usage_aggregator::export::ClickHouseWriter;
use usage_aggregator::migrate::Migrator;
use usage_aggregator::verify::verify_window;

/// Aggregates computing-job usage records into a dimensional lattice.
#[derive(Parser)]
#[command(name = "usage-aggregator", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run aggregation passes on the configured interval (default).
    Run,
    /// Run a single aggregation pass and exit.
    Once,
    /// Rebuild every aggregate from an epoch onward, leaving the checkpoint alone.
    Reaggregate {
        /// Window start in epoch seconds; aligned down to the resolution.
        #[arg(long)]
        from: i64,
    },
    /// Manage the ClickHouse schema.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Compare raw records and aggregates over `[from, to)`.
    Verify {
        #[arg(long)]
        from: i64,
        #[arg(long)]
        to: i64,
    },
    /// Print version information and exit.
    Version,
}

#[derive(Subcommand, Clone, Copy)]
enum MigrateAction {
    /// Apply pending migrations.
    Up,
    /// Roll back the latest migration.
    Down,
    /// Show the applied schema version.
    Status,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    pub fn full() -> String {
        format!(
            "{} ({}/{})",
            RELEASE,
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);

    // Handle version subcommand before anything else.
    if let Command::Version = command {
        println!("usage-aggregator {}", version::full());
        return Ok(ExitCode::SUCCESS);
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = load_config(&config_path)?;

    tracing::info!(version = version::RELEASE, "starting usage-aggregator");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        match command {
            Command::Run => run(cfg).await.map(|()| ExitCode::SUCCESS),
            Command::Once => once(cfg).await.map(|()| ExitCode::SUCCESS),
            Command::Reaggregate { from } => {
                reaggregate(cfg, from).await.map(|()| ExitCode::SUCCESS)
            }
            Command::Migrate { action } => migrate(cfg, action).await.map(|()| ExitCode::SUCCESS),
            Command::Verify { from, to } => verify(cfg, from, to).await,
            Command::Version => Ok(ExitCode::SUCCESS),
        }
    })
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("loading config from {}", path.display()))
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    let _ = shutdown_rx.await;

    agent.stop().await?;

    tracing::info!("usage-aggregator stopped");

    Ok(())
}

async fn once(cfg: Config) -> Result<()> {
    let mut agent = Agent::new(cfg)?;
    let mut driver = agent.connect().await?;
    driver.initialize().await?;

    let outcome = driver.run_pass().await;
    agent.stop().await?;

    match outcome? {
        PassOutcome::Idle => println!("no new records"),
        PassOutcome::Completed(report) => println!(
            "aggregated from {}: {} records, {} base rows, {} reduced rows",
            report.window_start,
            report.base.records_read,
            report.base.rows_written,
            report.reduced.rows_written,
        ),
    }

    Ok(())
}

async fn reaggregate(cfg: Config, from: i64) -> Result<()> {
    let mut agent = Agent::new(cfg)?;
    let driver = agent.connect().await?;

    let window_start = align_down(from, driver.resolution());
    if window_start != from {
        tracing::warn!(from, window_start, "aligned start down to resolution");
    }

    let result = driver.run_window(window_start).await;
    agent.stop().await?;

    let report = result?;
    println!(
        "rebuilt from {}: {} buckets, {} records",
        report.window_start, report.base.buckets, report.base.records_read,
    );

    Ok(())
}

async fn migrate(cfg: Config, action: MigrateAction) -> Result<()> {
    let mut writer = ClickHouseWriter::new(cfg.clickhouse);
    writer.start().await?;
    let migrator = writer.migrator()?;

    let status = match action {
        MigrateAction::Up => migrator.up().await?,
        MigrateAction::Down => migrator.down().await?,
        MigrateAction::Status => migrator.status().await?,
    };
    writer.stop().await?;

    println!("schema {status}");

    Ok(())
}

async fn verify(cfg: Config, from: i64, to: i64) -> Result<ExitCode> {
    if to <= from {
        bail!("--to must be greater than --from");
    }

    let mut agent = Agent::new(cfg)?;
    let driver = agent.connect().await?;

    let result = verify_window(
        driver.store().as_ref(),
        from,
        to,
        driver.resolution(),
        driver.factors(),
    )
    .await;
    agent.stop().await?;

    let report = result?;
    for check in &report.checks {
        println!("{check}");
    }

    if report.passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("{} check(s) failed", report.failures().count());
        Ok(ExitCode::FAILURE)
    }
}
