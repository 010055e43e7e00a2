use std::fmt;

use anyhow::{bail, Context, Result};
use clickhouse_rs::{ClientHandle, Pool};
use tracing::info;

/// One embedded schema change.
struct Migration {
    version: u32,
    name: &'static str,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "init",
    up_sql: include_str!("sql/001_init.up.sql"),
    down_sql: include_str!("sql/001_init.down.sql"),
}];

/// Version of the newest embedded migration.
pub fn latest_version() -> u32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Applied schema version as recorded in `schema_migrations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: u32,
    pub dirty: bool,
}

impl MigrationStatus {
    pub fn pending(&self) -> usize {
        MIGRATIONS
            .iter()
            .filter(|m| m.version > self.version)
            .count()
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version {} of {}{}, {} pending",
            self.version,
            latest_version(),
            if self.dirty { " (dirty)" } else { "" },
            self.pending()
        )
    }
}

/// Applies and rolls back the embedded schema.
///
/// The `schema_migrations` table follows golang-migrate's layout so existing
/// tooling can read it.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<MigrationStatus>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<MigrationStatus>> + Send;

    /// Returns the current migration state.
    fn status(&self) -> impl std::future::Future<Output = Result<MigrationStatus>> + Send;
}

/// ClickHouse migration runner.
pub struct ClickHouseMigrator {
    pool: Pool,
}

impl ClickHouseMigrator {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn handle(&self) -> Result<ClientHandle> {
        self.pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for migrations")
    }

    async fn ensure_migrations_table(&self, handle: &mut ClientHandle) -> Result<()> {
        handle
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version Int64,
                    dirty UInt8,
                    sequence UInt64
                ) ENGINE = TinyLog",
            )
            .await
            .context("creating schema_migrations table")
    }

    async fn current(&self, handle: &mut ClientHandle) -> Result<MigrationStatus> {
        let block = handle
            .query("SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1")
            .fetch_all()
            .await
            .context("querying migration version")?;

        let Some(row) = block.rows().next() else {
            return Ok(MigrationStatus {
                version: 0,
                dirty: false,
            });
        };

        let version: i64 = row.get("version").context("reading version")?;
        let dirty: u8 = row.get("dirty").context("reading dirty flag")?;

        Ok(MigrationStatus {
            version: u32::try_from(version)
                .with_context(|| format!("schema version {version} out of range"))?,
            dirty: dirty != 0,
        })
    }

    /// Replaces the recorded version; version 0 clears the table.
    async fn record(&self, handle: &mut ClientHandle, version: u32, dirty: bool) -> Result<()> {
        handle
            .execute("TRUNCATE TABLE schema_migrations")
            .await
            .context("truncating schema_migrations")?;

        if version == 0 {
            return Ok(());
        }

        let sql = format!(
            "INSERT INTO schema_migrations (version, dirty, sequence) VALUES ({version}, {}, 1)",
            u8::from(dirty)
        );
        handle
            .execute(sql.as_str())
            .await
            .context("recording migration version")
    }

    async fn run_script(&self, handle: &mut ClientHandle, sql: &str) -> Result<()> {
        for statement in split_statements(sql) {
            handle.execute(statement).await.with_context(|| {
                let preview: String = statement.chars().take(80).collect();
                format!("executing migration statement: {preview}...")
            })?;
        }
        Ok(())
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<MigrationStatus> {
        let mut handle = self.handle().await?;
        self.ensure_migrations_table(&mut handle).await?;

        let status = self.current(&mut handle).await?;
        if status.dirty {
            bail!(
                "migration version {} is dirty, manual intervention required",
                status.version
            );
        }

        let mut applied = 0u32;
        for migration in MIGRATIONS.iter().filter(|m| m.version > status.version) {
            info!(
                version = migration.version,
                name = migration.name,
                "applying migration"
            );

            self.record(&mut handle, migration.version, true).await?;
            self.run_script(&mut handle, migration.up_sql)
                .await
                .with_context(|| format!("applying migration {}", migration.version))?;
            self.record(&mut handle, migration.version, false).await?;

            applied += 1;
        }

        let status = self.current(&mut handle).await?;
        if applied == 0 {
            info!(version = status.version, "schema up to date");
        } else {
            info!(version = status.version, applied, "migrations completed");
        }

        Ok(status)
    }

    async fn down(&self) -> Result<MigrationStatus> {
        let mut handle = self.handle().await?;
        self.ensure_migrations_table(&mut handle).await?;

        let status = self.current(&mut handle).await?;
        if status.version == 0 {
            info!("no migrations to roll back");
            return Ok(status);
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == status.version)
            .with_context(|| format!("migration version {} not found", status.version))?;

        info!(
            version = migration.version,
            name = migration.name,
            "rolling back migration"
        );

        self.record(&mut handle, migration.version, true).await?;
        self.run_script(&mut handle, migration.down_sql)
            .await
            .with_context(|| format!("rolling back migration {}", migration.version))?;

        let previous = MIGRATIONS
            .iter()
            .map(|m| m.version)
            .filter(|v| *v < migration.version)
            .max()
            .unwrap_or(0);
        self.record(&mut handle, previous, false).await?;

        info!(version = previous, "rollback completed");

        self.current(&mut handle).await
    }

    async fn status(&self) -> Result<MigrationStatus> {
        let mut handle = self.handle().await?;
        self.ensure_migrations_table(&mut handle).await?;
        self.current(&mut handle).await
    }
}

/// Splits SQL text into statements on `;`, dropping blank segments.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
