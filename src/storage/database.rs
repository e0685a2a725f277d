use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::platform::AppPaths;

/// Schema migrations, applied in order and tracked in `app_settings`.
const MIGRATIONS: &[(i32, &str, &str)] = &[(
    1,
    "001_initial",
    include_str!("../../migrations/001_initial.sql"),
)];

const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection manager with migration support
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the control-state database under the data directory
    pub async fn new(paths: &AppPaths) -> Result<Self> {
        Self::open(paths.database_file(), DEFAULT_ACQUIRE_TIMEOUT).await
    }

    /// Open a database file, waiting at most `acquire_timeout` for a
    /// connection or a lock before failing
    pub async fn open<P: AsRef<Path>>(db_path: P, acquire_timeout: Duration) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Initializing database at: {:?}", db_path);

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(acquire_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        info!("Database initialized successfully");
        Ok(db)
    }

    /// Get a reference to the database connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_database_version().await?;
        debug!("Current database version: {}", current_version);

        for (version, name, sql) in MIGRATIONS {
            if *version <= current_version {
                debug!("Skipping migration {} (already applied)", name);
                continue;
            }

            info!("Applying migration: {}", name);
            sqlx::query(sql).execute(&self.pool).await.map_err(|e| {
                error!("Failed to apply migration {}: {}", name, e);
                Error::Database(e)
            })?;

            self.update_database_version(*version).await?;
        }

        Ok(())
    }

    async fn get_database_version(&self) -> Result<i32> {
        let table_exists = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type='table' AND name='app_settings'",
        )
        .fetch_optional(&self.pool)
        .await?
        .is_some();

        if !table_exists {
            return Ok(0);
        }

        let version: Option<String> =
            sqlx::query_scalar("SELECT value FROM app_settings WHERE key = 'database_version'")
                .fetch_optional(&self.pool)
                .await?;

        match version {
            Some(version_str) => version_str.parse().map_err(|e| {
                Error::Database(sqlx::Error::Decode(
                    format!("Invalid database version: {}", e).into(),
                ))
            }),
            None => Ok(0),
        }
    }

    async fn update_database_version(&self, version: i32) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO app_settings (key, value, updated_at) VALUES ('database_version', ?, unixepoch())",
        )
        .bind(version.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Close the database connection
    pub async fn close(self) {
        self.pool.close().await;
        info!("Database connection closed");
    }

    pub async fn get_statistics(&self) -> Result<DatabaseStatistics> {
        let alert_records_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM budget_alerts")
            .fetch_one(&self.pool)
            .await?;

        let stats_samples_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM storage_stats")
            .fetch_one(&self.pool)
            .await?;

        let stored_objects_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stored_objects")
            .fetch_one(&self.pool)
            .await?;

        let database_size_bytes: Option<i64> = sqlx::query_scalar(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(DatabaseStatistics {
            alert_records_count: alert_records_count as u64,
            stats_samples_count: stats_samples_count as u64,
            stored_objects_count: stored_objects_count as u64,
            database_size_bytes: database_size_bytes.unwrap_or(0) as u64,
        })
    }
}

/// Row counts for the control-state tables
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStatistics {
    pub alert_records_count: u64,
    pub stats_samples_count: u64,
    pub stored_objects_count: u64,
    pub database_size_bytes: u64,
}

/// Helper functions for working with decimal values in the database
pub mod decimal_helpers {
    use rust_decimal::Decimal;

    use crate::error::{Error, Result};

    /// Canonical text form; trailing zeros are dropped so that equal
    /// amounts always compare equal in SQL.
    pub fn decimal_to_string(decimal: Decimal) -> String {
        decimal.normalize().to_string()
    }

    pub fn string_to_decimal(s: &str) -> Result<Decimal> {
        s.parse().map_err(|e| {
            Error::Database(sqlx::Error::Decode(
                format!("Failed to parse decimal from string '{}': {}", s, e).into(),
            ))
        })
    }
}

/// Timestamps are stored as Unix microseconds
pub mod timestamp_helpers {
    use chrono::{DateTime, Utc};

    use crate::error::{Error, Result};

    pub fn to_micros(timestamp: DateTime<Utc>) -> i64 {
        timestamp.timestamp_micros()
    }

    pub fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(|| {
            Error::Database(sqlx::Error::Decode(
                format!("Timestamp out of range: {}", micros).into(),
            ))
        })
    }
}
