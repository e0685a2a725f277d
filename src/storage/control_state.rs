use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::{debug, info};
use uuid::Uuid;

use crate::budget::classifier::{AlertLevel, UsageSample};
use crate::budget::policy::StorageControlPolicy;
use crate::error::{Error, Result};
use crate::storage::database::{decimal_helpers, timestamp_helpers};

/// Key of the single policy row
const POLICY_ID: &str = "storage_control";

/// Durable state shared between the budget handler, the usage estimator
/// and the client application.
#[async_trait]
pub trait ControlStateStore: Send + Sync {
    /// Replace the policy if `event_time` is strictly newer than the one
    /// already committed.
    async fn put_policy(
        &self,
        policy: &StorageControlPolicy,
        event_time: DateTime<Utc>,
    ) -> Result<PolicyWrite>;

    async fn current_policy(&self) -> Result<Option<CommittedPolicy>>;

    /// Append unless a record with the same idempotency key exists.
    async fn append_audit_record(&self, record: &BudgetAlertRecord) -> Result<AuditAppend>;

    /// Most recently received first.
    async fn recent_audit_records(&self, limit: u32) -> Result<Vec<BudgetAlertRecord>>;

    async fn append_stats_sample(&self, sample: &StorageStatsSample) -> Result<()>;

    /// Newest first.
    async fn recent_stats_samples(&self, limit: u32) -> Result<Vec<StorageStatsSample>>;

    async fn count_objects_with_image(&self) -> Result<u64>;
}

/// Timeout and retry settings for control-state writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Upper bound for any single store call
    pub timeout_ms: u64,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Retries after the first attempt of a policy write
    pub max_retries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            retry_initial_delay_ms: 100,
            retry_max_delay_ms: 2000,
            max_retries: 4,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Jittered exponential backoff: initial, 2x initial, 4x initial, ...
    /// capped at `retry_max_delay_ms`, `max_retries` delays in total.
    pub fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor((self.retry_initial_delay_ms / 2).max(1))
            .max_delay(Duration::from_millis(self.retry_max_delay_ms))
            .map(jitter)
            .take(self.max_retries)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::validation("Store timeout must be greater than 0"));
        }
        if self.retry_max_delay_ms < self.retry_initial_delay_ms {
            return Err(Error::validation(
                "Retry max delay must not be smaller than the initial delay",
            ));
        }
        Ok(())
    }
}

/// Run a store operation, failing with a retryable
/// [`Error::StoreUnavailable`] instead of waiting past `timeout`.
pub async fn with_timeout<T, F>(timeout: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::store_unavailable(format!(
            "{} timed out after {:?}",
            operation, timeout
        ))),
    }
}

/// Outcome of a conditional policy write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyWrite {
    Applied { version: i64 },
    /// A policy from an equal or newer event is already committed
    Superseded,
}

impl PolicyWrite {
    pub fn is_applied(&self) -> bool {
        matches!(self, PolicyWrite::Applied { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAppend {
    Recorded,
    AlreadyExists,
}

/// The policy as last committed, with its ordering key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedPolicy {
    pub policy: StorageControlPolicy,
    pub event_time: DateTime<Utc>,
    pub version: i64,
}

/// Immutable audit entry for one received budget event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAlertRecord {
    pub id: String,
    pub project_id: String,
    pub cost_amount: Decimal,
    pub budget_amount: Decimal,
    pub usage_percent: Decimal,
    pub alert_level: AlertLevel,
    /// Time of the budget event itself
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl BudgetAlertRecord {
    pub fn new(
        sample: &UsageSample,
        usage_percent: Decimal,
        alert_level: AlertLevel,
        project_id: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            cost_amount: sample.cost_amount,
            budget_amount: sample.budget_amount,
            usage_percent,
            alert_level,
            timestamp: sample.sampled_at,
            received_at: Utc::now(),
        }
    }

    /// Identifies the underlying billing notification across redeliveries.
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.project_id,
            decimal_helpers::decimal_to_string(self.cost_amount),
            decimal_helpers::decimal_to_string(self.budget_amount),
            timestamp_helpers::to_micros(self.timestamp)
        )
    }
}

/// One point of the estimated storage usage time series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageStatsSample {
    pub total_objects: u64,
    pub estimated_size_gb: Decimal,
    pub cost_estimate_usd: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// SQLite-backed control state
#[derive(Clone)]
pub struct SqliteControlStateStore {
    pool: SqlitePool,
}

impl SqliteControlStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Add or replace an entry in the object catalog the estimator counts.
    pub async fn register_object(&self, id: &str, image_ref: Option<&str>) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO stored_objects (id, image_ref, created_at) VALUES (?, ?, ?)",
        )
        .bind(id)
        .bind(image_ref)
        .bind(timestamp_helpers::to_micros(Utc::now()))
        .execute(&self.pool)
        .await?;

        debug!("Registered object {} (image: {})", id, image_ref.is_some());
        Ok(())
    }

    fn audit_record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<BudgetAlertRecord> {
        let level: String = row.try_get("alert_level")?;
        Ok(BudgetAlertRecord {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            cost_amount: decimal_helpers::string_to_decimal(&row.try_get::<String, _>("cost_amount")?)?,
            budget_amount: decimal_helpers::string_to_decimal(
                &row.try_get::<String, _>("budget_amount")?,
            )?,
            usage_percent: decimal_helpers::string_to_decimal(
                &row.try_get::<String, _>("usage_percent")?,
            )?,
            alert_level: level.parse()?,
            timestamp: timestamp_helpers::from_micros(row.try_get("event_time")?)?,
            received_at: timestamp_helpers::from_micros(row.try_get("received_at")?)?,
        })
    }
}

#[async_trait]
impl ControlStateStore for SqliteControlStateStore {
    async fn put_policy(
        &self,
        policy: &StorageControlPolicy,
        event_time: DateTime<Utc>,
    ) -> Result<PolicyWrite> {
        debug!(
            "Writing storage control policy: level={}, event_time={}",
            policy.warning_level, event_time
        );

        // Single-statement compare-and-set on event_time
        let version: Vec<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO storage_control (
                id, upload_enabled, compression_mode, auto_delete_days, warning_level,
                usage_percent, updated_at, reason, event_time, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
            ON CONFLICT(id) DO UPDATE SET
                upload_enabled = excluded.upload_enabled,
                compression_mode = excluded.compression_mode,
                auto_delete_days = excluded.auto_delete_days,
                warning_level = excluded.warning_level,
                usage_percent = excluded.usage_percent,
                updated_at = excluded.updated_at,
                reason = excluded.reason,
                event_time = excluded.event_time,
                version = storage_control.version + 1
            WHERE excluded.event_time > storage_control.event_time
            RETURNING version
            "#,
        )
        .bind(POLICY_ID)
        .bind(policy.upload_enabled)
        .bind(policy.compression_mode.as_str())
        .bind(policy.auto_delete_days.map(i64::from))
        .bind(policy.warning_level.as_str())
        .bind(decimal_helpers::decimal_to_string(policy.usage_percent))
        .bind(timestamp_helpers::to_micros(policy.updated_at))
        .bind(policy.reason.as_deref())
        .bind(timestamp_helpers::to_micros(event_time))
        .fetch_all(&self.pool)
        .await?;

        // The statement must run to completion to commit, so all rows are drained
        Ok(match version.first().copied() {
            Some(version) => {
                info!("Storage control policy committed (version {})", version);
                PolicyWrite::Applied { version }
            }
            None => {
                debug!("Policy write for event at {} superseded", event_time);
                PolicyWrite::Superseded
            }
        })
    }

    async fn current_policy(&self) -> Result<Option<CommittedPolicy>> {
        let row = sqlx::query(
            r#"
            SELECT upload_enabled, compression_mode, auto_delete_days, warning_level,
                   usage_percent, updated_at, reason, event_time, version
            FROM storage_control WHERE id = ?
            "#,
        )
        .bind(POLICY_ID)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let compression_mode: String = row.try_get("compression_mode")?;
        let warning_level: String = row.try_get("warning_level")?;
        let auto_delete_days: Option<i64> = row.try_get("auto_delete_days")?;

        let policy = StorageControlPolicy {
            upload_enabled: row.try_get("upload_enabled")?,
            compression_mode: compression_mode.parse()?,
            auto_delete_days: auto_delete_days.map(|days| days as u32),
            warning_level: warning_level.parse()?,
            usage_percent: decimal_helpers::string_to_decimal(
                &row.try_get::<String, _>("usage_percent")?,
            )?,
            updated_at: timestamp_helpers::from_micros(row.try_get("updated_at")?)?,
            reason: row.try_get("reason")?,
        };

        Ok(Some(CommittedPolicy {
            policy,
            event_time: timestamp_helpers::from_micros(row.try_get("event_time")?)?,
            version: row.try_get("version")?,
        }))
    }

    async fn append_audit_record(&self, record: &BudgetAlertRecord) -> Result<AuditAppend> {
        debug!("Appending budget alert record {}", record.idempotency_key());

        let result = sqlx::query(
            r#"
            INSERT INTO budget_alerts (
                id, project_id, cost_amount, budget_amount, usage_percent,
                alert_level, event_time, received_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(project_id, cost_amount, budget_amount, event_time) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(&record.project_id)
        .bind(decimal_helpers::decimal_to_string(record.cost_amount))
        .bind(decimal_helpers::decimal_to_string(record.budget_amount))
        .bind(decimal_helpers::decimal_to_string(record.usage_percent))
        .bind(record.alert_level.as_str())
        .bind(timestamp_helpers::to_micros(record.timestamp))
        .bind(timestamp_helpers::to_micros(record.received_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(AuditAppend::AlreadyExists)
        } else {
            Ok(AuditAppend::Recorded)
        }
    }

    async fn recent_audit_records(&self, limit: u32) -> Result<Vec<BudgetAlertRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, cost_amount, budget_amount, usage_percent,
                   alert_level, event_time, received_at
            FROM budget_alerts
            ORDER BY received_at DESC, event_time DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::audit_record_from_row).collect()
    }

    async fn append_stats_sample(&self, sample: &StorageStatsSample) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO storage_stats (total_objects, estimated_size_gb, cost_estimate_usd, sampled_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(sample.total_objects as i64)
        .bind(decimal_helpers::decimal_to_string(sample.estimated_size_gb))
        .bind(decimal_helpers::decimal_to_string(sample.cost_estimate_usd))
        .bind(timestamp_helpers::to_micros(sample.timestamp))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_stats_samples(&self, limit: u32) -> Result<Vec<StorageStatsSample>> {
        let rows = sqlx::query(
            r#"
            SELECT total_objects, estimated_size_gb, cost_estimate_usd, sampled_at
            FROM storage_stats
            ORDER BY sampled_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StorageStatsSample {
                    total_objects: row.try_get::<i64, _>("total_objects")? as u64,
                    estimated_size_gb: decimal_helpers::string_to_decimal(
                        &row.try_get::<String, _>("estimated_size_gb")?,
                    )?,
                    cost_estimate_usd: decimal_helpers::string_to_decimal(
                        &row.try_get::<String, _>("cost_estimate_usd")?,
                    )?,
                    timestamp: timestamp_helpers::from_micros(row.try_get("sampled_at")?)?,
                })
            })
            .collect()
    }

    async fn count_objects_with_image(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM stored_objects WHERE image_ref IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;

        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::policy::{CompressionMode, PolicyDeriver};
    use crate::platform::AppPaths;
    use crate::storage::Database;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    async fn create_test_store() -> (SqliteControlStateStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_data_dir(temp_dir.path()).unwrap();
        let db = Database::new(&paths).await.unwrap();
        let store = SqliteControlStateStore::new(db.pool().clone());
        (store, temp_dir)
    }

    fn record(project: &str, cost: Decimal, at: DateTime<Utc>) -> BudgetAlertRecord {
        let sample = UsageSample::new(cost, Decimal::new(10, 0), at);
        BudgetAlertRecord::new(&sample, cost * Decimal::TEN, AlertLevel::Warning, project)
    }

    #[test]
    fn test_retry_strategy_is_bounded() {
        let config = StoreConfig::default();
        let delays: Vec<Duration> = config.retry_strategy().collect();

        assert_eq!(delays.len(), 4);
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(2000)));
        assert!(config.validate().is_ok());

        let invalid = StoreConfig {
            timeout_ms: 0,
            ..Default::default()
        };
        assert!(invalid.validate().is_err());
    }

    #[tokio::test]
    async fn test_with_timeout_reports_store_unavailable() {
        let slow = async {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            Ok::<u64, Error>(1)
        };
        let result = with_timeout(std::time::Duration::from_millis(10), "slow_op", slow).await;
        match result {
            Err(e @ Error::StoreUnavailable(_)) => assert!(e.is_retryable()),
            other => panic!("unexpected result: {:?}", other),
        }

        let fast = async { Ok::<u64, Error>(7) };
        assert_eq!(with_timeout(std::time::Duration::from_secs(1), "fast_op", fast).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_policy_round_trip() {
        let (store, _temp_dir) = create_test_store().await;
        assert!(store.current_policy().await.unwrap().is_none());

        let policy = PolicyDeriver::default().derive(AlertLevel::Critical, Decimal::new(85, 0));
        let event_time = Utc::now();
        let write = store.put_policy(&policy, event_time).await.unwrap();
        assert_eq!(write, PolicyWrite::Applied { version: 1 });

        let committed = store.current_policy().await.unwrap().unwrap();
        assert_eq!(committed.version, 1);
        assert_eq!(committed.event_time.timestamp_micros(), event_time.timestamp_micros());
        assert_eq!(committed.policy.compression_mode, CompressionMode::Emergency);
        assert_eq!(committed.policy.auto_delete_days, Some(30));
        assert_eq!(committed.policy.usage_percent, Decimal::new(85, 0));
        assert!(committed.policy.same_controls(&policy));
    }

    #[tokio::test]
    async fn test_policy_write_is_conditional_on_event_time() {
        let (store, _temp_dir) = create_test_store().await;
        let deriver = PolicyDeriver::default();
        let newer = Utc::now();
        let older = newer - ChronoDuration::minutes(10);

        let emergency = deriver.derive(AlertLevel::Emergency, Decimal::new(95, 0));
        assert!(store.put_policy(&emergency, newer).await.unwrap().is_applied());

        // Older event delivered late must not win
        let info = deriver.derive(AlertLevel::Info, Decimal::new(45, 0));
        assert_eq!(store.put_policy(&info, older).await.unwrap(), PolicyWrite::Superseded);

        // Same event time again is also a no-op
        assert_eq!(store.put_policy(&info, newer).await.unwrap(), PolicyWrite::Superseded);

        let committed = store.current_policy().await.unwrap().unwrap();
        assert_eq!(committed.policy.warning_level, AlertLevel::Emergency);
        assert!(!committed.policy.upload_enabled);
        assert_eq!(committed.version, 1);

        let latest = newer + ChronoDuration::minutes(10);
        assert_eq!(
            store.put_policy(&info, latest).await.unwrap(),
            PolicyWrite::Applied { version: 2 }
        );
        let committed = store.current_policy().await.unwrap().unwrap();
        assert_eq!(committed.policy.warning_level, AlertLevel::Info);
        assert_eq!(committed.policy.reason, None);
    }

    #[tokio::test]
    async fn test_applied_write_is_visible_to_other_connections() {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_data_dir(temp_dir.path()).unwrap();
        let writer_db = Database::new(&paths).await.unwrap();
        let writer = SqliteControlStateStore::new(writer_db.pool().clone());
        let deriver = PolicyDeriver::default();
        let first = Utc::now();

        let emergency = deriver.derive(AlertLevel::Emergency, Decimal::new(95, 0));
        writer.put_policy(&emergency, first).await.unwrap();
        let info = deriver.derive(AlertLevel::Info, Decimal::new(45, 0));
        let second = first + ChronoDuration::minutes(1);
        assert_eq!(
            writer.put_policy(&info, second).await.unwrap(),
            PolicyWrite::Applied { version: 2 }
        );

        // A separate pool only sees committed data
        let reader_db = Database::new(&paths).await.unwrap();
        let reader = SqliteControlStateStore::new(reader_db.pool().clone());
        let committed = reader.current_policy().await.unwrap().unwrap();
        assert_eq!(committed.policy.warning_level, AlertLevel::Info);
        assert_eq!(committed.version, 2);
        assert_eq!(committed.event_time.timestamp_micros(), second.timestamp_micros());
    }

    #[tokio::test]
    async fn test_sub_millisecond_ordering_and_dedup() {
        let (store, _temp_dir) = create_test_store().await;
        let deriver = PolicyDeriver::default();
        let t1 = Utc::now();
        let t2 = t1 + ChronoDuration::microseconds(400);

        let emergency = deriver.derive(AlertLevel::Emergency, Decimal::new(95, 0));
        let info = deriver.derive(AlertLevel::Info, Decimal::new(45, 0));
        assert!(store.put_policy(&emergency, t1).await.unwrap().is_applied());
        assert_eq!(
            store.put_policy(&info, t2).await.unwrap(),
            PolicyWrite::Applied { version: 2 }
        );
        let committed = store.current_policy().await.unwrap().unwrap();
        assert_eq!(committed.policy.warning_level, AlertLevel::Info);

        let a = record("checkdarn", Decimal::new(85, 1), t1);
        let b = record("checkdarn", Decimal::new(85, 1), t2);
        assert_ne!(a.idempotency_key(), b.idempotency_key());
        assert_eq!(store.append_audit_record(&a).await.unwrap(), AuditAppend::Recorded);
        assert_eq!(store.append_audit_record(&b).await.unwrap(), AuditAppend::Recorded);
    }

    #[tokio::test]
    async fn test_audit_append_is_idempotent() {
        let (store, _temp_dir) = create_test_store().await;
        let at = Utc::now();

        let first = record("checkdarn", Decimal::new(85, 1), at);
        assert_eq!(store.append_audit_record(&first).await.unwrap(), AuditAppend::Recorded);

        // Redelivery gets a fresh id but the same key; 8.50 equals 8.5
        let redelivered = record("checkdarn", Decimal::new(850, 2), at);
        assert_ne!(first.id, redelivered.id);
        assert_eq!(first.idempotency_key(), redelivered.idempotency_key());
        assert_eq!(
            store.append_audit_record(&redelivered).await.unwrap(),
            AuditAppend::AlreadyExists
        );

        // Different project, same figures: distinct event
        let other = record("other-project", Decimal::new(85, 1), at);
        assert_eq!(store.append_audit_record(&other).await.unwrap(), AuditAppend::Recorded);

        let records = store.recent_audit_records(10).await.unwrap();
        assert_eq!(records.len(), 2);
        let stored = records.iter().find(|r| r.id == first.id).unwrap();
        assert_eq!(stored.cost_amount, Decimal::new(85, 1));
        assert_eq!(stored.alert_level, AlertLevel::Warning);
    }

    #[tokio::test]
    async fn test_stats_samples_are_appended() {
        let (store, _temp_dir) = create_test_store().await;
        let start = Utc::now();

        for hour in 0..3 {
            let sample = StorageStatsSample {
                total_objects: 1000 + hour,
                estimated_size_gb: Decimal::new(19, 2),
                cost_estimate_usd: Decimal::new(5, 3),
                timestamp: start + ChronoDuration::hours(hour as i64),
            };
            store.append_stats_sample(&sample).await.unwrap();
        }

        let samples = store.recent_stats_samples(2).await.unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].total_objects, 1002);
        assert_eq!(samples[1].total_objects, 1001);
    }

    #[tokio::test]
    async fn test_count_objects_with_image() {
        let (store, _temp_dir) = create_test_store().await;

        store.register_object("report-1", Some("gs://bucket/1.jpg")).await.unwrap();
        store.register_object("report-2", None).await.unwrap();
        store.register_object("report-3", Some("gs://bucket/3.jpg")).await.unwrap();
        assert_eq!(store.count_objects_with_image().await.unwrap(), 2);

        // Replacing an entry drops its image
        store.register_object("report-3", None).await.unwrap();
        assert_eq!(store.count_objects_with_image().await.unwrap(), 1);
    }
}
