use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_retry::RetryIf;
use tracing::{debug, error, info, warn};

use crate::budget::classifier::{AlertClassifier, AlertLevel, UsageSample};
use crate::budget::event::{BudgetNotification, UNKNOWN_PROJECT};
use crate::budget::policy::{PolicyDeriver, StorageControlPolicy};
use crate::error::{Error, Result};
use crate::notify::{BudgetNotice, Notifier};
use crate::storage::{
    timestamp_helpers, with_timeout, AuditAppend, BudgetAlertRecord, ControlStateStore,
    PolicyWrite, StoreConfig,
};

/// What happened to the audit log for one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Recorded,
    /// The same billing notification was already recorded
    Duplicate,
    /// The append failed; the policy write still stands
    Failed(String),
}

/// Result of handling one budget-usage event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleOutcome {
    pub level: AlertLevel,
    pub usage_percent: Decimal,
    pub policy: StorageControlPolicy,
    pub policy_write: PolicyWrite,
    pub audit: AuditOutcome,
    pub notified: bool,
}

impl HandleOutcome {
    pub fn is_duplicate(&self) -> bool {
        self.audit == AuditOutcome::Duplicate
    }
}

/// Turns budget-usage events into committed storage-control policies.
///
/// Each call runs validation, classification and derivation, then a
/// conditional policy write (retried on transient store failures), a
/// deduplicated audit append and a best-effort notification.
pub struct BudgetEventHandler {
    classifier: AlertClassifier,
    deriver: PolicyDeriver,
    store: Arc<dyn ControlStateStore>,
    notifier: Arc<dyn Notifier>,
    store_config: StoreConfig,
    default_project_id: String,
}

impl BudgetEventHandler {
    pub fn new(store: Arc<dyn ControlStateStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            classifier: AlertClassifier::default(),
            deriver: PolicyDeriver::default(),
            store,
            notifier,
            store_config: StoreConfig::default(),
            default_project_id: UNKNOWN_PROJECT.to_string(),
        }
    }

    pub fn with_classifier(mut self, classifier: AlertClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_deriver(mut self, deriver: PolicyDeriver) -> Self {
        self.deriver = deriver;
        self
    }

    pub fn with_store_config(mut self, store_config: StoreConfig) -> Self {
        self.store_config = store_config;
        self
    }

    /// Project recorded for notifications that do not name one.
    pub fn with_default_project(mut self, project_id: impl Into<String>) -> Self {
        self.default_project_id = project_id.into();
        self
    }

    pub async fn handle_notification(
        &self,
        notification: &BudgetNotification,
    ) -> Result<HandleOutcome> {
        if let Some(currency) = &notification.currency_code {
            debug!("Budget notification currency: {}", currency);
        }
        let project_id = match notification.project_id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => self.default_project_id.as_str(),
        };
        self.handle(&notification.to_sample(), project_id).await
    }

    pub async fn handle(&self, sample: &UsageSample, project_id: &str) -> Result<HandleOutcome> {
        info!(
            "Budget alert received: project={}, cost={}, budget={}, at={}",
            project_id, sample.cost_amount, sample.budget_amount, sample.sampled_at
        );

        // Nothing is written for an invalid sample
        let usage_percent = AlertClassifier::usage_percent(sample).map_err(|e| {
            warn!("Rejected budget event for {}: {}", project_id, e);
            e
        })?;
        let level = self.classifier.level_for_percent(usage_percent);
        let policy = self.deriver.derive(level, usage_percent);

        let policy_write = self.write_policy(&policy, sample.sampled_at).await?;
        match policy_write {
            PolicyWrite::Applied { version } => {
                log_policy_change(level, usage_percent);
                debug!("Policy version {} now in effect", version);
            }
            PolicyWrite::Superseded => {
                info!(
                    "Policy from event at {} superseded by a newer event; keeping current policy",
                    sample.sampled_at
                );
            }
        }

        let record = BudgetAlertRecord::new(sample, usage_percent, level, project_id);
        let audit = self.append_audit(&record).await;

        let notified = if policy_write.is_applied() && audit != AuditOutcome::Duplicate {
            self.send_notice(project_id, level, &policy).await
        } else {
            false
        };

        Ok(HandleOutcome {
            level,
            usage_percent,
            policy,
            policy_write,
            audit,
            notified,
        })
    }

    async fn write_policy(
        &self,
        policy: &StorageControlPolicy,
        event_time: DateTime<Utc>,
    ) -> Result<PolicyWrite> {
        let attempts = AtomicU32::new(0);
        let timeout = self.store_config.timeout();

        let result = RetryIf::start(
            self.store_config.retry_strategy(),
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                with_timeout(timeout, "put_policy", self.store.put_policy(policy, event_time))
            },
            |e: &Error| {
                let retryable = e.is_retryable();
                if retryable {
                    warn!(
                        "Policy write attempt {} failed, retrying: {}",
                        attempts.load(Ordering::Relaxed),
                        e
                    );
                }
                retryable
            },
        )
        .await;

        let write = result.map_err(|e| {
            let attempts = attempts.load(Ordering::Relaxed);
            error!("Policy write failed after {} attempts: {}", attempts, e);
            Error::PolicyUpdateFailed {
                attempts,
                reason: e.to_string(),
            }
        })?;

        if write == PolicyWrite::Superseded && attempts.load(Ordering::Relaxed) > 1 {
            return Ok(self.resolve_retried_write(policy, event_time).await);
        }
        Ok(write)
    }

    /// A timed-out attempt may have committed before its reply was lost, in
    /// which case the retry collides with that commit and reports
    /// `Superseded`. The committed row tells the two cases apart.
    async fn resolve_retried_write(
        &self,
        policy: &StorageControlPolicy,
        event_time: DateTime<Utc>,
    ) -> PolicyWrite {
        let current = with_timeout(
            self.store_config.timeout(),
            "current_policy",
            self.store.current_policy(),
        )
        .await;

        match current {
            Ok(Some(committed))
                if timestamp_helpers::to_micros(committed.event_time)
                    == timestamp_helpers::to_micros(event_time)
                    && committed.policy.same_controls(policy) =>
            {
                info!(
                    "Policy for event at {} was committed by an earlier attempt (version {})",
                    event_time, committed.version
                );
                PolicyWrite::Applied {
                    version: committed.version,
                }
            }
            Ok(_) => PolicyWrite::Superseded,
            Err(e) => {
                warn!("Could not confirm outcome of retried policy write: {}", e);
                PolicyWrite::Superseded
            }
        }
    }

    async fn append_audit(&self, record: &BudgetAlertRecord) -> AuditOutcome {
        let append = with_timeout(
            self.store_config.timeout(),
            "append_audit_record",
            self.store.append_audit_record(record),
        )
        .await;

        match append {
            Ok(AuditAppend::Recorded) => {
                debug!("Budget alert saved: {}", record.idempotency_key());
                AuditOutcome::Recorded
            }
            Ok(AuditAppend::AlreadyExists) => {
                info!(
                    "Duplicate budget event ignored: {}",
                    record.idempotency_key()
                );
                AuditOutcome::Duplicate
            }
            Err(e) => {
                error!(
                    "Error saving budget alert {}: {}",
                    record.idempotency_key(),
                    e
                );
                AuditOutcome::Failed(e.to_string())
            }
        }
    }

    async fn send_notice(
        &self,
        project_id: &str,
        level: AlertLevel,
        policy: &StorageControlPolicy,
    ) -> bool {
        let notice = BudgetNotice::new(project_id, level, policy);
        match self.notifier.notify(&notice).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Budget notification not delivered: {}", e);
                false
            }
        }
    }
}

fn log_policy_change(level: AlertLevel, usage_percent: Decimal) {
    match level {
        AlertLevel::Emergency => {
            error!("EMERGENCY: {} ({:.1}% of budget)", level.summary(), usage_percent)
        }
        AlertLevel::Critical => {
            warn!("CRITICAL: {} ({:.1}% of budget)", level.summary(), usage_percent)
        }
        AlertLevel::Warning => {
            warn!("NOTICE: {} ({:.1}% of budget)", level.summary(), usage_percent)
        }
        AlertLevel::Info => info!("{} ({:.1}% of budget)", level.summary(), usage_percent),
    }
}
