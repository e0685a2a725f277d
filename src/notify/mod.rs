// Client-facing notification channel for budget-driven policy changes

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::budget::classifier::AlertLevel;
use crate::budget::policy::StorageControlPolicy;
use crate::error::{Error, Result};

/// Message sent to the client-facing channel after a policy change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetNotice {
    pub project_id: String,
    pub level: AlertLevel,
    pub usage_percent: Decimal,
    pub policy: StorageControlPolicy,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl BudgetNotice {
    pub fn new(project_id: &str, level: AlertLevel, policy: &StorageControlPolicy) -> Self {
        Self {
            project_id: project_id.to_string(),
            level,
            usage_percent: policy.usage_percent,
            policy: policy.clone(),
            message: format!(
                "[{}] Storage budget at {:.1}% for {}: {}",
                level.as_str().to_ascii_uppercase(),
                policy.usage_percent,
                project_id,
                level.summary()
            ),
            timestamp: Utc::now(),
        }
    }
}

/// Fire-and-forget delivery of [`BudgetNotice`]s.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &BudgetNotice) -> Result<()>;
}

/// Writes notices to the log only
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: &BudgetNotice) -> Result<()> {
        match notice.level {
            AlertLevel::Emergency => error!("{}", notice.message),
            AlertLevel::Critical | AlertLevel::Warning => warn!("{}", notice.message),
            AlertLevel::Info => info!("{}", notice.message),
        }
        Ok(())
    }
}

/// Forwards notices to an in-process consumer
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<BudgetNotice>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BudgetNotice>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, notice: &BudgetNotice) -> Result<()> {
        self.sender
            .send(notice.clone())
            .map_err(|e| Error::notification_failed(format!("receiver dropped: {}", e)))?;
        debug!("Queued budget notice for {}", notice.project_id);
        Ok(())
    }
}

/// POSTs each notice as JSON to a webhook (e.g. a chat incoming-webhook)
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notice: &BudgetNotice) -> Result<()> {
        debug!("Posting budget notice to webhook");

        let payload = serde_json::json!({
            "text": notice.message,
            "notice": notice,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::notification_failed(format!("webhook request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::notification_failed(format!(
                "webhook returned {}",
                status
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Webhook to post notices to; notices are only logged when unset
    pub webhook_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_ms: 5000,
        }
    }
}

impl NotificationConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::validation(format!(
                    "Webhook URL must be http(s): {}",
                    url
                )));
            }
        }
        if self.timeout_ms == 0 {
            return Err(Error::validation("Notification timeout must be greater than 0"));
        }
        Ok(())
    }

    pub fn build_notifier(&self) -> Result<Arc<dyn Notifier>> {
        match &self.webhook_url {
            Some(url) => {
                info!("Budget notices will be posted to a webhook");
                Ok(Arc::new(WebhookNotifier::new(
                    url.clone(),
                    Duration::from_millis(self.timeout_ms),
                )?))
            }
            None => Ok(Arc::new(LogNotifier)),
        }
    }
}
