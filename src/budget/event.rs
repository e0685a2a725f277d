use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::budget::classifier::UsageSample;

/// Project recorded when a notification does not name one
pub const UNKNOWN_PROJECT: &str = "unknown";

/// Budget-usage notification as published by the billing system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetNotification {
    pub cost_amount: Decimal,
    pub budget_amount: Decimal,
    #[serde(default)]
    pub project_id: Option<String>,
    /// When the billing system produced the notification
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency_code: Option<String>,
}

impl BudgetNotification {
    pub fn project_id(&self) -> &str {
        self.project_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(UNKNOWN_PROJECT)
    }

    pub fn to_sample(&self) -> UsageSample {
        UsageSample::new(self.cost_amount, self.budget_amount, self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_billing_payload() {
        let json = r#"{
            "budgetDisplayName": "firebase-storage-budget-critical",
            "costAmount": 8.5,
            "budgetAmount": 10.0,
            "currencyCode": "USD",
            "projectId": "checkdarn",
            "timestamp": "2024-05-01T12:00:00Z"
        }"#;

        let notification: BudgetNotification = serde_json::from_str(json).unwrap();
        assert_eq!(notification.project_id(), "checkdarn");
        assert_eq!(notification.currency_code.as_deref(), Some("USD"));

        let sample = notification.to_sample();
        assert_eq!(sample.cost_amount, Decimal::new(85, 1));
        assert_eq!(sample.budget_amount, Decimal::new(10, 0));
        assert_eq!(sample.sampled_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_missing_project_defaults_to_unknown() {
        let json = r#"{"costAmount": "1", "budgetAmount": "0", "timestamp": "2024-05-01T12:00:00Z"}"#;
        let notification: BudgetNotification = serde_json::from_str(json).unwrap();
        assert_eq!(notification.project_id(), UNKNOWN_PROJECT);

        let empty = BudgetNotification {
            project_id: Some(String::new()),
            ..notification
        };
        assert_eq!(empty.project_id(), UNKNOWN_PROJECT);
    }

    #[test]
    fn test_timestamp_is_required() {
        let json = r#"{"costAmount": 1, "budgetAmount": 10}"#;
        assert!(serde_json::from_str::<BudgetNotification>(json).is_err());
    }
}
