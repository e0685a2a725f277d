use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Spend reported for one billing period against its budget ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub cost_amount: Decimal,
    pub budget_amount: Decimal,
    pub sampled_at: DateTime<Utc>,
}

impl UsageSample {
    pub fn new(cost_amount: Decimal, budget_amount: Decimal, sampled_at: DateTime<Utc>) -> Self {
        Self {
            cost_amount,
            budget_amount,
            sampled_at,
        }
    }

    /// Reject samples that cannot be classified.
    pub fn validate(&self) -> Result<()> {
        if self.budget_amount <= Decimal::ZERO {
            return Err(Error::invalid_budget(format!(
                "budget_amount must be greater than zero, got {}",
                self.budget_amount
            )));
        }
        if self.cost_amount < Decimal::ZERO {
            return Err(Error::invalid_budget(format!(
                "cost_amount must not be negative, got {}",
                self.cost_amount
            )));
        }
        Ok(())
    }
}

/// Severity of a budget-usage event. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl AlertLevel {
    pub const ALL: [AlertLevel; 4] = [
        AlertLevel::Info,
        AlertLevel::Warning,
        AlertLevel::Critical,
        AlertLevel::Emergency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
            AlertLevel::Emergency => "emergency",
        }
    }

    /// One-line description of what the level does to uploads.
    pub fn summary(&self) -> &'static str {
        match self {
            AlertLevel::Info => "Storage spend within budget, uploads unrestricted",
            AlertLevel::Warning => "Enabled aggressive compression mode",
            AlertLevel::Critical => "Enabled emergency compression with short retention",
            AlertLevel::Emergency => "Uploads disabled due to budget limit",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlertLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "info" => Ok(AlertLevel::Info),
            "warning" => Ok(AlertLevel::Warning),
            "critical" => Ok(AlertLevel::Critical),
            "emergency" => Ok(AlertLevel::Emergency),
            other => Err(Error::validation(format!("Unknown alert level: {}", other))),
        }
    }
}

/// Inclusive lower bounds, in percent of budget, for each non-info level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub warning_percent: Decimal,
    pub critical_percent: Decimal,
    pub emergency_percent: Decimal,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            warning_percent: Decimal::new(50, 0),
            critical_percent: Decimal::new(80, 0),
            emergency_percent: Decimal::new(90, 0),
        }
    }
}

impl AlertThresholds {
    pub fn validate(&self) -> Result<()> {
        if self.warning_percent <= Decimal::ZERO {
            return Err(Error::validation("Warning threshold must be greater than 0"));
        }
        if !(self.warning_percent < self.critical_percent
            && self.critical_percent < self.emergency_percent)
        {
            return Err(Error::validation(
                "Thresholds must be strictly increasing: warning < critical < emergency",
            ));
        }
        Ok(())
    }
}

/// Maps a usage sample to an [`AlertLevel`]. Pure; performs no I/O.
#[derive(Debug, Clone, Default)]
pub struct AlertClassifier {
    thresholds: AlertThresholds,
}

impl AlertClassifier {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    /// `cost_amount / budget_amount * 100`.
    pub fn usage_percent(sample: &UsageSample) -> Result<Decimal> {
        sample.validate()?;
        sample
            .cost_amount
            .checked_div(sample.budget_amount)
            .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
            .ok_or_else(|| {
                Error::invalid_budget(format!(
                    "usage of {} against {} is out of range",
                    sample.cost_amount, sample.budget_amount
                ))
            })
    }

    pub fn classify(&self, sample: &UsageSample) -> Result<AlertLevel> {
        let usage_percent = Self::usage_percent(sample)?;
        Ok(self.level_for_percent(usage_percent))
    }

    /// Highest level whose threshold `usage_percent` reaches.
    pub fn level_for_percent(&self, usage_percent: Decimal) -> AlertLevel {
        if usage_percent >= self.thresholds.emergency_percent {
            AlertLevel::Emergency
        } else if usage_percent >= self.thresholds.critical_percent {
            AlertLevel::Critical
        } else if usage_percent >= self.thresholds.warning_percent {
            AlertLevel::Warning
        } else {
            AlertLevel::Info
        }
    }
}
