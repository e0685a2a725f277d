use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::budget::classifier::AlertLevel;
use crate::error::{Error, Result};

/// Reason recorded when uploads are switched off.
pub const BUDGET_EXCEEDED_REASON: &str = "budget_exceeded";

/// Image compression applied by the client application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMode {
    Normal,
    Aggressive,
    Emergency,
}

impl CompressionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionMode::Normal => "normal",
            CompressionMode::Aggressive => "aggressive",
            CompressionMode::Emergency => "emergency",
        }
    }
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CompressionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(CompressionMode::Normal),
            "aggressive" => Ok(CompressionMode::Aggressive),
            "emergency" => Ok(CompressionMode::Emergency),
            other => Err(Error::validation(format!("Unknown compression mode: {}", other))),
        }
    }
}

/// Runtime configuration the client application applies to image uploads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageControlPolicy {
    pub upload_enabled: bool,
    pub compression_mode: CompressionMode,
    pub auto_delete_days: Option<u32>,
    pub warning_level: AlertLevel,
    pub usage_percent: Decimal,
    pub updated_at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl StorageControlPolicy {
    /// True when the two policies prescribe the same client behavior,
    /// regardless of the usage figure and derivation time they carry.
    pub fn same_controls(&self, other: &StorageControlPolicy) -> bool {
        self.upload_enabled == other.upload_enabled
            && self.compression_mode == other.compression_mode
            && self.auto_delete_days == other.auto_delete_days
            && self.warning_level == other.warning_level
            && self.reason == other.reason
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Retention window applied at the critical level
    pub critical_retention_days: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            critical_retention_days: 30,
        }
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.critical_retention_days == 0 {
            return Err(Error::validation("Critical retention days must be greater than 0"));
        }
        Ok(())
    }
}

/// Builds a complete [`StorageControlPolicy`] from an alert level.
///
/// Every call produces a full policy from scratch, so no field from a
/// previous, less severe event can survive into the next one.
#[derive(Debug, Clone, Default)]
pub struct PolicyDeriver {
    config: PolicyConfig,
}

impl PolicyDeriver {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn derive(&self, level: AlertLevel, usage_percent: Decimal) -> StorageControlPolicy {
        self.derive_at(level, usage_percent, Utc::now())
    }

    pub fn derive_at(
        &self,
        level: AlertLevel,
        usage_percent: Decimal,
        updated_at: DateTime<Utc>,
    ) -> StorageControlPolicy {
        let (upload_enabled, compression_mode, auto_delete_days, reason) = match level {
            AlertLevel::Emergency => (
                false,
                CompressionMode::Emergency,
                None,
                Some(BUDGET_EXCEEDED_REASON.to_string()),
            ),
            AlertLevel::Critical => (
                true,
                CompressionMode::Emergency,
                Some(self.config.critical_retention_days),
                None,
            ),
            AlertLevel::Warning => (true, CompressionMode::Aggressive, None, None),
            AlertLevel::Info => (true, CompressionMode::Normal, None, None),
        };

        StorageControlPolicy {
            upload_enabled,
            compression_mode,
            auto_delete_days,
            warning_level: level,
            usage_percent,
            updated_at,
            reason,
        }
    }
}
