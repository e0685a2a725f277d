use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::budget::{AlertThresholds, EstimatorConfig, PolicyConfig, UNKNOWN_PROJECT};
use crate::error::{Error, Result};
use crate::notify::NotificationConfig;
use crate::platform::AppPaths;
use crate::storage::StoreConfig;

/// Prefix for environment overrides, e.g. `BUDGETGUARD__STORE__TIMEOUT_MS=500`
pub const ENV_PREFIX: &str = "BUDGETGUARD";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub budget: BudgetConfig,
    pub policy: PolicyConfig,
    pub estimator: EstimatorConfig,
    pub store: StoreConfig,
    pub notification: NotificationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub thresholds: AlertThresholds,
    /// Project recorded for events that do not name one
    pub default_project_id: String,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            thresholds: AlertThresholds::default(),
            default_project_id: UNKNOWN_PROJECT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also write a daily rolling log file to the logs directory
    pub file_logging: bool,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file_logging: false,
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from the platform config file, creating it with defaults when
    /// missing.
    pub async fn load(paths: &AppPaths) -> Result<Self> {
        let config_file = paths.config_file();

        if !config_file.exists() {
            info!("Config file not found, creating default configuration");
            let default_config = Self::default();
            default_config.save_to(&config_file).await?;
        }

        Self::load_from(&config_file)
    }

    /// Layer defaults, the TOML file at `path` (if present) and
    /// `BUDGETGUARD__*` environment variables.
    pub fn load_from(path: &Path) -> Result<Self> {
        info!("Loading configuration from: {:?}", path);

        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    pub async fn save(&self, paths: &AppPaths) -> Result<()> {
        self.save_to(&paths.config_file()).await
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        info!("Saving configuration to: {:?}", path);

        let config_content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, config_content).await?;

        info!("Configuration saved successfully");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.budget.thresholds.validate()?;
        if self.budget.default_project_id.trim().is_empty() {
            return Err(Error::validation("Default project id must not be empty"));
        }

        self.policy.validate()?;
        self.estimator.validate()?;
        self.store.validate()?;
        self.notification.validate()?;

        if self.logging.level.parse::<tracing::Level>().is_err() {
            return Err(Error::validation(format!(
                "Unknown log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }
}
