use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::app::config::AppConfig;
use crate::budget::{
    AlertClassifier, BudgetEventHandler, BudgetNotification, HandleOutcome, PolicyDeriver,
    UsageEstimator,
};
use crate::error::Result;
use crate::notify::Notifier;
use crate::platform::AppPaths;
use crate::storage::{CommittedPolicy, ControlStateStore, Database, SqliteControlStateStore};

/// Wires configuration, the control-state database, the budget handler and
/// the usage estimator together.
pub struct AppState {
    config: Arc<RwLock<AppConfig>>,
    paths: AppPaths,
    database: Database,
    store: Arc<SqliteControlStateStore>,
    notifier: Arc<dyn Notifier>,
    handler: RwLock<Arc<BudgetEventHandler>>,
}

impl AppState {
    /// Notifier is built from `config.notification`.
    pub async fn new(config: AppConfig, paths: AppPaths) -> Result<Self> {
        let notifier = config.notification.build_notifier()?;
        Self::with_notifier(config, paths, notifier).await
    }

    pub async fn with_notifier(
        config: AppConfig,
        paths: AppPaths,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        info!("Initializing application state");
        config.validate()?;

        let database = Database::new(&paths).await?;
        let store = Arc::new(SqliteControlStateStore::new(database.pool().clone()));
        let handler = build_handler(&config, store.clone(), notifier.clone());

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            paths,
            database,
            store,
            notifier,
            handler: RwLock::new(Arc::new(handler)),
        })
    }

    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Apply, validate and persist a configuration change. The handler is
    /// rebuilt so new thresholds apply to the next event.
    pub async fn update_config<F>(&self, updater: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        debug!("Updating application configuration");

        let mut updated = self.get_config();
        updater(&mut updated);
        updated.validate()?;
        updated.save(&self.paths).await?;

        let handler = build_handler(&updated, self.store.clone(), self.notifier.clone());
        *self.config.write() = updated;
        *self.handler.write() = Arc::new(handler);

        info!("Configuration updated and saved");
        Ok(())
    }

    pub fn handler(&self) -> Arc<BudgetEventHandler> {
        self.handler.read().clone()
    }

    pub async fn handle_notification(
        &self,
        notification: &BudgetNotification,
    ) -> Result<HandleOutcome> {
        let handler = self.handler();
        handler.handle_notification(notification).await
    }

    pub fn estimator(&self) -> UsageEstimator {
        let config = self.config.read();
        UsageEstimator::new(
            self.store.clone(),
            config.estimator.clone(),
            config.store.timeout(),
        )
    }

    pub async fn current_policy(&self) -> Result<Option<CommittedPolicy>> {
        self.store.current_policy().await
    }

    pub fn store(&self) -> &Arc<SqliteControlStateStore> {
        &self.store
    }

    pub fn get_paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn get_database(&self) -> &Database {
        &self.database
    }
}

fn build_handler(
    config: &AppConfig,
    store: Arc<SqliteControlStateStore>,
    notifier: Arc<dyn Notifier>,
) -> BudgetEventHandler {
    BudgetEventHandler::new(store, notifier)
        .with_classifier(AlertClassifier::new(config.budget.thresholds.clone()))
        .with_deriver(PolicyDeriver::new(config.policy.clone()))
        .with_store_config(config.store.clone())
        .with_default_project(config.budget.default_project_id.clone())
}
