//! Periodic storage usage estimation.
//!
//! Object sizes are not measured: every stored image is assumed to weigh
//! `average_object_size_bytes`, which makes the output a rough cost signal
//! rather than an invoice.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::storage::{with_timeout, ControlStateStore, StorageStatsSample};

const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    pub interval_secs: u64,
    /// Assumed size of one stored image (200 KiB by default)
    pub average_object_size_bytes: u64,
    /// Storage price in USD per GB-month
    pub price_per_gb: Decimal,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            average_object_size_bytes: 200 * 1024,
            price_per_gb: Decimal::new(26, 3),
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(Error::validation("Estimator interval must be greater than 0"));
        }
        if self.average_object_size_bytes == 0 {
            return Err(Error::validation("Average object size must be greater than 0"));
        }
        if self.price_per_gb < Decimal::ZERO {
            return Err(Error::validation("Price per GB must not be negative"));
        }
        Ok(())
    }

    /// Estimated size in GB and monthly cost in USD for `total_objects`.
    pub fn estimate(&self, total_objects: u64) -> (Decimal, Decimal) {
        let total_bytes =
            Decimal::from(total_objects) * Decimal::from(self.average_object_size_bytes);
        let size_gb = total_bytes / Decimal::from(BYTES_PER_GB);
        let cost_usd = size_gb * self.price_per_gb;
        (size_gb, cost_usd)
    }
}

/// Samples the object catalog and appends a [`StorageStatsSample`].
pub struct UsageEstimator {
    store: Arc<dyn ControlStateStore>,
    config: EstimatorConfig,
    interval: Duration,
    store_timeout: Duration,
}

impl UsageEstimator {
    pub fn new(
        store: Arc<dyn ControlStateStore>,
        config: EstimatorConfig,
        store_timeout: Duration,
    ) -> Self {
        let interval = Duration::from_secs(config.interval_secs).max(MIN_INTERVAL);
        Self {
            store,
            config,
            interval,
            store_timeout,
        }
    }

    /// Override the scheduling interval (at least one millisecond).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Take one sample. Nothing is written when the object count cannot be
    /// obtained.
    pub async fn sample(&self) -> Result<StorageStatsSample> {
        let total_objects = with_timeout(
            self.store_timeout,
            "count_objects_with_image",
            self.store.count_objects_with_image(),
        )
        .await?;

        let (estimated_size_gb, cost_estimate_usd) = self.config.estimate(total_objects);
        let sample = StorageStatsSample {
            total_objects,
            estimated_size_gb,
            cost_estimate_usd,
            timestamp: Utc::now(),
        };

        with_timeout(
            self.store_timeout,
            "append_stats_sample",
            self.store.append_stats_sample(&sample),
        )
        .await?;

        info!(
            "Storage monitored: {} images, {:.2} GB, ${:.4}",
            sample.total_objects, sample.estimated_size_gb, sample.cost_estimate_usd
        );
        Ok(sample)
    }

    /// Scheduled invocation: failures are reported and the tick is skipped.
    pub async fn tick(&self) -> Option<StorageStatsSample> {
        match self.sample().await {
            Ok(sample) => Some(sample),
            Err(e) => {
                error!("Storage usage sample skipped: {}", e);
                None
            }
        }
    }

    /// Sample once per interval until `shutdown` becomes true or its sender
    /// is dropped. The first sample is taken immediately.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting storage usage monitor (every {:?})", self.interval);
        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Storage usage monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}
