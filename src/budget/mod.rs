//! Budget-driven storage control.
//!
//! A budget-usage event flows through [`AlertClassifier`] (usage to level),
//! [`PolicyDeriver`] (level to storage-control policy) and
//! [`BudgetEventHandler`], which commits the policy, records the alert and
//! notifies clients. [`UsageEstimator`] runs independently on a schedule.

pub mod classifier;
pub mod estimator;
pub mod event;
pub mod handler;
pub mod policy;

pub use classifier::{AlertClassifier, AlertLevel, AlertThresholds, UsageSample};
pub use estimator::{EstimatorConfig, UsageEstimator};
pub use event::{BudgetNotification, UNKNOWN_PROJECT};
pub use handler::{AuditOutcome, BudgetEventHandler, HandleOutcome};
pub use policy::{
    CompressionMode, PolicyConfig, PolicyDeriver, StorageControlPolicy, BUDGET_EXCEEDED_REASON,
};
