// Storage layer for control state

pub mod database;
pub mod control_state;

pub use database::{Database, DatabaseStatistics, decimal_helpers, timestamp_helpers};
pub use control_state::{
    AuditAppend, BudgetAlertRecord, CommittedPolicy, ControlStateStore, PolicyWrite,
    SqliteControlStateStore, StorageStatsSample, StoreConfig, with_timeout,
};
