pub mod config;
pub mod state;

pub use config::{AppConfig, BudgetConfig, LoggingConfig};
pub use state::AppState;
