use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;

#[derive(Parser)]
#[command(name = "budgetguard")]
#[command(about = "Turns cloud budget alerts into storage upload and compression policies")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Keep config, database and logs under this directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Handle a single budget-usage event
    Event {
        /// Cost accrued so far
        #[arg(long)]
        cost: Decimal,

        /// Budget amount
        #[arg(long)]
        budget: Decimal,

        /// Project the budget belongs to
        #[arg(short, long)]
        project: Option<String>,

        /// Event time (RFC 3339); defaults to now
        #[arg(short, long)]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Handle budget notifications, one JSON object per line
    Ingest {
        /// Read from this file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Take one storage usage sample
    Estimate,

    /// Sample storage usage periodically until interrupted
    Monitor {
        /// Override the configured interval
        #[arg(short, long)]
        interval_secs: Option<u64>,
    },

    /// Show the storage-control policy currently in effect
    Policy,

    /// Show recent budget alerts
    Alerts {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },

    /// Show recent storage usage samples and database statistics
    Stats {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },

    /// Add an object to the catalog the estimator counts
    RegisterObject {
        /// Object id
        id: String,

        /// Stored image reference; objects without one are not counted
        #[arg(short, long)]
        image: Option<String>,
    },
}
