use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid budget: {0}")]
    InvalidBudget(String),

    #[error("Control state store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Policy update failed after {attempts} attempts: {reason}")]
    PolicyUpdateFailed { attempts: u32, reason: String },

    #[error("Notification failed: {0}")]
    NotificationFailed(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    pub fn invalid_budget(msg: impl Into<String>) -> Self {
        Error::InvalidBudget(msg.into())
    }

    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Error::StoreUnavailable(msg.into())
    }

    pub fn notification_failed(msg: impl Into<String>) -> Self {
        Error::NotificationFailed(msg.into())
    }

    pub fn platform(msg: impl Into<String>) -> Self {
        Error::Platform(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Whether a store operation that failed with this error may succeed if
    /// attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::StoreUnavailable(_) => true,
            Error::Database(e) => match e {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
                sqlx::Error::Database(db_err) => {
                    let msg = db_err.message().to_ascii_lowercase();
                    msg.contains("locked") || msg.contains("busy")
                }
                _ => false,
            },
            _ => false,
        }
    }
}
