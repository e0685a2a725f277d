pub mod app;
pub mod budget;
pub mod cli;
pub mod error;
pub mod notify;
pub mod platform;
pub mod storage;

pub use error::{Error, Result};
