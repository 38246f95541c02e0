//! Application configuration.

pub mod app_config;
pub mod args;
pub mod storage;

pub use app_config::{AppConfig, DEFAULT_MANAGER_NAME, LogLevel, default_cache_dir};
pub use args::{CliArgs, Command};
pub use storage::{ConfigError, StorageManager};
