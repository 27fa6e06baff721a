//! Configuration management for the speech translation backend
//!
//! Supports loading configuration from:
//! - TOML files
//! - Environment variables (SPEECHBRIDGE_ prefix)
//! - Runtime defaults matching each component's built-in configuration

pub mod settings;

pub use settings::{
    load_settings, AudioSettings, OrchestratorSettings, QueueSettings, RecoverySettings,
    RouterSettings, Settings,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

/// Initialize tracing with env-filter support. Safe to call more than once;
/// later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();
}
