//! Settings schema and loaders
//!
//! Each section mirrors one component's runtime configuration; conversion
//! methods hand the typed configs to the component crates. Values omitted
//! from the file fall back to the component defaults.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use speechbridge_audio::AudioFormat;
use speechbridge_core::{ErrorCategory, Result as CoreResult};
use speechbridge_pipeline::{OrchestratorConfig, RecoveryConfig, RecoveryStrategy, TaskQueue};
use speechbridge_router::RouterConfig;

use crate::ConfigError;

/// Orchestrator section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub max_concurrent_utterances: usize,
    pub utterance_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub enable_automatic_cleanup: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        let config = OrchestratorConfig::default();
        Self {
            max_concurrent_utterances: config.max_concurrent_utterances,
            utterance_timeout_secs: config.utterance_timeout.as_secs(),
            cleanup_interval_secs: config.cleanup_interval.as_secs(),
            enable_automatic_cleanup: config.enable_automatic_cleanup,
        }
    }
}

impl OrchestratorSettings {
    pub fn to_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrent_utterances: self.max_concurrent_utterances,
            utterance_timeout: Duration::from_secs(self.utterance_timeout_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            enable_automatic_cleanup: self.enable_automatic_cleanup,
        }
    }
}

/// Task queue section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub workers: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers: TaskQueue::DEFAULT_WORKERS,
        }
    }
}

/// Audio ingestion section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub chunk_size: u32,
    pub ring_cap_bytes: usize,
}

impl Default for AudioSettings {
    fn default() -> Self {
        let format = AudioFormat::default();
        Self {
            sample_rate: format.sample_rate,
            channels: format.channels,
            bits_per_sample: format.bits_per_sample,
            chunk_size: format.chunk_size,
            ring_cap_bytes: 1024 * 1024,
        }
    }
}

impl AudioSettings {
    /// Validated format; non-conforming settings fail closed here
    pub fn to_format(&self) -> CoreResult<AudioFormat> {
        AudioFormat::new(
            self.sample_rate,
            self.channels,
            self.bits_per_sample,
            self.chunk_size,
        )
    }
}

/// One recovery category override
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    pub strategy: String,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_backoff: bool,
    pub fallback_model_path: Option<String>,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        let config = RecoveryConfig::default();
        Self {
            strategy: "retry_with_delay".into(),
            max_attempts: config.max_attempts,
            base_delay_ms: config.base_delay.as_millis() as u64,
            max_delay_ms: config.max_delay.as_millis() as u64,
            exponential_backoff: config.exponential_backoff,
            fallback_model_path: None,
        }
    }
}

fn parse_strategy(name: &str) -> Result<RecoveryStrategy, ConfigError> {
    match name {
        "none" => Ok(RecoveryStrategy::None),
        "retry_immediate" => Ok(RecoveryStrategy::RetryImmediate),
        "retry_with_delay" => Ok(RecoveryStrategy::RetryWithDelay),
        "fallback_model" => Ok(RecoveryStrategy::FallbackModel),
        "skip_stage" => Ok(RecoveryStrategy::SkipStage),
        "restart_pipeline" => Ok(RecoveryStrategy::RestartPipeline),
        "notify_client_only" => Ok(RecoveryStrategy::NotifyClientOnly),
        other => Err(ConfigError::InvalidValue {
            field: "recovery.strategy".into(),
            message: format!("unknown strategy: {other}"),
        }),
    }
}

fn parse_category(name: &str) -> Result<ErrorCategory, ConfigError> {
    match name {
        "websocket" => Ok(ErrorCategory::Websocket),
        "audio_processing" => Ok(ErrorCategory::AudioProcessing),
        "stt" => Ok(ErrorCategory::Stt),
        "translation" => Ok(ErrorCategory::Translation),
        "tts" => Ok(ErrorCategory::Tts),
        "model_loading" => Ok(ErrorCategory::ModelLoading),
        "pipeline" => Ok(ErrorCategory::Pipeline),
        "system" => Ok(ErrorCategory::System),
        other => Err(ConfigError::InvalidValue {
            field: "recovery".into(),
            message: format!("unknown error category: {other}"),
        }),
    }
}

impl RecoverySettings {
    pub fn to_config(&self) -> Result<RecoveryConfig, ConfigError> {
        Ok(RecoveryConfig {
            strategy: parse_strategy(&self.strategy)?,
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            exponential_backoff: self.exponential_backoff,
            fallback_model_path: self.fallback_model_path.clone(),
            custom_action: None,
        })
    }
}

/// Router section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    pub detailed_metrics: bool,
    pub auto_rollback: bool,
    pub auto_rollback_threshold: f32,
    pub retention_hours: i64,
    pub sweep_interval_secs: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        let config = RouterConfig::default();
        Self {
            detailed_metrics: config.detailed_metrics,
            auto_rollback: config.auto_rollback,
            auto_rollback_threshold: config.auto_rollback_threshold,
            retention_hours: config.retention_hours,
            sweep_interval_secs: config.sweep_interval.as_secs(),
        }
    }
}

impl RouterSettings {
    pub fn to_config(&self) -> RouterConfig {
        RouterConfig {
            detailed_metrics: self.detailed_metrics,
            auto_rollback: self.auto_rollback,
            auto_rollback_threshold: self.auto_rollback_threshold,
            retention_hours: self.retention_hours,
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }
}

/// Full backend settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub orchestrator: OrchestratorSettings,
    pub queue: QueueSettings,
    pub audio: AudioSettings,
    /// Per-category recovery overrides, keyed by category name
    pub recovery: HashMap<String, RecoverySettings>,
    pub router: RouterSettings,
}

impl Settings {
    /// Typed per-category recovery overrides
    pub fn recovery_overrides(
        &self,
    ) -> Result<Vec<(ErrorCategory, RecoveryConfig)>, ConfigError> {
        self.recovery
            .iter()
            .map(|(name, settings)| Ok((parse_category(name)?, settings.to_config()?)))
            .collect()
    }
}

/// Load settings from an optional TOML file merged with
/// SPEECHBRIDGE_-prefixed environment variables.
///
/// Nested keys use `__` in the environment, e.g.
/// `SPEECHBRIDGE_ORCHESTRATOR__MAX_CONCURRENT_UTTERANCES=32`.
pub fn load_settings(path: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        if !std::path::Path::new(path).exists() {
            return Err(ConfigError::FileNotFound(path.to_string()));
        }
        builder = builder.add_source(config::File::with_name(path));
    }

    let settings = builder
        .add_source(
            config::Environment::with_prefix("SPEECHBRIDGE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize::<Settings>()?;

    tracing::debug!(
        max_utterances = settings.orchestrator.max_concurrent_utterances,
        workers = settings.queue.workers,
        "settings loaded"
    );
    Ok(settings)
}
