//! Error taxonomy shared by every pipeline component.
//!
//! Categories classify *where* an error belongs (which recovery strategy
//! applies); severity is orthogonal and only affects reporting. Engine
//! failures cross component boundaries as values of these types, never as
//! panics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories used to route failures to a recovery strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transport concerns; only surfaced to the client
    Websocket,
    /// Ingestion or format conversion failure
    AudioProcessing,
    /// Speech-to-text engine failure
    Stt,
    /// Machine translation engine failure
    Translation,
    /// Text-to-speech engine failure
    Tts,
    /// Unable to initialize an engine
    ModelLoading,
    /// Invariant violation or orchestration bug
    Pipeline,
    /// Anything else, including resource exhaustion
    System,
}

impl ErrorCategory {
    /// Stable name for logs and per-category statistics keys
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Websocket => "websocket",
            ErrorCategory::AudioProcessing => "audio_processing",
            ErrorCategory::Stt => "stt",
            ErrorCategory::Translation => "translation",
            ErrorCategory::Tts => "tts",
            ErrorCategory::ModelLoading => "model_loading",
            ErrorCategory::Pipeline => "pipeline",
            ErrorCategory::System => "system",
        }
    }
}

/// Severity levels, orthogonal to category
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Structured error information handed to the recovery controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Unique id for correlating log lines and client notifications
    pub id: uuid::Uuid,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    /// Human-readable message, safe to forward to the client
    pub message: String,
    /// Additional detail for operators (engine output, etc.)
    pub details: String,
    /// Session the error occurred in, if known
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorInfo {
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            category,
            severity,
            message: message.into(),
            details: String::new(),
            session_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Errors surfaced across component boundaries
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("STT error: {0}")]
    Stt(String),

    #[error("Translation error: {0}")]
    Translation(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Model loading error: {0}")]
    ModelLoading(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Not initialized")]
    NotInitialized,

    #[error("Unknown utterance: {0}")]
    UnknownUtterance(u64),

    #[error("System error: {0}")]
    System(String),
}

impl Error {
    /// Recovery category this error maps to
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Stt(_) => ErrorCategory::Stt,
            Error::Translation(_) => ErrorCategory::Translation,
            Error::Tts(_) => ErrorCategory::Tts,
            Error::ModelLoading(_) | Error::NotInitialized => ErrorCategory::ModelLoading,
            Error::Audio(_) => ErrorCategory::AudioProcessing,
            Error::Pipeline(_) | Error::UnknownUtterance(_) => ErrorCategory::Pipeline,
            Error::ShuttingDown | Error::System(_) => ErrorCategory::System,
        }
    }

    /// Build the structured info record for this error
    pub fn to_info(&self, severity: ErrorSeverity) -> ErrorInfo {
        ErrorInfo::new(self.category(), severity, self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
