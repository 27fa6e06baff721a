//! Speech-to-Text capability

use async_trait::async_trait;

use crate::Result;

/// Result of transcribing an audio buffer
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    /// Overall confidence in [0.0, 1.0]
    pub confidence: f32,
    /// Partial results may be superseded by a later final result
    pub is_partial: bool,
    /// BCP-47-ish language tag detected from the audio
    pub detected_language: String,
    /// Confidence in the language detection
    pub language_confidence: f32,
    /// Whether `confidence` clears the engine's acceptance threshold
    pub meets_threshold: bool,
    /// Engine-specific quality label ("high", "degraded", ...)
    pub quality_tag: String,
}

impl Transcription {
    /// Final (non-partial) transcription with sensible defaults for the
    /// auxiliary fields.
    pub fn final_text(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            is_partial: false,
            detected_language: String::new(),
            language_confidence: 0.0,
            meets_threshold: true,
            quality_tag: String::new(),
        }
    }
}

/// Speech-to-Text interface
///
/// Input is normalized mono 16 kHz float audio. A call may block for the
/// full duration of inference; callers run it on a pool worker.
///
/// # Example
///
/// ```ignore
/// let stt: Arc<dyn SpeechToText> = Arc::new(WhisperStt::new(config)?);
/// let transcription = stt.transcribe(&samples).await?;
/// println!("Transcribed: {}", transcription.text);
/// ```
#[async_trait]
pub trait SpeechToText: Send + Sync + 'static {
    /// Transcribe a complete audio buffer
    ///
    /// # Arguments
    /// * `samples` - mono 16 kHz samples in [-1.0, 1.0]
    async fn transcribe(&self, samples: &[f32]) -> Result<Transcription>;

    /// Whether the engine has loaded its model and can serve calls
    fn is_initialized(&self) -> bool;

    /// Engine name for logging
    fn engine_name(&self) -> &str {
        "stt"
    }
}
