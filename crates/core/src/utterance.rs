//! Utterance lifecycle types
//!
//! An utterance is one end-to-end unit of audio → transcript → translation →
//! synthesized audio work. The orchestrator owns the live records; everything
//! else only ever sees cloned snapshots or the integer id.

use std::time::Instant;

/// Process-unique utterance identifier.
///
/// Ids are allocated from a monotonically increasing counter starting at 1
/// and are never reused; 0 is never issued.
pub type UtteranceId = u64;

/// States an utterance moves through while being processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UtteranceState {
    /// Audio is being captured
    Listening,
    /// Speech-to-text in progress
    Transcribing,
    /// Machine translation in progress
    Translating,
    /// Text-to-speech in progress
    Synthesizing,
    /// All processing complete
    Complete,
    /// Processing failed
    Error,
}

impl UtteranceState {
    /// Position in the forward progression; Error sits outside the order
    fn order(&self) -> Option<u8> {
        match self {
            UtteranceState::Listening => Some(0),
            UtteranceState::Transcribing => Some(1),
            UtteranceState::Translating => Some(2),
            UtteranceState::Synthesizing => Some(3),
            UtteranceState::Complete => Some(4),
            UtteranceState::Error => None,
        }
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// Legal transitions: forward along LISTENING → TRANSCRIBING →
    /// TRANSLATING → SYNTHESIZING → COMPLETE, any state → ERROR, and
    /// ERROR back into one of the three processing states (recovery).
    /// A same-state "transition" is a refresh and always allowed.
    pub fn can_transition_to(&self, next: UtteranceState) -> bool {
        if *self == next {
            return true;
        }
        if next == UtteranceState::Error {
            return true;
        }
        match (self.order(), next.order()) {
            (Some(from), Some(to)) => to > from,
            // Error -> processing states only
            (None, Some(_)) => matches!(
                next,
                UtteranceState::Transcribing
                    | UtteranceState::Translating
                    | UtteranceState::Synthesizing
            ),
            _ => false,
        }
    }

    /// Complete or Error: no further processing will happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, UtteranceState::Complete | UtteranceState::Error)
    }

    /// One of the three engine-driven stages
    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            UtteranceState::Transcribing
                | UtteranceState::Translating
                | UtteranceState::Synthesizing
        )
    }

    /// Stable name for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            UtteranceState::Listening => "listening",
            UtteranceState::Transcribing => "transcribing",
            UtteranceState::Translating => "translating",
            UtteranceState::Synthesizing => "synthesizing",
            UtteranceState::Complete => "complete",
            UtteranceState::Error => "error",
        }
    }
}

impl std::fmt::Display for UtteranceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Utterance data.
///
/// The orchestrator stores the live record; callbacks and getters receive
/// clones, so holding onto one never blocks the pipeline.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub id: UtteranceId,
    pub session_id: String,
    pub state: UtteranceState,
    pub created_at: Instant,
    pub last_updated: Instant,

    /// Normalized mono 16 kHz samples in [-1.0, 1.0]
    pub audio_buffer: Vec<f32>,

    // Processing results
    pub transcript: String,
    pub transcript_confidence: f32,
    pub translation: String,
    pub synthesized_audio: Vec<u8>,

    /// Non-empty iff `state == Error`
    pub error_message: String,

    // Language configuration, mutable until transcription begins
    pub source_language: String,
    pub target_language: String,
    pub voice_id: String,
}

impl Utterance {
    pub fn new(id: UtteranceId, session_id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            id,
            session_id: session_id.into(),
            state: UtteranceState::Listening,
            created_at: now,
            last_updated: now,
            audio_buffer: Vec::new(),
            transcript: String::new(),
            transcript_confidence: 0.0,
            translation: String::new(),
            synthesized_audio: Vec::new(),
            error_message: String::new(),
            source_language: String::new(),
            target_language: String::new(),
            voice_id: String::new(),
        }
    }

    /// Wall time spent between creation and the last update
    pub fn processing_time(&self) -> std::time::Duration {
        self.last_updated.duration_since(self.created_at)
    }
}
