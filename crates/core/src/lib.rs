//! Core traits and types for the speech translation backend
//!
//! This crate provides foundational types used across all other crates:
//! - Engine capability traits (STT, MT, TTS)
//! - Utterance lifecycle types and the state machine
//! - Error taxonomy and structured error info
//! - Callback type aliases

pub mod error;
pub mod traits;
pub mod utterance;

// Re-exports from error module
pub use error::{Error, ErrorCategory, ErrorInfo, ErrorSeverity, Result};

// Re-exports from utterance module
pub use utterance::{Utterance, UtteranceId, UtteranceState};

// Trait re-exports
pub use traits::{
    // STT
    SpeechToText, Transcription,
    // MT
    Translation, Translator,
    // TTS
    SpeechSynthesizer, Synthesis,
};
