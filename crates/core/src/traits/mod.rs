//! Engine capability traits consumed by the orchestrator
//!
//! Each stage of the pipeline is abstracted behind one trait so backends
//! (native library, subprocess, network service) stay interchangeable.

pub mod mt;
pub mod stt;
pub mod tts;

pub use mt::{Translation, Translator};
pub use stt::{SpeechToText, Transcription};
pub use tts::{SpeechSynthesizer, Synthesis};
