//! Deterministic simulation fallbacks
//!
//! When an engine is absent or not initialized the orchestrator substitutes
//! deterministic placeholder output so downstream stages stay exercisable.

use speechbridge_core::UtteranceId;

/// Confidence reported for simulated transcripts
pub const SIMULATED_CONFIDENCE: f32 = 0.85;

/// Placeholder transcript used when no STT engine can run
pub fn simulated_transcript(id: UtteranceId) -> String {
    format!("Simulated transcription for utterance {id}")
}

/// Placeholder translation used when no MT engine can run
pub fn simulated_translation(transcript: &str, source: &str, target: &str) -> String {
    if source.is_empty() || target.is_empty() {
        format!("Simulated translation of \"{transcript}\"")
    } else {
        format!("Simulated translation of \"{transcript}\" from {source} to {target}")
    }
}

/// Placeholder synthesized audio used when no TTS engine can run.
///
/// Size scales with the text length; the byte pattern is a fixed function of
/// the position and utterance id so tests can assert on it.
pub fn simulated_audio(id: UtteranceId, translation: &str) -> Vec<u8> {
    let size = 1024 + translation.len() * 50;
    (0..size)
        .map(|i| ((i as u64 * 7 + id * 13) % 256) as u8)
        .collect()
}
