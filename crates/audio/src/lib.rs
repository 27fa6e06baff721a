//! Audio ingestion pipeline
//!
//! Turns externally-provided PCM byte streams into validated float chunks
//! buffered per client session:
//! - Format validation (mono, 16-bit, 16 kHz) and PCM16 ⇄ f32 conversion
//! - Bounded chunk ring with FIFO eviction
//! - Per-session ingestion state with running statistics

pub mod buffer;
pub mod format;
pub mod ingestion;

pub use buffer::{AudioChunk, ChunkRing};
pub use format::{pcm_to_samples, samples_to_pcm, AudioFormat};
pub use ingestion::{IngestStats, SessionIngestion};

use thiserror::Error;

/// Ingestion failures surfaced to the client per session
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestError {
    #[error("session is not active")]
    Inactive,

    #[error("invalid PCM format")]
    InvalidFormat,

    #[error("audio buffer is full")]
    BufferFull,

    #[error("audio processing error")]
    Processing,
}
