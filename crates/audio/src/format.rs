//! Audio format validation and PCM conversion
//!
//! The backend accepts exactly one input format: mono little-endian signed
//! 16-bit PCM at 16 kHz. Anything else fails closed at construction.

use speechbridge_core::{Error, Result};

/// Bytes per 16-bit PCM sample
pub const BYTES_PER_SAMPLE: usize = 2;

/// Validated audio format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Samples per chunk the ingestion pipeline splits input into
    pub chunk_size: u32,
}

impl AudioFormat {
    pub const REQUIRED_SAMPLE_RATE: u32 = 16_000;
    pub const REQUIRED_CHANNELS: u16 = 1;
    pub const REQUIRED_BITS: u16 = 16;
    pub const MAX_CHUNK_SIZE: u32 = 8192;

    /// Construct a format, rejecting anything the pipeline cannot process
    pub fn new(sample_rate: u32, channels: u16, bits_per_sample: u16, chunk_size: u32) -> Result<Self> {
        if sample_rate != Self::REQUIRED_SAMPLE_RATE {
            return Err(Error::Audio(format!(
                "invalid sample rate: {sample_rate} (expected {})",
                Self::REQUIRED_SAMPLE_RATE
            )));
        }
        if channels != Self::REQUIRED_CHANNELS {
            return Err(Error::Audio(format!(
                "invalid channel count: {channels} (expected {})",
                Self::REQUIRED_CHANNELS
            )));
        }
        if bits_per_sample != Self::REQUIRED_BITS {
            return Err(Error::Audio(format!(
                "invalid bits per sample: {bits_per_sample} (expected {})",
                Self::REQUIRED_BITS
            )));
        }
        if chunk_size == 0 || chunk_size > Self::MAX_CHUNK_SIZE {
            return Err(Error::Audio(format!(
                "invalid chunk size: {chunk_size} (expected 1-{})",
                Self::MAX_CHUNK_SIZE
            )));
        }
        Ok(Self {
            sample_rate,
            channels,
            bits_per_sample,
            chunk_size,
        })
    }

    /// Byte length of one full chunk of input PCM
    pub fn chunk_size_bytes(&self) -> usize {
        self.chunk_size as usize * self.channels as usize * BYTES_PER_SAMPLE
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: Self::REQUIRED_SAMPLE_RATE,
            channels: Self::REQUIRED_CHANNELS,
            bits_per_sample: Self::REQUIRED_BITS,
            chunk_size: 1024,
        }
    }
}

/// Convert little-endian signed 16-bit PCM bytes to normalized floats.
///
/// The byte length must be a multiple of 2.
pub fn pcm_to_samples(pcm: &[u8]) -> Result<Vec<f32>> {
    if pcm.len() % BYTES_PER_SAMPLE != 0 {
        return Err(Error::Audio(
            "PCM byte length is not a multiple of 2".into(),
        ));
    }

    let samples = pcm
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect();

    Ok(samples)
}

/// Convert normalized floats back to signed 16-bit PCM samples.
///
/// Inputs are clamped to [-1.0, 1.0], scaled by 32767, and rounded to the
/// nearest integer.
pub fn samples_to_pcm(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0).round() as i16)
        .collect()
}
