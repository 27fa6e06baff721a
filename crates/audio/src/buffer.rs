//! Bounded ring of timestamped audio chunks
//!
//! The ring caps the PCM byte footprint buffered per session. On overflow
//! the oldest chunks are evicted down to 75% of the cap before the new
//! chunk is appended; a chunk that alone exceeds the cap is rejected.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::format::BYTES_PER_SAMPLE;
use crate::IngestError;

/// One validated chunk of normalized audio
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono 16 kHz samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Monotonic timestamp taken at conversion
    pub timestamp: Instant,
    /// Per-session sequence number
    pub sequence: u64,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sequence: u64) -> Self {
        Self {
            samples,
            timestamp: Instant::now(),
            sequence,
        }
    }

    /// PCM byte footprint used for ring accounting
    pub fn byte_size(&self) -> usize {
        self.samples.len() * BYTES_PER_SAMPLE
    }
}

struct RingInner {
    chunks: VecDeque<AudioChunk>,
    occupancy_bytes: usize,
}

/// Thread-safe bounded FIFO of audio chunks
pub struct ChunkRing {
    inner: Mutex<RingInner>,
    cap_bytes: usize,
}

impl ChunkRing {
    /// Default byte cap: 1 MiB per session
    pub const DEFAULT_CAP_BYTES: usize = 1024 * 1024;

    pub fn new(cap_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                chunks: VecDeque::new(),
                occupancy_bytes: 0,
            }),
            cap_bytes,
        }
    }

    /// Append a chunk, evicting oldest chunks on overflow.
    ///
    /// Returns the number of chunks evicted to make room. A chunk whose own
    /// footprint exceeds the cap is rejected with `BufferFull`.
    pub fn push(&self, chunk: AudioChunk) -> Result<usize, IngestError> {
        let size = chunk.byte_size();
        if size > self.cap_bytes {
            tracing::warn!(
                chunk_bytes = size,
                cap_bytes = self.cap_bytes,
                "chunk exceeds ring capacity, dropping"
            );
            return Err(IngestError::BufferFull);
        }

        let mut inner = self.inner.lock();
        let mut evicted = 0;
        if inner.occupancy_bytes + size > self.cap_bytes {
            // Evict down to 75% of the cap before appending
            let target = self.cap_bytes * 3 / 4;
            while inner.occupancy_bytes > target {
                if let Some(old) = inner.chunks.pop_front() {
                    inner.occupancy_bytes -= old.byte_size();
                    evicted += 1;
                } else {
                    break;
                }
            }
        }

        inner.occupancy_bytes += size;
        inner.chunks.push_back(chunk);
        Ok(evicted)
    }

    /// All buffered samples in FIFO order
    pub fn all_samples(&self) -> Vec<f32> {
        let inner = self.inner.lock();
        let total: usize = inner.chunks.iter().map(|c| c.samples.len()).sum();
        let mut out = Vec::with_capacity(total);
        for chunk in &inner.chunks {
            out.extend_from_slice(&chunk.samples);
        }
        out
    }

    /// The most recent `count` samples in FIFO order; everything if fewer
    /// are buffered.
    pub fn recent_samples(&self, count: usize) -> Vec<f32> {
        let mut all = self.all_samples();
        if all.len() > count {
            all.drain(..all.len() - count);
        }
        all
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.chunks.clear();
        inner.occupancy_bytes = 0;
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    pub fn total_samples(&self) -> usize {
        self.inner.lock().chunks.iter().map(|c| c.samples.len()).sum()
    }

    pub fn occupancy_bytes(&self) -> usize {
        self.inner.lock().occupancy_bytes
    }

    pub fn cap_bytes(&self) -> usize {
        self.cap_bytes
    }

    /// Occupancy as a fraction of the cap, in [0.0, 1.0] for steady state
    pub fn utilization(&self) -> f64 {
        self.inner.lock().occupancy_bytes as f64 / self.cap_bytes as f64
    }

    /// Timestamp span between the oldest and newest buffered chunks
    pub fn duration(&self) -> Duration {
        let inner = self.inner.lock();
        match (inner.chunks.front(), inner.chunks.back()) {
            (Some(oldest), Some(newest)) => {
                newest.timestamp.duration_since(oldest.timestamp)
            }
            _ => Duration::ZERO,
        }
    }
}
