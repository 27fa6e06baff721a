//! Per-session audio ingestion
//!
//! One `SessionIngestion` exists per connected client for the lifetime of
//! its session. It validates incoming PCM, splits it into chunks, and feeds
//! the bounded ring the orchestrator reads from.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::buffer::{AudioChunk, ChunkRing};
use crate::format::{pcm_to_samples, AudioFormat, BYTES_PER_SAMPLE};
use crate::IngestError;

/// Running ingestion statistics for one session
#[derive(Debug, Clone)]
pub struct IngestStats {
    pub bytes_ingested: u64,
    pub chunks_ingested: u64,
    pub chunks_dropped: u64,
    /// Mean PCM byte size of ingested chunks
    pub average_chunk_bytes: f64,
    /// Ring occupancy as a fraction of its cap
    pub buffer_utilization: f64,
    pub last_activity: Instant,
}

/// Per-session ingestion state: active flag, ring, statistics, last error
pub struct SessionIngestion {
    session_id: String,
    format: AudioFormat,
    ring: ChunkRing,
    active: AtomicBool,
    next_sequence: AtomicU64,
    bytes_ingested: AtomicU64,
    chunks_ingested: AtomicU64,
    chunks_dropped: AtomicU64,
    last_activity: Mutex<Instant>,
    last_error: Mutex<Option<IngestError>>,
}

impl SessionIngestion {
    pub fn new(session_id: impl Into<String>, format: AudioFormat, ring_cap_bytes: usize) -> Self {
        let session_id = session_id.into();
        tracing::info!("Audio ingestion created for session: {}", session_id);
        Self {
            session_id,
            format,
            ring: ChunkRing::new(ring_cap_bytes),
            active: AtomicBool::new(true),
            next_sequence: AtomicU64::new(0),
            bytes_ingested: AtomicU64::new(0),
            chunks_ingested: AtomicU64::new(0),
            chunks_dropped: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            last_error: Mutex::new(None),
        }
    }

    /// Create with the default 1 MiB ring
    pub fn with_default_ring(session_id: impl Into<String>, format: AudioFormat) -> Self {
        Self::new(session_id, format, ChunkRing::DEFAULT_CAP_BYTES)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn ring(&self) -> &ChunkRing {
        &self.ring
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop accepting audio; buffered chunks stay readable
    pub fn close(&self) {
        self.active.store(false, Ordering::Release);
        tracing::info!("Audio ingestion closed for session: {}", self.session_id);
    }

    /// Ingest a slice of little-endian signed 16-bit PCM bytes.
    ///
    /// The input is split into chunks of `chunk_size * 2` bytes (a final
    /// short chunk is permitted) and appended to the ring. Returns the number
    /// of chunks appended. Empty input succeeds and appends nothing.
    pub fn ingest(&self, bytes: &[u8]) -> Result<usize, IngestError> {
        if !self.is_active() {
            return Err(self.fail(IngestError::Inactive));
        }
        if bytes.len() % BYTES_PER_SAMPLE != 0 {
            return Err(self.fail(IngestError::InvalidFormat));
        }

        self.touch();
        if bytes.is_empty() {
            *self.last_error.lock() = None;
            return Ok(0);
        }

        let chunk_bytes = self.format.chunk_size_bytes();
        let mut appended = 0usize;
        let mut dropped = 0usize;

        for piece in bytes.chunks(chunk_bytes) {
            // Piece lengths are even: chunk_bytes is even and so is the input
            let samples = pcm_to_samples(piece).map_err(|_| self.fail(IngestError::Processing))?;
            let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            let chunk = AudioChunk::new(samples, sequence);

            match self.ring.push(chunk) {
                Ok(_evicted) => {
                    appended += 1;
                    self.bytes_ingested
                        .fetch_add(piece.len() as u64, Ordering::Relaxed);
                    self.chunks_ingested.fetch_add(1, Ordering::Relaxed);
                }
                Err(IngestError::BufferFull) => {
                    dropped += 1;
                    self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(other) => return Err(self.fail(other)),
            }
        }

        if dropped > 0 {
            tracing::warn!(
                session_id = %self.session_id,
                dropped,
                "ingestion dropped chunks on full buffer"
            );
            return Err(self.fail(IngestError::BufferFull));
        }

        *self.last_error.lock() = None;
        Ok(appended)
    }

    /// Last `count` buffered samples in FIFO order
    pub fn recent_samples(&self, count: usize) -> Vec<f32> {
        self.ring.recent_samples(count)
    }

    /// Most recent error observed by this session, if any
    pub fn last_error(&self) -> Option<IngestError> {
        *self.last_error.lock()
    }

    pub fn statistics(&self) -> IngestStats {
        let bytes = self.bytes_ingested.load(Ordering::Relaxed);
        let chunks = self.chunks_ingested.load(Ordering::Relaxed);
        IngestStats {
            bytes_ingested: bytes,
            chunks_ingested: chunks,
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            average_chunk_bytes: if chunks > 0 {
                bytes as f64 / chunks as f64
            } else {
                0.0
            },
            buffer_utilization: self.ring.utilization(),
            last_activity: *self.last_activity.lock(),
        }
    }

    pub fn reset_statistics(&self) {
        self.bytes_ingested.store(0, Ordering::Relaxed);
        self.chunks_ingested.store(0, Ordering::Relaxed);
        self.chunks_dropped.store(0, Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn fail(&self, error: IngestError) -> IngestError {
        *self.last_error.lock() = Some(error);
        tracing::warn!(
            session_id = %self.session_id,
            error = %error,
            "ingestion error"
        );
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn session(ring_cap: usize, chunk_size: u32) -> SessionIngestion {
        let format = AudioFormat::new(16_000, 1, 16, chunk_size).unwrap();
        SessionIngestion::new("test-session", format, ring_cap)
    }

    #[test]
    fn test_inactive_session_rejected() {
        let s = session(1024, 128);
        s.close();
        assert_eq!(s.ingest(&pcm_bytes(4)), Err(IngestError::Inactive));
        assert_eq!(s.last_error(), Some(IngestError::Inactive));
    }

    #[test]
    fn test_odd_byte_length_rejected() {
        let s = session(1024, 128);
        assert_eq!(s.ingest(&pcm_bytes(3)), Err(IngestError::InvalidFormat));
        assert_eq!(s.last_error(), Some(IngestError::InvalidFormat));
    }

    #[test]
    fn test_empty_input_produces_zero_chunks() {
        let s = session(1024, 128);
        assert_eq!(s.ingest(&[]).unwrap(), 0);
        let stats = s.statistics();
        assert_eq!(stats.chunks_ingested, 0);
        assert_eq!(stats.chunks_dropped, 0);
        assert!(s.last_error().is_none());
    }

    #[test]
    fn test_exact_chunk_produces_one_chunk() {
        let s = session(1024, 8);
        // chunk_size 8 samples = 16 bytes
        assert_eq!(s.ingest(&pcm_bytes(16)).unwrap(), 1);
        assert_eq!(s.ring().chunk_count(), 1);
        let chunks = s.ring().recent_samples(8);
        assert_eq!(chunks.len(), 8);

        // Sequence numbers advance per chunk
        assert_eq!(s.ingest(&pcm_bytes(16)).unwrap(), 1);
        assert_eq!(s.next_sequence.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_splitting_with_final_short_chunk() {
        let s = session(4096, 8);
        // 40 bytes = 2 full chunks of 16 + one short chunk of 8
        assert_eq!(s.ingest(&pcm_bytes(40)).unwrap(), 3);
        assert_eq!(s.ring().total_samples(), 20);

        let stats = s.statistics();
        assert_eq!(stats.bytes_ingested, 40);
        assert_eq!(stats.chunks_ingested, 3);
        assert!((stats.average_chunk_bytes - 40.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_overflow_evicts_then_admits() {
        // Ring cap 32 bytes; chunk_size large enough that each ingest is one
        // chunk.
        let s = session(32, 1024);
        assert_eq!(s.ingest(&pcm_bytes(16)).unwrap(), 1);
        assert_eq!(s.ingest(&pcm_bytes(16)).unwrap(), 1);
        assert_eq!(s.ring().occupancy_bytes(), 32);

        // 20-byte chunk forces eviction down to <= 24 bytes, then lands
        assert_eq!(s.ingest(&pcm_bytes(20)).unwrap(), 1);
        assert_eq!(s.statistics().chunks_dropped, 0);
    }

    #[test]
    fn test_oversized_chunk_dropped_with_buffer_full() {
        let s = session(32, 1024);
        assert_eq!(s.ingest(&pcm_bytes(40)), Err(IngestError::BufferFull));
        let stats = s.statistics();
        assert_eq!(stats.chunks_dropped, 1);
        assert_eq!(stats.chunks_ingested, 0);
        assert_eq!(s.last_error(), Some(IngestError::BufferFull));
    }

    #[test]
    fn test_successful_ingest_clears_last_error() {
        let s = session(1024, 128);
        let _ = s.ingest(&pcm_bytes(3));
        assert!(s.last_error().is_some());
        s.ingest(&pcm_bytes(4)).unwrap();
        assert!(s.last_error().is_none());
    }

    #[test]
    fn test_utilization_reported() {
        let s = session(64, 1024);
        s.ingest(&pcm_bytes(32)).unwrap();
        let stats = s.statistics();
        assert!((stats.buffer_utilization - 0.5).abs() < 1e-9);
    }
}
