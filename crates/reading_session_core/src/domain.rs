//! crates/reading_session_core/src/domain.rs
//!
//! Defines the pure, core data structures of a reading session.
//! These structs are independent of any transport or serialization format.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

//=========================================================================================
// Duplex Messaging Channel
//=========================================================================================

/// Connection state of the duplex messaging channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

//=========================================================================================
// Chunked Audio Streaming
//=========================================================================================

/// Description of an audio stream, fetched once when the stream starts.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMetadata {
    pub stream_id: String,
    pub total_duration_secs: f64,
    pub total_chunks: u32,
    pub chunk_duration_secs: f64,
    pub format: String,
    pub sample_rate: u32,
    /// Bits per second.
    pub bitrate: u32,
    pub channels: u16,
}

/// Structural problems that make a stream unusable.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetadataError {
    #[error("stream must contain at least one chunk")]
    NoChunks,
    #[error("chunk duration must be positive, got {0}")]
    InvalidChunkDuration(f64),
}

impl StreamMetadata {
    pub fn validate(&self) -> Result<(), MetadataError> {
        if self.total_chunks < 1 {
            return Err(MetadataError::NoChunks);
        }
        if !(self.chunk_duration_secs > 0.0) {
            return Err(MetadataError::InvalidChunkDuration(self.chunk_duration_secs));
        }
        Ok(())
    }

    /// Size in bytes of one full chunk, used for range addressing.
    pub fn chunk_size_bytes(&self) -> u64 {
        ((self.bitrate as f64 / 8.0) * self.chunk_duration_secs).ceil() as u64
    }

    /// Inclusive byte range `[n * size, (n + 1) * size - 1]` of chunk `n`.
    pub fn chunk_byte_range(&self, sequence_number: u32) -> Option<(u64, u64)> {
        let size = self.chunk_size_bytes();
        if size == 0 {
            return None;
        }
        let start = sequence_number as u64 * size;
        Some((start, start + size - 1))
    }

    pub fn chunk_start_time(&self, sequence_number: u32) -> f64 {
        sequence_number as f64 * self.chunk_duration_secs
    }

    /// Duration of chunk `n`; the final chunk may be shorter than the rest.
    pub fn chunk_duration(&self, sequence_number: u32) -> f64 {
        let start = self.chunk_start_time(sequence_number);
        let remaining = (self.total_duration_secs - start).max(0.0);
        if self.total_duration_secs > 0.0 {
            self.chunk_duration_secs.min(remaining)
        } else {
            self.chunk_duration_secs
        }
    }

    /// The chunk that contains playback time `t`, clamped to the stream.
    pub fn chunk_index_at(&self, t: f64) -> u32 {
        if !(t > 0.0) || self.total_chunks == 0 {
            return 0;
        }
        let index = (t / self.chunk_duration_secs).floor() as u64;
        index.min(self.total_chunks as u64 - 1) as u32
    }
}

/// A fixed-duration slice of audio, never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub sequence_number: u32,
    pub start_time: f64,
    pub duration: f64,
    pub size: usize,
    pub data: Bytes,
}

/// Coarse classification of how much contiguous audio is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferHealth {
    Empty,
    Low,
    Good,
    Full,
}

/// Derived view of the look-ahead buffer. Always recomputed, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferState {
    /// Contiguous sequence numbers starting right after the last played chunk.
    pub buffered_chunks: Vec<u32>,
    pub buffered_duration_secs: f64,
    pub health: BufferHealth,
    pub is_buffering: bool,
    /// 0 to 100.
    pub progress: f64,
}

impl BufferState {
    pub fn empty() -> Self {
        Self {
            buffered_chunks: Vec::new(),
            buffered_duration_secs: 0.0,
            health: BufferHealth::Empty,
            is_buffering: false,
            progress: 0.0,
        }
    }
}

//=========================================================================================
// Reading Session
//=========================================================================================

/// The time range during which a word is highlighted.
#[derive(Debug, Clone, PartialEq)]
pub struct WordTiming {
    pub word: String,
    pub start_time: f64,
    pub end_time: f64,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingState {
    Idle,
    Loading,
    Reading,
    Paused,
    Interrupted,
    Checkpoint,
    Ended,
}

impl ReadingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Reading => "reading",
            Self::Paused => "paused",
            Self::Interrupted => "interrupted",
            Self::Checkpoint => "checkpoint",
            Self::Ended => "ended",
        }
    }
}

impl fmt::Display for ReadingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    Vocabulary,
    Comprehension,
    Prediction,
}

impl CheckpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vocabulary => "vocabulary",
            Self::Comprehension => "comprehension",
            Self::Prediction => "prediction",
        }
    }
}

impl FromStr for CheckpointKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vocabulary" => Ok(Self::Vocabulary),
            "comprehension" => Ok(Self::Comprehension),
            "prediction" => Ok(Self::Prediction),
            other => Err(format!("unknown checkpoint type '{}'", other)),
        }
    }
}

/// A server-injected comprehension question bound to a word position.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub id: String,
    pub position: usize,
    pub kind: CheckpointKind,
    pub question: String,
    pub user_answer: Option<String>,
    pub is_correct: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

/// A student-initiated pause-and-ask.
#[derive(Debug, Clone, PartialEq)]
pub struct Interruption {
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub word_index: Option<usize>,
    pub context: String,
    pub user_input: Option<String>,
}

/// The complete state of one reading session.
///
/// Owned by the session orchestrator; everyone else sees cloned snapshots.
/// The passage and timings are shared behind `Arc` so snapshots stay cheap.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub session_id: Option<String>,
    pub passage_text: Arc<str>,
    /// `None` until the first word is highlighted.
    pub current_word_index: Option<usize>,
    pub current_audio_time: f64,
    pub reading_state: ReadingState,
    pub word_timings: Arc<[WordTiming]>,
    /// Checkpoints that have fired, in order.
    pub checkpoints: Vec<Checkpoint>,
    /// Checkpoints received ahead of their word position.
    pub upcoming_checkpoints: Vec<Checkpoint>,
    pub pending_interruption: Option<Interruption>,
    pub interruptions: Vec<Interruption>,
    pub stream_url: Option<String>,
    pub playback_rate: f32,
    /// Running on locally synthesized audio because the server never acknowledged the start.
    pub degraded: bool,
    pub last_error: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            session_id: None,
            passage_text: Arc::from(""),
            current_word_index: None,
            current_audio_time: 0.0,
            reading_state: ReadingState::Idle,
            word_timings: Arc::from(Vec::new()),
            checkpoints: Vec::new(),
            upcoming_checkpoints: Vec::new(),
            pending_interruption: None,
            interruptions: Vec::new(),
            stream_url: None,
            playback_rate: 1.0,
            degraded: false,
            last_error: None,
        }
    }
}

/// What the persistence/analytics sink receives when a session is torn down.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: Option<String>,
    pub passage_word_count: usize,
    pub words_read: usize,
    pub final_state: ReadingState,
    pub checkpoints: Vec<Checkpoint>,
    pub interruptions: Vec<Interruption>,
    pub degraded: bool,
    pub finished_at: DateTime<Utc>,
}

impl SessionSummary {
    pub fn from_state(state: &SessionState) -> Self {
        Self {
            session_id: state.session_id.clone(),
            passage_word_count: crate::timing::passage_words(&state.passage_text).len(),
            words_read: state.current_word_index.map_or(0, |i| i + 1),
            final_state: state.reading_state,
            checkpoints: state.checkpoints.clone(),
            interruptions: state.interruptions.clone(),
            degraded: state.degraded,
            finished_at: Utc::now(),
        }
    }
}

//=========================================================================================
// Text-to-Speech
//=========================================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOptions {
    pub voice: Option<String>,
    pub rate: f32,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            voice: None,
            rate: 1.0,
        }
    }
}

/// Result of synthesizing a passage: where the audio lives and when each word is spoken.
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub audio_url: String,
    pub duration_secs: f64,
    pub word_timings: Vec<WordTiming>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(total_chunks: u32) -> StreamMetadata {
        StreamMetadata {
            stream_id: "s1".to_string(),
            total_duration_secs: 117.5,
            total_chunks,
            chunk_duration_secs: 5.0,
            format: "mp3".to_string(),
            sample_rate: 24_000,
            bitrate: 128_000,
            channels: 1,
        }
    }

    #[test]
    fn metadata_without_chunks_is_rejected() {
        assert_eq!(metadata(0).validate(), Err(MetadataError::NoChunks));
        assert!(metadata(24).validate().is_ok());
    }

    #[test]
    fn byte_range_follows_chunk_size() {
        let meta = metadata(24);
        assert_eq!(meta.chunk_size_bytes(), 80_000);
        assert_eq!(meta.chunk_byte_range(0), Some((0, 79_999)));
        assert_eq!(meta.chunk_byte_range(2), Some((160_000, 239_999)));
    }

    #[test]
    fn last_chunk_is_shorter() {
        let meta = metadata(24);
        assert_eq!(meta.chunk_duration(0), 5.0);
        assert!((meta.chunk_duration(23) - 2.5).abs() < 1e-9);
        assert_eq!(meta.chunk_index_at(12.0), 2);
        assert_eq!(meta.chunk_index_at(1_000.0), 23);
        assert_eq!(meta.chunk_index_at(-3.0), 0);
    }
}
