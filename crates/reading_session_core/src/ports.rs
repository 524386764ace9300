//! crates/reading_session_core/src/ports.rs
//!
//! Defines the service contracts (traits) the reading-session engine talks through.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific transports, players or speech providers.

use crate::domain::{SessionSummary, StreamMetadata, Synthesis, SynthesisOptions};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, Stream};
use std::pin::Pin;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., sockets, HTTP).
#[derive(Debug, Clone, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Transport failure: {0}")]
    Transport(String),
    #[error("Malformed data: {0}")]
    Decode(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

/// Text frames arriving from the server. The stream ending means the connection closed.
pub type FrameStream = Pin<Box<dyn Stream<Item = PortResult<String>> + Send>>;

/// Text frames going to the server.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = PortError> + Send>>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

/// A long-lived bidirectional text connection (WebSocket, long polling, in-memory...).
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Establishes one connection and returns its two halves.
    async fn open(&self) -> PortResult<(FrameSink, FrameStream)>;
}

/// Request/response access to a chunked audio stream.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn fetch_metadata(&self, stream_url: &str) -> PortResult<StreamMetadata>;

    /// Fetches the raw bytes of one chunk, addressed by sequence number.
    async fn fetch_chunk(
        &self,
        stream_url: &str,
        metadata: &StreamMetadata,
        sequence_number: u32,
    ) -> PortResult<Bytes>;
}

/// The audio player. Its clock drives the session through time updates; these
/// commands only steer it.
pub trait PlaybackDriver: Send + Sync {
    fn load(&self, stream_url: &str, metadata: &StreamMetadata);
    fn pause(&self);
    fn resume(&self);
    fn stop(&self);
    fn seek(&self, time_secs: f64);
    fn set_rate(&self, rate: f32);
}

#[async_trait]
pub trait TextToSpeechService: Send + Sync {
    /// Synthesizes a passage and reports when each word is spoken.
    async fn synthesize(&self, text: &str, options: &SynthesisOptions) -> PortResult<Synthesis>;
}

#[async_trait]
pub trait SessionSink: Send + Sync {
    /// Records a finished session for history and analytics.
    async fn save_session(&self, summary: SessionSummary) -> PortResult<()>;
}
