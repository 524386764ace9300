//! services/reader/src/error.rs
//!
//! Defines the error types of the reading-session engine.

use crate::config::ConfigError;
use reading_session_core::domain::MetadataError;
use reading_session_core::ports::PortError;
use std::time::Duration;

/// Failures of the duplex messaging channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    /// The transport could not establish a connection.
    #[error("Failed to connect: {0}")]
    Connect(PortError),

    /// No response arrived for the request within its deadline.
    #[error("Request {id} timed out after {timeout:?}")]
    Timeout { id: String, timeout: Duration },

    /// The channel was torn down while the request was pending.
    #[error("Channel closed before a response arrived")]
    Closed,

    /// The server answered the request with an `error` frame.
    #[error("Server error {code}: {message}")]
    Server { code: String, message: String },

    #[error("A request with id {0} is already pending")]
    DuplicateRequest(String),
}

/// Failures of the chunked streaming buffer.
///
/// `Clone` because concurrent waiters on the same chunk share one outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BufferError {
    #[error("No stream is active")]
    NotStarted,

    #[error("Chunk {sequence_number} is outside the stream ({total_chunks} chunks)")]
    OutOfRange { sequence_number: u32, total_chunks: u32 },

    #[error("Invalid stream metadata: {0}")]
    InvalidMetadata(#[from] MetadataError),

    #[error("Failed to fetch {what}: {source}")]
    Fetch { what: String, source: PortError },

    /// The stream was stopped or restarted while the fetch was in flight.
    #[error("Stream was stopped")]
    Cancelled,
}

/// Failures surfaced by the session orchestrator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Stream error: {0}")]
    Stream(#[from] BufferError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Speech synthesis failed: {0}")]
    Synthesis(PortError),

    /// The session failed or was shut down while its start was in flight.
    #[error("Session start abandoned: {0}")]
    Aborted(String),
}

/// The primary error type for the `reader` binary.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Represents an error that propagated up from one of the core service ports.
    #[error("Service Port Error: {0}")]
    Port(#[from] PortError),

    #[error("Channel Error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Session Error: {0}")]
    Session(#[from] SessionError),

    /// Represents a standard Input/Output error (e.g., reading the passage file).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The session fell back to idle on its own, e.g. after losing the server.
    #[error("Reading session aborted: {0}")]
    Aborted(String),
}
