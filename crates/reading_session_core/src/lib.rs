pub mod domain;
pub mod ports;
pub mod timing;

pub use domain::{
    BufferHealth, BufferState, ChannelState, Checkpoint, CheckpointKind, Chunk, Interruption,
    ReadingState, SessionState, SessionSummary, StreamMetadata, Synthesis, SynthesisOptions,
    WordTiming,
};
pub use ports::{
    ChunkSource, FrameSink, FrameStream, MessageTransport, PlaybackDriver, PortError, PortResult,
    SessionSink, TextToSpeechService,
};
pub use timing::{context_window, passage_words, word_index_at};
