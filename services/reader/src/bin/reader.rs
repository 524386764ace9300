//! services/reader/src/bin/reader.rs

use clap::Parser;
use reader_lib::{
    adapters::{HttpChunkSource, LogSessionSink, SimulatedClock, WsTransport},
    channel::DuplexChannel,
    config::Config,
    error::ReaderError,
    session::{SessionNotification, SessionOrchestrator, SessionPorts},
    streaming::StreamBuffer,
};
use reading_session_core::domain::ReadingState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "reader")]
#[command(about = "Reads a passage aloud through a reading-session server")]
#[command(long_about = "
Reads a passage with word-level highlighting, answering checkpoints and
questions through the reading-session server.

While reading, type on stdin:
  p             pause
  r             resume
  ?<question>   ask about the current text
  <answer>      answer the open checkpoint
")]
struct Args {
    /// Text file containing the passage to read.
    passage: PathBuf,

    /// Playback clock resolution in milliseconds.
    #[arg(long, default_value = "100")]
    tick_ms: u64,

    /// Playback speed, between 0.5 and 2.0.
    #[arg(long, default_value = "1.0")]
    speed: f32,
}

#[tokio::main]
async fn main() -> Result<(), ReaderError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let args = Args::parse();
    let config = Config::from_env()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting reader...");

    let passage = tokio::fs::read_to_string(&args.passage).await?;
    info!(
        path = %args.passage.display(),
        words = passage.split_whitespace().count(),
        "Passage loaded."
    );

    // --- 2. Connect the Control Channel ---
    let channel = DuplexChannel::new(
        Arc::new(WsTransport::new(config.server_ws_url.clone())),
        config.channel.clone(),
    );
    channel.connect().await?;

    // --- 3. Initialize Streaming & Playback ---
    let source = Arc::new(HttpChunkSource::new(config.channel.request_timeout)?);
    let buffer = StreamBuffer::new(source, config.buffer.clone());
    let clock = Arc::new(SimulatedClock::new());

    let orchestrator = SessionOrchestrator::new(
        channel.clone(),
        buffer.clone(),
        SessionPorts {
            playback: clock.clone(),
            sink: Arc::new(LogSessionSink),
            speech: None,
        },
        config.session.clone(),
    );
    let _log = orchestrator.on(log_notification);

    // --- 4. Read ---
    orchestrator.set_playback_speed(args.speed);
    let outcome = match orchestrator.start_reading(&passage).await {
        Ok(()) => drive(&orchestrator, &buffer, &clock, Duration::from_millis(args.tick_ms)).await,
        Err(e) => Err(e.into()),
    };

    // --- 5. Tear Down ---
    orchestrator.shutdown().await;
    channel.disconnect();
    info!("Reader stopped.");
    outcome
}

fn log_notification(notification: &SessionNotification) {
    match notification {
        SessionNotification::StateChanged(state) => debug!(%state, "State changed."),
        SessionNotification::WordHighlighted { index, word } => debug!(index, word = %word, "Highlight."),
        SessionNotification::CheckpointReached(checkpoint) => info!(
            kind = checkpoint.kind.as_str(),
            "Checkpoint: {} (type your answer)",
            checkpoint.question
        ),
        SessionNotification::InterruptionAcknowledged(ack) => info!(
            estimate = ?ack.processing_estimate,
            "Question received; waiting for the answer."
        ),
        SessionNotification::InterruptionResponse(response) => {
            info!("Answer: {} (type 'r' to resume)", response.response_text);
            for suggestion in &response.suggestions {
                info!("  - {}", suggestion);
            }
        }
        SessionNotification::ChunkFailed { sequence_number } => {
            warn!(sequence_number, "Audio chunk failed to load.")
        }
        SessionNotification::Error(message) => error!("{}", message),
        SessionNotification::Ended => info!("Finished reading."),
    }
}

/// Feeds the simulated clock into the session and stdin commands into the
/// orchestrator until the passage ends, the session fails, or Ctrl-C.
async fn drive(
    orchestrator: &SessionOrchestrator,
    buffer: &StreamBuffer,
    clock: &SimulatedClock,
    tick: Duration,
) -> Result<(), ReaderError> {
    let mut ticker = tokio::time::interval(tick);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut playing_chunk = None;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl-C received; shutting down.");
                return Ok(());
            }
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) => handle_command(orchestrator, line.trim()),
                None => stdin_open = false,
            },
            _ = ticker.tick() => {
                let position = clock.position();
                orchestrator.on_time_update(position);

                // The player consumes the chunk under the playhead, which moves the
                // buffer's frontier and keeps prefetching ahead of it.
                if let Some(metadata) = buffer.metadata() {
                    let chunk = metadata.chunk_index_at(position);
                    if clock.is_playing() && playing_chunk != Some(chunk) {
                        playing_chunk = Some(chunk);
                        if let Err(e) = buffer.get_chunk(chunk).await {
                            warn!(chunk, "Playback is waiting on audio: {}", e);
                            playing_chunk = None;
                        }
                    }
                }

                let state = orchestrator.snapshot();
                match state.reading_state {
                    ReadingState::Ended => return Ok(()),
                    ReadingState::Idle => {
                        let reason = state.last_error.unwrap_or_else(|| "session stopped".to_string());
                        return Err(ReaderError::Aborted(reason));
                    }
                    _ => {}
                }
            }
        }
    }
}

fn handle_command(orchestrator: &SessionOrchestrator, line: &str) {
    if line.is_empty() {
        return;
    }
    match orchestrator.snapshot().reading_state {
        ReadingState::Checkpoint => {
            orchestrator.submit_checkpoint_answer(line);
            orchestrator.resume_reading();
        }
        _ if line == "p" => orchestrator.pause_reading(),
        _ if line == "r" => orchestrator.resume_reading(),
        _ => match line.strip_prefix('?') {
            Some(question) => orchestrator.interrupt("question", Some(question.trim())),
            None => debug!(line, "Ignoring input."),
        },
    }
}
