//! services/reader/src/session/orchestrator.rs
//!
//! Owns one reading session. Commands from the caller and messages from the
//! server are turned into `SessionEvent`s, run through the reducer, and the
//! resulting effects are carried out against the channel, the stream buffer
//! and the playback driver.

use crate::channel::{kinds, ChannelEvent, DuplexChannel, Message};
use crate::error::{ChannelError, SessionError};
use crate::events::{Subscribers, Subscription};
use crate::session::protocol::{
    CheckpointAnswerPayload, CheckpointTriggeredPayload, ErrorPayload,
    InterruptionAcknowledgedPayload, InterruptionCreatePayload, InterruptionResponse,
    ProgressPayload, SessionStartPayload, SessionStartedPayload,
};
use crate::session::state::{reduce, Effect, SessionEvent};
use crate::streaming::{BufferEvent, StreamBuffer};
use chrono::Utc;
use parking_lot::{Mutex, ReentrantMutex};
use reading_session_core::domain::{
    Checkpoint, ReadingState, SessionState, SessionSummary, SynthesisOptions,
};
use reading_session_core::ports::{PlaybackDriver, SessionSink, TextToSpeechService};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Period of `progress.update` pushes while reading.
    pub sync_interval: Duration,
    pub context_words_before: usize,
    pub context_words_after: usize,
    /// How long to wait for `session.started` before giving up on the server.
    pub start_timeout: Duration,
    /// Upper bound on handing the session summary to the sink.
    pub teardown_timeout: Duration,
    /// Used when the passage has to be synthesized locally.
    pub synthesis: SynthesisOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(5),
            context_words_before: 10,
            context_words_after: 10,
            start_timeout: Duration::from_secs(10),
            teardown_timeout: Duration::from_secs(5),
            synthesis: SynthesisOptions::default(),
        }
    }
}

/// The collaborators a session drives besides the channel and the buffer.
#[derive(Clone)]
pub struct SessionPorts {
    pub playback: Arc<dyn PlaybackDriver>,
    pub sink: Arc<dyn SessionSink>,
    /// Local speech synthesis for running without a server acknowledgement.
    pub speech: Option<Arc<dyn TextToSpeechService>>,
}

/// What the orchestrator tells the UI layer.
#[derive(Debug, Clone)]
pub enum SessionNotification {
    StateChanged(ReadingState),
    WordHighlighted { index: usize, word: String },
    CheckpointReached(Checkpoint),
    InterruptionAcknowledged(InterruptionAcknowledgedPayload),
    InterruptionResponse(InterruptionResponse),
    ChunkFailed { sequence_number: u32 },
    Error(String),
    Ended,
}

struct OrchestratorInner {
    channel: DuplexChannel,
    buffer: StreamBuffer,
    ports: SessionPorts,
    config: SessionConfig,
    state: Mutex<SessionState>,
    /// Held from commit through the last effect so concurrent dispatches take
    /// effect in the order they were committed. Reentrant because effects may
    /// notify handlers that issue further commands.
    transitions: ReentrantMutex<()>,
    snapshots: watch::Sender<SessionState>,
    notifications: Subscribers<SessionNotification>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    /// Bumped per start attempt and on shutdown so a superseded start does not commit.
    generation: AtomicU64,
    closed: AtomicBool,
}

/// A cheaply cloneable handle to one reading session.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl SessionOrchestrator {
    pub fn new(
        channel: DuplexChannel,
        buffer: StreamBuffer,
        ports: SessionPorts,
        config: SessionConfig,
    ) -> Self {
        let (snapshots, _) = watch::channel(SessionState::default());
        let inner = Arc::new(OrchestratorInner {
            channel,
            buffer,
            ports,
            config,
            state: Mutex::new(SessionState::default()),
            transitions: ReentrantMutex::new(()),
            snapshots,
            notifications: Subscribers::new(),
            sync_task: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        inner.attach();
        Self { inner }
    }

    /// A copy of the current state.
    pub fn snapshot(&self) -> SessionState {
        self.inner.state.lock().clone()
    }

    /// Receives a fresh snapshot after every committed transition.
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.inner.snapshots.subscribe()
    }

    pub fn on<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SessionNotification) + Send + Sync + 'static,
    {
        self.inner.notifications.subscribe(handler)
    }

    /// Starts a session for `passage_text`: asks the server to start it, opens
    /// the audio stream it names, and begins reading once both are ready.
    ///
    /// Ignored unless the session is idle or has ended. If the server never
    /// acknowledges and local speech is available, the session continues in
    /// degraded mode; any other failure returns the session to idle. A start
    /// overtaken by a session failure or shutdown releases its stream and
    /// returns an error.
    pub async fn start_reading(&self, passage_text: &str) -> Result<(), SessionError> {
        let inner = &self.inner;
        if !inner.dispatch(SessionEvent::StartRequested {
            passage_text: Arc::from(passage_text),
        }) {
            debug!("Ignoring start request; a session is already active.");
            return Ok(());
        }
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let outcome = inner.begin(passage_text).await;
        if inner.generation.load(Ordering::SeqCst) != generation {
            debug!("Session start was superseded.");
            return match outcome {
                Ok(_) => Err(inner.abandon_start()),
                Err(e) => Err(e),
            };
        }

        match outcome {
            Ok(started) => {
                if inner.dispatch(started) {
                    Ok(())
                } else {
                    Err(inner.abandon_start())
                }
            }
            Err(e) => {
                inner.dispatch(SessionEvent::Failed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    pub fn pause_reading(&self) {
        self.inner.dispatch(SessionEvent::Paused);
    }

    pub fn resume_reading(&self) {
        self.inner.dispatch(SessionEvent::Resumed);
    }

    /// Pauses and asks the server a question about the text around the current word.
    pub fn interrupt(&self, kind: &str, user_input: Option<&str>) {
        self.inner.dispatch(SessionEvent::Interrupted {
            kind: kind.to_string(),
            user_input: user_input.map(str::to_string),
            words_before: self.inner.config.context_words_before,
            words_after: self.inner.config.context_words_after,
            at: Utc::now(),
        });
    }

    pub fn submit_checkpoint_answer(&self, answer: &str) {
        self.inner.dispatch(SessionEvent::CheckpointAnswered {
            answer: answer.to_string(),
        });
    }

    pub fn seek_to_word(&self, index: usize) {
        self.inner.dispatch(SessionEvent::SeekToWord { index });
    }

    /// Clamped to 0.5x to 2.0x.
    pub fn set_playback_speed(&self, rate: f32) {
        self.inner
            .dispatch(SessionEvent::PlaybackRateChanged { rate });
    }

    /// Feeds the playback clock into the session. Call on every clock tick.
    pub fn on_time_update(&self, time_secs: f64) {
        self.inner.dispatch(SessionEvent::TimeUpdated { time_secs });
    }

    /// Tears the session down: stops timers and playback, detaches from the
    /// channel and the buffer, and hands a summary to the session sink. A slow
    /// or failing sink is logged and does not hold teardown up.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.generation.fetch_add(1, Ordering::SeqCst);
        inner.stop_sync_timer();

        let subscriptions: Vec<Subscription> = inner.subscriptions.lock().drain(..).collect();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }

        inner.buffer.stop_stream();
        inner.ports.playback.stop();

        let state = inner.state.lock().clone();
        if state.passage_text.is_empty() {
            return;
        }
        inner.send_progress(kinds::SESSION_END, &state);

        let summary = SessionSummary::from_state(&state);
        info!(
            session_id = ?summary.session_id,
            words_read = summary.words_read,
            "Saving session summary."
        );
        match tokio::time::timeout(
            inner.config.teardown_timeout,
            inner.ports.sink.save_session(summary),
        )
        .await
        {
            Ok(Ok(())) => debug!("Session summary saved."),
            Ok(Err(e)) => warn!("Failed to save session summary: {}", e),
            Err(_) => warn!(
                "Timed out after {:?} saving the session summary.",
                inner.config.teardown_timeout
            ),
        }
    }
}

/// Wraps a handler so it only runs while the orchestrator is alive, keeping the
/// channel and buffer from holding it in a reference cycle.
fn forward<T, F>(weak: &Weak<OrchestratorInner>, handler: F) -> impl Fn(&T) + Send + Sync + 'static
where
    T: 'static,
    F: Fn(&Arc<OrchestratorInner>, &T) + Send + Sync + 'static,
{
    let weak = weak.clone();
    move |event| {
        if let Some(inner) = weak.upgrade() {
            handler(&inner, event);
        }
    }
}

impl OrchestratorInner {
    fn attach(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let subscriptions = vec![
            self.channel.on_message(
                kinds::CHECKPOINT_TRIGGERED,
                forward::<Message, _>(&weak, |inner, message| inner.on_checkpoint(message)),
            ),
            self.channel.on_message(
                kinds::INTERRUPTION_ACKNOWLEDGED,
                forward::<Message, _>(&weak, |inner, message| inner.on_interruption_acknowledged(message)),
            ),
            self.channel.on_message(
                kinds::INTERRUPTION_RESPONSE,
                forward::<Message, _>(&weak, |inner, message| inner.on_interruption_response(message)),
            ),
            self.channel.on_message(
                kinds::ERROR,
                forward::<Message, _>(&weak, |inner, message| inner.on_server_error(message)),
            ),
            self.channel
                .on(forward::<ChannelEvent, _>(&weak, |inner, event| inner.on_channel_event(event))),
            self.buffer
                .on(forward::<BufferEvent, _>(&weak, |inner, event| inner.on_buffer_event(event))),
        ];
        *self.subscriptions.lock() = subscriptions;
    }

    async fn begin(&self, passage_text: &str) -> Result<SessionEvent, SessionError> {
        let playback_rate = self.state.lock().playback_rate;
        let request = Message::new(
            kinds::SESSION_START,
            SessionStartPayload {
                passage_text,
                playback_rate,
            },
        );

        let acknowledged = self
            .channel
            .send_and_wait(request, self.config.start_timeout)
            .await;
        let (session_id, stream_url, word_timings, degraded) = match acknowledged {
            Ok(payload) => {
                let started: SessionStartedPayload = serde_json::from_value(payload)
                    .map_err(|e| SessionError::Protocol(format!("invalid session.started payload: {}", e)))?;
                let (session_id, audio_url, timings) = started.into_parts();
                info!(session_id = %session_id, words = timings.len(), "Reading session started.");
                (Some(session_id), audio_url, timings, false)
            }
            Err(e) => {
                // A server that answered with an error has refused the session.
                let refused = matches!(e, ChannelError::Server { .. });
                let speech = match &self.ports.speech {
                    Some(speech) if !refused => speech.clone(),
                    _ => return Err(e.into()),
                };
                warn!("Session start was not acknowledged ({}); continuing with local speech.", e);
                let synthesis = speech
                    .synthesize(passage_text, &self.config.synthesis)
                    .await
                    .map_err(SessionError::Synthesis)?;
                (None, synthesis.audio_url, synthesis.word_timings, true)
            }
        };

        let metadata = self.buffer.start_stream(&stream_url).await?;

        Ok(SessionEvent::Started {
            session_id,
            stream_url,
            metadata,
            word_timings: word_timings.into(),
            degraded,
        })
    }

    /// Releases the stream opened by a start that can no longer commit.
    fn abandon_start(&self) -> SessionError {
        self.buffer.stop_stream();
        let reason = self
            .state
            .lock()
            .last_error
            .clone()
            .unwrap_or_else(|| "session closed".to_string());
        warn!("Abandoning session start: {}", reason);
        SessionError::Aborted(reason)
    }

    /// Runs one event through the reducer and carries out its effects.
    /// Returns whether anything changed.
    fn dispatch(self: &Arc<Self>, event: SessionEvent) -> bool {
        let _serial = self.transitions.lock();
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }

        let (next, effects, previous) = {
            let mut state = self.state.lock();
            let transition = reduce(&state, event);
            if transition.effects.is_empty() && transition.state == *state {
                return false;
            }
            let previous = state.reading_state;
            *state = transition.state.clone();
            (transition.state, transition.effects, previous)
        };

        self.snapshots.send_replace(next.clone());
        if previous != next.reading_state {
            info!("Reading state: {} -> {}", previous, next.reading_state);
            self.notifications
                .emit(&SessionNotification::StateChanged(next.reading_state));
        }
        for effect in effects {
            self.apply(effect, &next);
        }
        true
    }

    fn apply(self: &Arc<Self>, effect: Effect, state: &SessionState) {
        match effect {
            Effect::StartSyncTimer => self.start_sync_timer(),
            Effect::StopSyncTimer => self.stop_sync_timer(),
            Effect::PausePlayback => {
                self.ports.playback.pause();
                self.buffer.pause_stream();
            }
            Effect::ResumePlayback => {
                self.buffer.resume_stream();
                self.ports.playback.resume();
            }
            Effect::LoadPlayback {
                stream_url,
                metadata,
            } => self.ports.playback.load(&stream_url, &metadata),
            Effect::StopPlayback => {
                self.ports.playback.stop();
                self.buffer.stop_stream();
            }
            Effect::Seek { time_secs } => {
                self.buffer.seek_to_time(time_secs);
                self.ports.playback.seek(time_secs);
            }
            Effect::SetPlaybackRate(rate) => self.ports.playback.set_rate(rate),
            Effect::NotifyPaused => self.send_progress(kinds::SESSION_PAUSE, state),
            Effect::NotifyResumed => self.send_progress(kinds::SESSION_RESUME, state),
            Effect::SendInterruption(interruption) => {
                if state.degraded {
                    warn!("Interruption recorded offline; no server is available to answer it.");
                    return;
                }
                self.channel.send(Message::new(
                    kinds::INTERRUPTION_CREATE,
                    InterruptionCreatePayload::from(&interruption),
                ));
            }
            Effect::SendCheckpointAnswer {
                checkpoint_id,
                answer,
            } => {
                if state.degraded {
                    return;
                }
                self.channel.send(Message::new(
                    kinds::CHECKPOINT_ANSWER,
                    CheckpointAnswerPayload {
                        checkpoint_id: &checkpoint_id,
                        answer: &answer,
                    },
                ));
            }
            Effect::Highlight { index } => {
                let word = state
                    .word_timings
                    .get(index)
                    .map(|timing| timing.word.clone())
                    .unwrap_or_default();
                self.notifications
                    .emit(&SessionNotification::WordHighlighted { index, word });
            }
            Effect::CheckpointReached(checkpoint) => {
                info!(position = checkpoint.position, "Checkpoint reached: {}", checkpoint.question);
                self.notifications
                    .emit(&SessionNotification::CheckpointReached(checkpoint));
            }
            Effect::Ended => {
                info!("Reached the end of the passage.");
                self.notifications.emit(&SessionNotification::Ended);
            }
            Effect::Error(reason) => {
                error!("Reading session failed: {}", reason);
                self.notifications
                    .emit(&SessionNotification::Error(reason));
            }
        }
    }

    /// Sends `{sessionId, currentWordIndex}` under `kind` when there is a server session.
    fn send_progress(&self, kind: &str, state: &SessionState) {
        if state.degraded {
            return;
        }
        if let Some(session_id) = &state.session_id {
            self.channel.send(Message::new(
                kind,
                ProgressPayload::new(session_id, state.current_word_index),
            ));
        }
    }

    fn start_sync_timer(self: &Arc<Self>) {
        let period = self.config.sync_interval;
        if period.is_zero() {
            return;
        }
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let state = inner.state.lock().clone();
                if state.reading_state != ReadingState::Reading {
                    return;
                }
                inner.send_progress(kinds::PROGRESS_UPDATE, &state);
            }
        });
        if let Some(previous) = self.sync_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn stop_sync_timer(&self) {
        if let Some(task) = self.sync_task.lock().take() {
            task.abort();
        }
    }

    fn on_checkpoint(self: &Arc<Self>, message: &Message) {
        let checkpoint = message
            .payload_as::<CheckpointTriggeredPayload>()
            .map_err(|e| e.to_string())
            .and_then(CheckpointTriggeredPayload::to_domain);
        match checkpoint {
            Ok(checkpoint) => {
                debug!(position = checkpoint.position, "Checkpoint received.");
                self.dispatch(SessionEvent::CheckpointReceived(checkpoint));
            }
            Err(e) => warn!("Ignoring malformed checkpoint: {}", e),
        }
    }

    fn on_interruption_acknowledged(&self, message: &Message) {
        match message.payload_as::<InterruptionAcknowledgedPayload>() {
            Ok(ack) => {
                debug!(paused_at = ?ack.paused_at(), "Interruption acknowledged.");
                self.notifications
                    .emit(&SessionNotification::InterruptionAcknowledged(ack));
            }
            Err(e) => warn!("Ignoring malformed interruption acknowledgement: {}", e),
        }
    }

    fn on_interruption_response(self: &Arc<Self>, message: &Message) {
        match message.payload_as::<InterruptionResponse>() {
            Ok(response) => {
                self.dispatch(SessionEvent::InterruptionAnswered);
                self.notifications
                    .emit(&SessionNotification::InterruptionResponse(response));
            }
            Err(e) => warn!("Ignoring malformed interruption response: {}", e),
        }
    }

    fn on_server_error(&self, message: &Message) {
        let description = message
            .payload_as::<ErrorPayload>()
            .map(|payload| payload.describe())
            .unwrap_or_else(|_| "unspecified server error".to_string());
        warn!("Server reported an error: {}", description);
        self.notifications
            .emit(&SessionNotification::Error(description));
    }

    fn on_channel_event(self: &Arc<Self>, event: &ChannelEvent) {
        if let ChannelEvent::ReconnectFailed { attempts } = event {
            let reading_state = {
                let state = self.state.lock();
                if state.degraded {
                    return;
                }
                state.reading_state
            };
            if reading_state == ReadingState::Loading && self.ports.speech.is_some() {
                warn!("Control channel lost while starting; local speech will stand in.");
                return;
            }
            // The start in flight, if any, must not commit after this failure.
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.dispatch(SessionEvent::Failed {
                reason: format!("control channel lost after {} reconnection attempts", attempts),
            });
        }
    }

    fn on_buffer_event(&self, event: &BufferEvent) {
        if let BufferEvent::ChunkFailed {
            sequence_number, ..
        } = event
        {
            self.notifications.emit(&SessionNotification::ChunkFailed {
                sequence_number: *sequence_number,
            });
        }
    }
}
