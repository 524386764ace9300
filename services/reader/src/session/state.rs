//! services/reader/src/session/state.rs
//!
//! The reading-session state machine as a pure function: a `SessionState` and
//! an event go in, the next state and the side effects to perform come out.
//! Events that are not valid in the current state leave it untouched and
//! produce no effects.

use chrono::{DateTime, Utc};
use reading_session_core::domain::{
    Checkpoint, Interruption, ReadingState, SessionState, StreamMetadata, WordTiming,
};
use reading_session_core::timing::{context_window, passage_words, word_index_at};
use std::sync::Arc;

pub const MIN_PLAYBACK_RATE: f32 = 0.5;
pub const MAX_PLAYBACK_RATE: f32 = 2.0;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StartRequested {
        passage_text: Arc<str>,
    },
    /// The server acknowledged the start (or local synthesis stood in for it)
    /// and the audio stream is ready.
    Started {
        session_id: Option<String>,
        stream_url: String,
        metadata: StreamMetadata,
        word_timings: Arc<[WordTiming]>,
        degraded: bool,
    },
    /// A channel or stream failure that ends the session.
    Failed {
        reason: String,
    },
    Paused,
    Resumed,
    Interrupted {
        kind: String,
        user_input: Option<String>,
        words_before: usize,
        words_after: usize,
        at: DateTime<Utc>,
    },
    InterruptionAnswered,
    CheckpointReceived(Checkpoint),
    CheckpointAnswered {
        answer: String,
    },
    TimeUpdated {
        time_secs: f64,
    },
    SeekToWord {
        index: usize,
    },
    PlaybackRateChanged {
        rate: f32,
    },
}

/// Work the orchestrator performs after a transition has been committed.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartSyncTimer,
    StopSyncTimer,
    PausePlayback,
    ResumePlayback,
    /// Hands the opened stream to the player and starts playback.
    LoadPlayback {
        stream_url: String,
        metadata: StreamMetadata,
    },
    StopPlayback,
    Seek { time_secs: f64 },
    SetPlaybackRate(f32),
    NotifyPaused,
    NotifyResumed,
    SendInterruption(Interruption),
    SendCheckpointAnswer { checkpoint_id: String, answer: String },
    Highlight { index: usize },
    CheckpointReached(Checkpoint),
    Ended,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub state: SessionState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn unchanged(state: &SessionState) -> Self {
        Self {
            state: state.clone(),
            effects: Vec::new(),
        }
    }

    fn to(state: SessionState, effects: Vec<Effect>) -> Self {
        Self { state, effects }
    }
}

pub fn reduce(state: &SessionState, event: SessionEvent) -> Transition {
    match (state.reading_state, event) {
        (
            ReadingState::Idle | ReadingState::Ended,
            SessionEvent::StartRequested { passage_text },
        ) => Transition::to(
            SessionState {
                passage_text,
                reading_state: ReadingState::Loading,
                playback_rate: state.playback_rate,
                ..SessionState::default()
            },
            Vec::new(),
        ),

        (
            ReadingState::Loading,
            SessionEvent::Started {
                session_id,
                stream_url,
                metadata,
                word_timings,
                degraded,
            },
        ) => {
            let mut effects = vec![
                Effect::LoadPlayback {
                    stream_url: stream_url.clone(),
                    metadata,
                },
                Effect::SetPlaybackRate(state.playback_rate),
            ];
            if session_id.is_some() {
                effects.push(Effect::StartSyncTimer);
            }
            Transition::to(
                SessionState {
                    session_id,
                    stream_url: Some(stream_url),
                    word_timings,
                    degraded,
                    reading_state: ReadingState::Reading,
                    current_word_index: None,
                    current_audio_time: 0.0,
                    last_error: None,
                    ..state.clone()
                },
                effects,
            )
        }

        (_, SessionEvent::Failed { reason }) => Transition::to(
            SessionState {
                reading_state: ReadingState::Idle,
                pending_interruption: None,
                last_error: Some(reason.clone()),
                ..state.clone()
            },
            vec![Effect::StopSyncTimer, Effect::StopPlayback, Effect::Error(reason)],
        ),

        (ReadingState::Reading, SessionEvent::Paused) => Transition::to(
            SessionState {
                reading_state: ReadingState::Paused,
                ..state.clone()
            },
            vec![Effect::StopSyncTimer, Effect::PausePlayback, Effect::NotifyPaused],
        ),

        // An explicit resume also abandons an interruption that is still waiting.
        (ReadingState::Paused | ReadingState::Interrupted, SessionEvent::Resumed) => Transition::to(
            SessionState {
                reading_state: ReadingState::Reading,
                pending_interruption: None,
                ..state.clone()
            },
            resume_effects(state),
        ),

        (
            ReadingState::Reading,
            SessionEvent::Interrupted {
                kind,
                user_input,
                words_before,
                words_after,
                at,
            },
        ) => {
            let words = passage_words(&state.passage_text);
            let anchor = state.current_word_index.unwrap_or(0);
            let interruption = Interruption {
                kind,
                timestamp: at,
                word_index: state.current_word_index,
                context: context_window(&words, anchor, words_before, words_after),
                user_input,
            };
            let mut interruptions = state.interruptions.clone();
            interruptions.push(interruption.clone());
            Transition::to(
                SessionState {
                    reading_state: ReadingState::Interrupted,
                    pending_interruption: Some(interruption.clone()),
                    interruptions,
                    ..state.clone()
                },
                vec![
                    Effect::StopSyncTimer,
                    Effect::PausePlayback,
                    Effect::SendInterruption(interruption),
                ],
            )
        }

        (ReadingState::Interrupted, SessionEvent::InterruptionAnswered) => Transition::to(
            SessionState {
                reading_state: ReadingState::Paused,
                pending_interruption: None,
                ..state.clone()
            },
            Vec::new(),
        ),

        (ReadingState::Idle | ReadingState::Ended, SessionEvent::CheckpointReceived(_)) => {
            Transition::unchanged(state)
        }
        (_, SessionEvent::CheckpointReceived(checkpoint)) => {
            let reached = state
                .current_word_index
                .is_some_and(|current| current >= checkpoint.position);
            if state.reading_state == ReadingState::Reading && reached {
                trigger_checkpoint(state.clone(), checkpoint)
            } else {
                let mut next = state.clone();
                hold_checkpoint(&mut next.upcoming_checkpoints, checkpoint);
                Transition::to(next, Vec::new())
            }
        }

        (ReadingState::Checkpoint, SessionEvent::CheckpointAnswered { answer }) => {
            let mut checkpoints = state.checkpoints.clone();
            let Some(current) = checkpoints.last_mut() else {
                return Transition::unchanged(state);
            };
            current.user_answer = Some(answer.clone());
            let checkpoint_id = current.id.clone();
            Transition::to(
                SessionState {
                    reading_state: ReadingState::Paused,
                    checkpoints,
                    ..state.clone()
                },
                vec![Effect::SendCheckpointAnswer {
                    checkpoint_id,
                    answer,
                }],
            )
        }

        (ReadingState::Reading, SessionEvent::TimeUpdated { time_secs }) => {
            on_time_update(state, time_secs)
        }

        (ReadingState::Reading | ReadingState::Paused, SessionEvent::SeekToWord { index }) => {
            let Some(timing) = state.word_timings.get(index) else {
                return Transition::unchanged(state);
            };
            let time_secs = timing.start_time;
            Transition::to(
                SessionState {
                    current_word_index: Some(index),
                    current_audio_time: time_secs,
                    ..state.clone()
                },
                vec![Effect::Seek { time_secs }, Effect::Highlight { index }],
            )
        }

        (_, SessionEvent::PlaybackRateChanged { rate }) => {
            if !rate.is_finite() {
                return Transition::unchanged(state);
            }
            let rate = rate.clamp(MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE);
            if rate == state.playback_rate {
                return Transition::unchanged(state);
            }
            Transition::to(
                SessionState {
                    playback_rate: rate,
                    ..state.clone()
                },
                vec![Effect::SetPlaybackRate(rate)],
            )
        }

        _ => Transition::unchanged(state),
    }
}

fn resume_effects(state: &SessionState) -> Vec<Effect> {
    let mut effects = vec![Effect::ResumePlayback, Effect::NotifyResumed];
    if state.session_id.is_some() {
        effects.push(Effect::StartSyncTimer);
    }
    effects
}

fn trigger_checkpoint(mut state: SessionState, checkpoint: Checkpoint) -> Transition {
    state.reading_state = ReadingState::Checkpoint;
    state.checkpoints.push(checkpoint.clone());
    Transition::to(
        state,
        vec![
            Effect::StopSyncTimer,
            Effect::PausePlayback,
            Effect::CheckpointReached(checkpoint),
        ],
    )
}

/// Keeps upcoming checkpoints ordered by position; a repeated id replaces the old entry.
fn hold_checkpoint(upcoming: &mut Vec<Checkpoint>, checkpoint: Checkpoint) {
    upcoming.retain(|held| held.id != checkpoint.id);
    let at = upcoming.partition_point(|held| held.position <= checkpoint.position);
    upcoming.insert(at, checkpoint);
}

fn on_time_update(state: &SessionState, time_secs: f64) -> Transition {
    let mut next = state.clone();
    let mut effects = Vec::new();
    next.current_audio_time = time_secs;

    let index = word_index_at(&state.word_timings, time_secs);
    if index != state.current_word_index {
        next.current_word_index = index;
        if let Some(index) = index {
            effects.push(Effect::Highlight { index });
        }
    }

    if let Some(current) = next.current_word_index {
        let due = next
            .upcoming_checkpoints
            .first()
            .is_some_and(|checkpoint| checkpoint.position <= current);
        if due {
            let checkpoint = next.upcoming_checkpoints.remove(0);
            let mut transition = trigger_checkpoint(next, checkpoint);
            effects.append(&mut transition.effects);
            transition.effects = effects;
            return transition;
        }
    }

    let finished = state
        .word_timings
        .last()
        .is_some_and(|last| time_secs >= last.end_time);
    if finished {
        next.reading_state = ReadingState::Ended;
        effects.push(Effect::StopSyncTimer);
        effects.push(Effect::Ended);
    }

    Transition::to(next, effects)
}
