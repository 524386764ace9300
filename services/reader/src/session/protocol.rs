//! services/reader/src/session/protocol.rs
//!
//! Payload records carried inside control-channel messages for a reading session.
//! Field names follow the server's camelCase wire format; each inbound record
//! converts into the core domain type it describes.

use chrono::Utc;
use reading_session_core::domain::{Checkpoint, CheckpointKind, Interruption, WordTiming};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Word indices travel as integers with `-1` meaning "not started".
fn wire_index(index: Option<usize>) -> i64 {
    index.map_or(-1, |i| i as i64)
}

fn domain_index(index: i64) -> Option<usize> {
    usize::try_from(index).ok()
}

//=========================================================================================
// Client -> Server
//=========================================================================================

/// `session.start`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartPayload<'a> {
    pub passage_text: &'a str,
    pub playback_rate: f32,
}

/// `progress.update`, `session.pause`, `session.resume` and `session.end`.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub session_id: String,
    pub current_word_index: i64,
}

impl ProgressPayload {
    pub fn new(session_id: &str, current_word_index: Option<usize>) -> Self {
        Self {
            session_id: session_id.to_string(),
            current_word_index: wire_index(current_word_index),
        }
    }
}

/// `checkpoint.answer`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointAnswerPayload<'a> {
    pub checkpoint_id: &'a str,
    pub answer: &'a str,
}

/// `interruption.create`
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InterruptionCreatePayload {
    pub interruption_type: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub word_index: i64,
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_input: Option<String>,
}

impl From<&Interruption> for InterruptionCreatePayload {
    fn from(interruption: &Interruption) -> Self {
        Self {
            interruption_type: interruption.kind.clone(),
            timestamp: interruption.timestamp.timestamp_millis(),
            word_index: wire_index(interruption.word_index),
            context: interruption.context.clone(),
            user_input: interruption.user_input.clone(),
        }
    }
}

//=========================================================================================
// Server -> Client
//=========================================================================================

/// One timed word. Some servers send `start`/`end` instead of the long names.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordTimingRecord {
    pub word: String,
    #[serde(alias = "start")]
    pub start_time: f64,
    #[serde(alias = "end")]
    pub end_time: f64,
    #[serde(default)]
    pub index: Option<usize>,
}

impl WordTimingRecord {
    fn to_domain(self, position: usize) -> WordTiming {
        WordTiming {
            word: self.word,
            start_time: self.start_time,
            end_time: self.end_time,
            index: self.index.unwrap_or(position),
        }
    }
}

/// `session.started`, the acknowledgement of `session.start`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartedPayload {
    pub session_id: String,
    pub audio_url: String,
    #[serde(default)]
    pub word_timings: Vec<WordTimingRecord>,
}

impl SessionStartedPayload {
    /// Splits into `(session_id, audio_url, timings)`, with timings in
    /// ascending start order as the position lookup requires.
    pub fn into_parts(self) -> (String, String, Vec<WordTiming>) {
        let mut timings: Vec<WordTiming> = self
            .word_timings
            .into_iter()
            .enumerate()
            .map(|(position, record)| record.to_domain(position))
            .collect();
        timings.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
        (self.session_id, self.audio_url, timings)
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckpointRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub position: usize,
    #[serde(rename = "type")]
    pub kind: String,
    pub question: String,
}

/// `checkpoint.triggered`
#[derive(Debug, Deserialize)]
pub struct CheckpointTriggeredPayload {
    pub checkpoint: CheckpointRecord,
}

impl CheckpointTriggeredPayload {
    pub fn to_domain(self) -> Result<Checkpoint, String> {
        let record = self.checkpoint;
        let kind: CheckpointKind = record.kind.parse()?;
        Ok(Checkpoint {
            id: record
                .id
                .unwrap_or_else(|| format!("checkpoint-{}", record.position)),
            position: record.position,
            kind,
            question: record.question,
            user_answer: None,
            is_correct: None,
            timestamp: Utc::now(),
        })
    }
}

/// `interruption.acknowledged`, sent while the server prepares its answer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptionAcknowledgedPayload {
    pub paused_at_word_index: i64,
    #[serde(default)]
    pub paused_at_timestamp: Option<Value>,
    /// Seconds until the response is expected, when the server can tell.
    #[serde(default)]
    pub processing_estimate: Option<f64>,
}

impl InterruptionAcknowledgedPayload {
    pub fn paused_at(&self) -> Option<usize> {
        domain_index(self.paused_at_word_index)
    }
}

/// `interruption.response`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptionResponse {
    pub response_text: String,
    pub response_type: String,
    #[serde(default)]
    pub structured_data: Option<Value>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// `error` frames that are not an answer to a pending request.
#[derive(Debug, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub code: Value,
    #[serde(default)]
    pub message: String,
}

impl ErrorPayload {
    pub fn describe(&self) -> String {
        match &self.code {
            Value::Null => self.message.clone(),
            Value::String(code) => format!("{}: {}", code, self.message),
            other => format!("{}: {}", other, self.message),
        }
    }
}
