//! services/reader/src/channel/message.rs
//!
//! The envelope every frame on the control channel is wrapped in.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message types understood by the channel and the reading session.
pub mod kinds {
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";

    pub const SESSION_START: &str = "session.start";
    pub const SESSION_STARTED: &str = "session.started";
    pub const SESSION_PAUSE: &str = "session.pause";
    pub const SESSION_RESUME: &str = "session.resume";
    pub const SESSION_END: &str = "session.end";
    pub const PROGRESS_UPDATE: &str = "progress.update";

    pub const CHECKPOINT_TRIGGERED: &str = "checkpoint.triggered";
    pub const CHECKPOINT_ANSWER: &str = "checkpoint.answer";

    pub const INTERRUPTION_CREATE: &str = "interruption.create";
    pub const INTERRUPTION_ACKNOWLEDGED: &str = "interruption.acknowledged";
    pub const INTERRUPTION_RESPONSE: &str = "interruption.response";
}

/// A single control-channel frame.
///
/// `id` correlates requests with responses; the channel assigns one when it is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
}

impl Message {
    pub fn new(kind: &str, payload: impl Serialize) -> Self {
        let payload = serde_json::to_value(payload).ok().filter(|v| !v.is_null());
        Self {
            kind: kind.to_string(),
            payload,
            id: None,
            timestamp: now_ms(),
        }
    }

    /// A message without a payload, such as `ping`.
    pub fn bare(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            payload: None,
            id: None,
            timestamp: now_ms(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Decodes the payload into `T`; a missing payload decodes as JSON `null`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone().unwrap_or(Value::Null))
    }
}

pub(crate) fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
