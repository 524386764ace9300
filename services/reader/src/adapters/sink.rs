//! services/reader/src/adapters/sink.rs
//!
//! A `SessionSink` that records finished sessions in the log.

use async_trait::async_trait;
use reading_session_core::domain::SessionSummary;
use reading_session_core::ports::{PortResult, SessionSink};
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct LogSessionSink;

#[async_trait]
impl SessionSink for LogSessionSink {
    async fn save_session(&self, summary: SessionSummary) -> PortResult<()> {
        let answered = summary
            .checkpoints
            .iter()
            .filter(|checkpoint| checkpoint.user_answer.is_some())
            .count();
        info!(
            session_id = summary.session_id.as_deref().unwrap_or("local"),
            final_state = %summary.final_state,
            words_read = summary.words_read,
            passage_words = summary.passage_word_count,
            checkpoints = summary.checkpoints.len(),
            answered,
            interruptions = summary.interruptions.len(),
            degraded = summary.degraded,
            finished_at = %summary.finished_at,
            "Session finished."
        );
        Ok(())
    }
}
