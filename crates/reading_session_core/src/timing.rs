//! crates/reading_session_core/src/timing.rs
//!
//! Word-timing lookups shared by the session reducer and its tests.

use crate::domain::WordTiming;

/// Finds the word being spoken at `t` seconds.
///
/// Timings must be non-decreasing by start time. A time inside a gap between two
/// words keeps the earlier word highlighted, and any time past the final word maps
/// to the last index. Returns `None` when there is no timing data or `t` falls
/// before the first word starts.
pub fn word_index_at(timings: &[WordTiming], t: f64) -> Option<usize> {
    let last = timings.len().checked_sub(1)?;
    if t >= timings[last].end_time {
        return Some(last);
    }
    let started = timings.partition_point(|w| w.start_time <= t);
    started.checked_sub(1)
}

/// Splits a passage into the words that word timings are indexed against.
pub fn passage_words(text: &str) -> Vec<&str> {
    text.split_whitespace().collect()
}

/// Up to `before` words preceding `index`, the word itself, and up to `after`
/// following words, clipped to the passage and joined with single spaces.
pub fn context_window(words: &[&str], index: usize, before: usize, after: usize) -> String {
    if index >= words.len() {
        return String::new();
    }
    let start = index.saturating_sub(before);
    let end = index.saturating_add(after).saturating_add(1).min(words.len());
    words[start..end].join(" ")
}
