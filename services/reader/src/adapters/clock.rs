//! services/reader/src/adapters/clock.rs
//!
//! A playback driver without an audio device: it keeps a virtual playhead that
//! advances with wall-clock time at the current playback rate. The binary polls
//! `position()` to drive the session the way a real player's time updates would.

use parking_lot::Mutex;
use reading_session_core::domain::StreamMetadata;
use reading_session_core::ports::PlaybackDriver;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct Playhead {
    duration: Option<f64>,
    /// Position at `anchor`, or the current position while stopped or paused.
    position: f64,
    anchor: Option<Instant>,
    rate: f32,
}

impl Playhead {
    fn current(&self) -> f64 {
        let elapsed = self
            .anchor
            .map_or(0.0, |anchor| anchor.elapsed().as_secs_f64() * self.rate as f64);
        let position = self.position + elapsed;
        match self.duration {
            Some(duration) => position.min(duration),
            None => position,
        }
    }

    /// Folds elapsed time into `position` and restarts the anchor if playing.
    fn settle(&mut self) {
        self.position = self.current();
        if self.anchor.is_some() {
            self.anchor = Some(Instant::now());
        }
    }
}

#[derive(Debug)]
pub struct SimulatedClock {
    playhead: Mutex<Playhead>,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedClock {
    pub fn new() -> Self {
        Self {
            playhead: Mutex::new(Playhead {
                duration: None,
                position: 0.0,
                anchor: None,
                rate: 1.0,
            }),
        }
    }

    /// Current playhead in seconds.
    pub fn position(&self) -> f64 {
        self.playhead.lock().current()
    }

    pub fn is_playing(&self) -> bool {
        self.playhead.lock().anchor.is_some()
    }

    /// True once the playhead has reached the end of the loaded stream.
    pub fn is_finished(&self) -> bool {
        let playhead = self.playhead.lock();
        playhead
            .duration
            .is_some_and(|duration| playhead.current() >= duration)
    }
}

impl PlaybackDriver for SimulatedClock {
    fn load(&self, stream_url: &str, metadata: &StreamMetadata) {
        debug!(stream_url, duration = metadata.total_duration_secs, "Loading stream.");
        let mut playhead = self.playhead.lock();
        playhead.duration = Some(metadata.total_duration_secs);
        playhead.position = 0.0;
        playhead.anchor = Some(Instant::now());
    }

    fn pause(&self) {
        let mut playhead = self.playhead.lock();
        playhead.settle();
        playhead.anchor = None;
    }

    fn resume(&self) {
        let mut playhead = self.playhead.lock();
        if playhead.duration.is_some() && playhead.anchor.is_none() {
            playhead.anchor = Some(Instant::now());
        }
    }

    fn stop(&self) {
        let mut playhead = self.playhead.lock();
        playhead.duration = None;
        playhead.position = 0.0;
        playhead.anchor = None;
    }

    fn seek(&self, time_secs: f64) {
        let mut playhead = self.playhead.lock();
        playhead.position = time_secs.max(0.0);
        if playhead.anchor.is_some() {
            playhead.anchor = Some(Instant::now());
        }
    }

    fn set_rate(&self, rate: f32) {
        let mut playhead = self.playhead.lock();
        playhead.settle();
        playhead.rate = rate;
    }
}
