//! services/reader/src/streaming/buffer.rs
//!
//! The chunked streaming buffer: fetches fixed-duration audio chunks on demand,
//! prefetches ahead of the playback frontier according to buffer health, and
//! reports the contiguous look-ahead as a derived `BufferState`.

use crate::error::BufferError;
use crate::events::{Subscribers, Subscription};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use reading_session_core::domain::{BufferHealth, BufferState, Chunk, StreamMetadata};
use reading_session_core::ports::{ChunkSource, PortError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Contiguous seconds below which the buffer is `Low`.
    pub low_threshold_secs: f64,
    /// Contiguous seconds at which the buffer is `Full`.
    pub high_threshold_secs: f64,
    /// Chunks requested ahead while the buffer is `Empty`.
    pub prefetch_when_empty: u32,
    /// Chunks requested ahead while the buffer is `Low`.
    pub prefetch_when_low: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            low_threshold_secs: 10.0,
            high_threshold_secs: 30.0,
            prefetch_when_empty: 4,
            prefetch_when_low: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub enum BufferEvent {
    StreamStarted(StreamMetadata),
    ChunkLoaded { sequence_number: u32 },
    ChunkFailed { sequence_number: u32, error: BufferError },
    StreamStopped,
}

type ChunkFetch = Shared<BoxFuture<'static, Result<Chunk, BufferError>>>;

struct ActiveStream {
    url: String,
    metadata: StreamMetadata,
    cancel: CancellationToken,
}

struct BufferShared {
    stream: Option<ActiveStream>,
    /// Bumped whenever the stream is started or stopped; fetches from an older
    /// epoch are discarded instead of cached.
    epoch: u64,
    cache: BTreeMap<u32, Chunk>,
    loading: HashMap<u32, ChunkFetch>,
    /// `None` until the first chunk is played.
    last_played: Option<u32>,
    paused: bool,
}

impl BufferShared {
    fn reset(&mut self) -> bool {
        let had_stream = match self.stream.take() {
            Some(stream) => {
                stream.cancel.cancel();
                true
            }
            None => false,
        };
        self.epoch += 1;
        self.cache.clear();
        self.loading.clear();
        self.last_played = None;
        self.paused = false;
        had_stream
    }

    fn advance_played(&mut self, sequence_number: u32) {
        self.last_played = Some(
            self.last_played
                .map_or(sequence_number, |played| played.max(sequence_number)),
        );
    }
}

struct BufferInner {
    source: Arc<dyn ChunkSource>,
    config: BufferConfig,
    shared: Mutex<BufferShared>,
    events: Subscribers<BufferEvent>,
}

/// A cheaply cloneable handle to one buffer manager.
#[derive(Clone)]
pub struct StreamBuffer {
    inner: Arc<BufferInner>,
}

impl StreamBuffer {
    pub fn new(source: Arc<dyn ChunkSource>, config: BufferConfig) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                source,
                config,
                shared: Mutex::new(BufferShared {
                    stream: None,
                    epoch: 0,
                    cache: BTreeMap::new(),
                    loading: HashMap::new(),
                    last_played: None,
                    paused: false,
                }),
                events: Subscribers::new(),
            }),
        }
    }

    /// Fetches the stream's metadata, discards whatever was buffered before and
    /// starts prefetching from chunk 0.
    pub async fn start_stream(&self, url: &str) -> Result<StreamMetadata, BufferError> {
        let epoch = {
            let mut shared = self.inner.shared.lock();
            shared.reset();
            shared.epoch
        };
        info!(url, "Starting audio stream.");

        let metadata = self
            .inner
            .source
            .fetch_metadata(url)
            .await
            .map_err(|source| BufferError::Fetch {
                what: "stream metadata".to_string(),
                source,
            })?;
        metadata.validate()?;

        {
            let mut shared = self.inner.shared.lock();
            if shared.epoch != epoch {
                return Err(BufferError::Cancelled);
            }
            shared.stream = Some(ActiveStream {
                url: url.to_string(),
                metadata: metadata.clone(),
                cancel: CancellationToken::new(),
            });
        }
        info!(
            stream_id = %metadata.stream_id,
            total_chunks = metadata.total_chunks,
            "Stream metadata loaded."
        );

        self.inner
            .events
            .emit(&BufferEvent::StreamStarted(metadata.clone()));
        self.inner.prefetch_ahead();
        Ok(metadata)
    }

    /// Returns chunk `n`, from the cache when present, otherwise from the source.
    /// Concurrent requests for the same chunk share a single fetch.
    pub async fn get_chunk(&self, sequence_number: u32) -> Result<Chunk, BufferError> {
        let fetch = {
            let mut shared = self.inner.shared.lock();
            let total_chunks = match &shared.stream {
                Some(stream) => stream.metadata.total_chunks,
                None => return Err(BufferError::NotStarted),
            };
            if sequence_number >= total_chunks {
                return Err(BufferError::OutOfRange {
                    sequence_number,
                    total_chunks,
                });
            }

            if let Some(chunk) = shared.cache.get(&sequence_number).cloned() {
                shared.advance_played(sequence_number);
                drop(shared);
                self.inner.prefetch_ahead();
                return Ok(chunk);
            }

            match shared.loading.get(&sequence_number) {
                Some(fetch) => fetch.clone(),
                None => match self.inner.start_fetch(&mut shared, sequence_number) {
                    Some(fetch) => fetch,
                    None => return Err(BufferError::NotStarted),
                },
            }
        };

        let outcome = fetch.await;
        if outcome.is_ok() {
            let mut shared = self.inner.shared.lock();
            if shared.cache.contains_key(&sequence_number) {
                shared.advance_played(sequence_number);
            }
        }
        self.inner.prefetch_ahead();
        outcome
    }

    /// Best-effort fetch of `count` chunks from `start`, skipping chunks that are
    /// cached or already loading. Does nothing while paused.
    pub fn prefetch_chunks(&self, start: u32, count: u32) {
        self.inner.prefetch(start, count);
    }

    /// Derived view of the contiguous buffer after the last played chunk.
    pub fn buffer_state(&self) -> BufferState {
        let shared = self.inner.shared.lock();
        self.inner.compute_state(&shared)
    }

    /// Drops all chunks, aborts in-flight fetches and invalidates the metadata.
    pub fn stop_stream(&self) {
        let had_stream = self.inner.shared.lock().reset();
        if had_stream {
            info!("Audio stream stopped.");
            self.inner.events.emit(&BufferEvent::StreamStopped);
        }
    }

    /// Halts prefetching; cached chunks are kept.
    pub fn pause_stream(&self) {
        self.inner.shared.lock().paused = true;
        debug!("Prefetching paused.");
    }

    /// Resumes prefetching from the current playback frontier.
    pub fn resume_stream(&self) {
        self.inner.shared.lock().paused = false;
        debug!("Prefetching resumed.");
        self.inner.prefetch_ahead();
    }

    /// Drops cached chunks but keeps the playback position, so the next access
    /// refetches. Used to recover from a suspect buffer without a restart.
    pub fn clear_buffer(&self) {
        let dropped = {
            let mut shared = self.inner.shared.lock();
            let dropped = shared.cache.len();
            shared.cache.clear();
            dropped
        };
        info!(dropped, "Cleared audio buffer.");
    }

    /// Moves the playback frontier to the chunk containing `time_secs`.
    pub fn seek_to_time(&self, time_secs: f64) {
        {
            let mut shared = self.inner.shared.lock();
            let target = match &shared.stream {
                Some(stream) => stream.metadata.chunk_index_at(time_secs),
                None => return,
            };
            shared.last_played = target.checked_sub(1);
            debug!(target, "Seeking audio stream.");
        }
        self.inner.prefetch_ahead();
    }

    pub fn metadata(&self) -> Option<StreamMetadata> {
        self.inner
            .shared
            .lock()
            .stream
            .as_ref()
            .map(|stream| stream.metadata.clone())
    }

    pub fn last_played_chunk(&self) -> Option<u32> {
        self.inner.shared.lock().last_played
    }

    pub fn is_cached(&self, sequence_number: u32) -> bool {
        self.inner.shared.lock().cache.contains_key(&sequence_number)
    }

    pub fn cached_len(&self) -> usize {
        self.inner.shared.lock().cache.len()
    }

    pub fn on<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&BufferEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(handler)
    }
}

impl BufferInner {
    /// Spawns the fetch for one chunk and registers it as loading.
    fn start_fetch(self: &Arc<Self>, shared: &mut BufferShared, sequence_number: u32) -> Option<ChunkFetch> {
        let stream = shared.stream.as_ref()?;
        let url = stream.url.clone();
        let metadata = stream.metadata.clone();
        let cancel = stream.cancel.clone();
        let epoch = shared.epoch;

        let inner = self.clone();
        let task = tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(BufferError::Cancelled),
                bytes = inner.source.fetch_chunk(&url, &metadata, sequence_number) => {
                    bytes.map_err(|source| BufferError::Fetch {
                        what: format!("chunk {}", sequence_number),
                        source,
                    })
                }
            };
            inner.complete_fetch(epoch, &metadata, sequence_number, outcome)
        });

        let fetch: ChunkFetch = async move {
            task.await.unwrap_or_else(|e| {
                Err(BufferError::Fetch {
                    what: format!("chunk {}", sequence_number),
                    source: PortError::Unexpected(e.to_string()),
                })
            })
        }
        .boxed()
        .shared();

        shared.loading.insert(sequence_number, fetch.clone());
        Some(fetch)
    }

    fn complete_fetch(
        &self,
        epoch: u64,
        metadata: &StreamMetadata,
        sequence_number: u32,
        outcome: Result<Bytes, BufferError>,
    ) -> Result<Chunk, BufferError> {
        let mut shared = self.shared.lock();
        if shared.epoch != epoch {
            debug!(sequence_number, "Discarding chunk from a stopped stream.");
            return Err(BufferError::Cancelled);
        }
        shared.loading.remove(&sequence_number);

        match outcome {
            Ok(data) => {
                let chunk = Chunk {
                    id: format!("{}-{}", metadata.stream_id, sequence_number),
                    sequence_number,
                    start_time: metadata.chunk_start_time(sequence_number),
                    duration: metadata.chunk_duration(sequence_number),
                    size: data.len(),
                    data,
                };
                shared.cache.insert(sequence_number, chunk.clone());
                drop(shared);

                debug!(sequence_number, size = chunk.size, "Chunk loaded.");
                self.events
                    .emit(&BufferEvent::ChunkLoaded { sequence_number });
                Ok(chunk)
            }
            Err(error) => {
                drop(shared);
                warn!(sequence_number, "Chunk fetch failed: {}", error);
                self.events.emit(&BufferEvent::ChunkFailed {
                    sequence_number,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    fn prefetch(self: &Arc<Self>, start: u32, count: u32) {
        let mut shared = self.shared.lock();
        if shared.paused {
            return;
        }
        let total_chunks = match &shared.stream {
            Some(stream) => stream.metadata.total_chunks,
            None => return,
        };

        let end = start.saturating_add(count).min(total_chunks);
        let mut requested = Vec::new();
        for sequence_number in start..end {
            if shared.cache.contains_key(&sequence_number)
                || shared.loading.contains_key(&sequence_number)
            {
                continue;
            }
            if self.start_fetch(&mut shared, sequence_number).is_some() {
                requested.push(sequence_number);
            }
        }
        if !requested.is_empty() {
            debug!(?requested, "Prefetching chunks.");
        }
    }

    /// Requests more chunks the emptier the buffer is; nothing once it is healthy.
    fn prefetch_ahead(self: &Arc<Self>) {
        let (frontier, count) = {
            let shared = self.shared.lock();
            if shared.paused || shared.stream.is_none() {
                return;
            }
            let state = self.compute_state(&shared);
            let count = match state.health {
                BufferHealth::Empty => self.config.prefetch_when_empty,
                BufferHealth::Low => self.config.prefetch_when_low,
                BufferHealth::Good | BufferHealth::Full => 0,
            };
            let first_unplayed = shared.last_played.map_or(0, |played| played + 1);
            (first_unplayed + state.buffered_chunks.len() as u32, count)
        };
        if count > 0 {
            self.prefetch(frontier, count);
        }
    }

    fn compute_state(&self, shared: &BufferShared) -> BufferState {
        if shared.stream.is_none() {
            return BufferState::empty();
        }

        let mut buffered_chunks = Vec::new();
        let mut buffered_duration_secs = 0.0;
        let mut next = shared.last_played.map_or(0, |played| played + 1);
        while let Some(chunk) = shared.cache.get(&next) {
            buffered_chunks.push(next);
            buffered_duration_secs += chunk.duration;
            next += 1;
        }

        let health = if buffered_chunks.is_empty() {
            BufferHealth::Empty
        } else if buffered_duration_secs < self.config.low_threshold_secs {
            BufferHealth::Low
        } else if buffered_duration_secs >= self.config.high_threshold_secs {
            BufferHealth::Full
        } else {
            BufferHealth::Good
        };

        let progress = if self.config.high_threshold_secs > 0.0 {
            (buffered_duration_secs / self.config.high_threshold_secs * 100.0).min(100.0)
        } else {
            100.0
        };

        BufferState {
            buffered_chunks,
            buffered_duration_secs,
            health,
            is_buffering: !shared.loading.is_empty(),
            progress,
        }
    }
}
