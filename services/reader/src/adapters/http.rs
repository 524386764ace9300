//! services/reader/src/adapters/http.rs
//!
//! This module contains the HTTP adapter for chunked audio streams.
//! It implements the `ChunkSource` port from the `core` crate:
//! `GET {stream}/metadata` for the stream description and
//! `GET {stream}/chunks/{n}` with a byte range for each chunk.

use async_trait::async_trait;
use bytes::Bytes;
use reading_session_core::domain::StreamMetadata;
use reading_session_core::ports::{ChunkSource, PortError, PortResult};
use reqwest::{header, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Wire shape of `GET {stream}/metadata`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataRecord {
    stream_id: String,
    total_duration_seconds: f64,
    total_chunks: u32,
    chunk_duration_seconds: f64,
    format: String,
    sample_rate: u32,
    bitrate: u32,
    channels: u16,
}

impl MetadataRecord {
    fn to_domain(self) -> StreamMetadata {
        StreamMetadata {
            stream_id: self.stream_id,
            total_duration_secs: self.total_duration_seconds,
            total_chunks: self.total_chunks,
            chunk_duration_secs: self.chunk_duration_seconds,
            format: self.format,
            sample_rate: self.sample_rate,
            bitrate: self.bitrate,
            channels: self.channels,
        }
    }
}

#[derive(Clone)]
pub struct HttpChunkSource {
    client: reqwest::Client,
}

impl HttpChunkSource {
    pub fn new(timeout: Duration) -> PortResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(Self { client })
    }
}

fn endpoint(stream_url: &str, path: &str) -> String {
    format!("{}/{}", stream_url.trim_end_matches('/'), path)
}

/// Maps non-success statuses onto the port's error kinds.
fn check_status(response: Response, url: &str) -> PortResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(match status {
        StatusCode::NOT_FOUND => PortError::NotFound(url.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PortError::Unauthorized,
        other => PortError::Transport(format!("{} returned {}", url, other)),
    })
}

#[async_trait]
impl ChunkSource for HttpChunkSource {
    async fn fetch_metadata(&self, stream_url: &str) -> PortResult<StreamMetadata> {
        let url = endpoint(stream_url, "metadata");
        debug!(url = %url, "Fetching stream metadata.");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PortError::Transport(e.to_string()))?;
        let record: MetadataRecord = check_status(response, &url)?
            .json()
            .await
            .map_err(|e| PortError::Decode(e.to_string()))?;
        Ok(record.to_domain())
    }

    async fn fetch_chunk(
        &self,
        stream_url: &str,
        metadata: &StreamMetadata,
        sequence_number: u32,
    ) -> PortResult<Bytes> {
        let url = endpoint(stream_url, &format!("chunks/{}", sequence_number));
        let mut request = self.client.get(&url);
        if let Some((start, end)) = metadata.chunk_byte_range(sequence_number) {
            request = request.header(header::RANGE, format!("bytes={}-{}", start, end));
        }

        let response = request
            .send()
            .await
            .map_err(|e| PortError::Transport(e.to_string()))?;
        check_status(response, &url)?
            .bytes()
            .await
            .map_err(|e| PortError::Transport(e.to_string()))
    }
}
