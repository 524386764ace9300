//! services/reader/src/adapters/ws.rs
//!
//! This module contains the WebSocket adapter for the control channel.
//! It implements the `MessageTransport` port from the `core` crate.

use async_trait::async_trait;
use futures::{future, SinkExt, StreamExt};
use reading_session_core::ports::{FrameSink, FrameStream, MessageTransport, PortError, PortResult};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info};

/// Opens one WebSocket connection per `open()` call.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl MessageTransport for WsTransport {
    async fn open(&self) -> PortResult<(FrameSink, FrameStream)> {
        let (socket, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| PortError::Transport(e.to_string()))?;
        info!(url = %self.url, status = %response.status(), "WebSocket connected.");

        let (write, read) = socket.split();

        let sink = write
            .sink_map_err(|e| PortError::Transport(e.to_string()))
            .with(|frame: String| future::ready(Ok::<_, PortError>(WsMessage::Text(frame.into()))));

        // Only text frames carry messages. Control frames are answered by tungstenite
        // itself, and the stream ends after a close frame.
        let stream = read.filter_map(|item| {
            future::ready(match item {
                Ok(WsMessage::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(WsMessage::Binary(data)) => {
                    debug!(len = data.len(), "Ignoring binary frame.");
                    None
                }
                Ok(WsMessage::Close(frame)) => {
                    debug!(?frame, "Server sent a close frame.");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(PortError::Transport(e.to_string()))),
            })
        });

        let sink: FrameSink = Box::pin(sink);
        let stream: FrameStream = Box::pin(stream);
        Ok((sink, stream))
    }
}
