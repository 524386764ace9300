//! services/reader/src/adapters/memory.rs
//!
//! An in-process implementation of the `MessageTransport` port. The "server" end
//! is handed to whoever holds the paired [`MemoryServer`], which makes it suitable
//! for local loopback sessions and for driving the channel in tests.

use crate::channel::Message;
use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reading_session_core::ports::{FrameSink, FrameStream, MessageTransport, PortError, PortResult};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Default)]
struct Dial {
    refuse_remaining: u32,
    attempts: u32,
}

/// Client side of the loopback transport.
#[derive(Clone)]
pub struct MemoryTransport {
    dial: Arc<Mutex<Dial>>,
    accept_tx: mpsc::UnboundedSender<MemoryConnection>,
}

/// Server side: yields one [`MemoryConnection`] per successful `open()`.
pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<MemoryConnection>,
}

/// The server's view of one connection.
pub struct MemoryConnection {
    incoming: fmpsc::UnboundedReceiver<String>,
    outgoing: fmpsc::UnboundedSender<PortResult<String>>,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryServer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                dial: Arc::new(Mutex::new(Dial::default())),
                accept_tx,
            },
            MemoryServer { accept_rx },
        )
    }

    /// Makes the next `count` calls to `open()` fail.
    pub fn refuse_next(&self, count: u32) {
        self.dial.lock().refuse_remaining = count;
    }

    /// Number of `open()` calls so far, successful or not.
    pub fn attempts(&self) -> u32 {
        self.dial.lock().attempts
    }
}

#[async_trait]
impl MessageTransport for MemoryTransport {
    async fn open(&self) -> PortResult<(FrameSink, FrameStream)> {
        {
            let mut dial = self.dial.lock();
            dial.attempts += 1;
            if dial.refuse_remaining > 0 {
                dial.refuse_remaining -= 1;
                return Err(PortError::Transport("connection refused".to_string()));
            }
        }

        let (client_tx, server_rx) = fmpsc::unbounded::<String>();
        let (server_tx, client_rx) = fmpsc::unbounded::<PortResult<String>>();

        self.accept_tx
            .send(MemoryConnection {
                incoming: server_rx,
                outgoing: server_tx,
            })
            .map_err(|_| PortError::Transport("loopback server is gone".to_string()))?;
        debug!("Loopback connection opened.");

        let sink: FrameSink =
            Box::pin(client_tx.sink_map_err(|e| PortError::Transport(e.to_string())));
        let stream: FrameStream = Box::pin(client_rx);
        Ok((sink, stream))
    }
}

impl MemoryServer {
    pub async fn accept(&mut self) -> Option<MemoryConnection> {
        self.accept_rx.recv().await
    }
}

impl MemoryConnection {
    /// Next raw frame from the client, `None` once the client closed its side.
    pub async fn recv_frame(&mut self) -> Option<String> {
        self.incoming.next().await
    }

    /// Next frame that parses as a [`Message`], skipping anything else.
    pub async fn recv(&mut self) -> Option<Message> {
        while let Some(frame) = self.recv_frame().await {
            if let Ok(message) = serde_json::from_str::<Message>(&frame) {
                return Some(message);
            }
        }
        None
    }

    /// Like [`recv`](Self::recv) but skips heartbeat pings.
    pub async fn recv_non_ping(&mut self) -> Option<Message> {
        loop {
            let message = self.recv().await?;
            if message.kind != crate::channel::kinds::PING {
                return Some(message);
            }
        }
    }

    pub fn send_raw(&self, frame: impl Into<String>) {
        let _ = self.outgoing.unbounded_send(Ok(frame.into()));
    }

    pub fn send(&self, message: &Message) {
        if let Ok(frame) = serde_json::to_string(message) {
            self.send_raw(frame);
        }
    }

    /// Breaks the connection from the server side with a transport error.
    pub fn fail(self, reason: &str) {
        let _ = self
            .outgoing
            .unbounded_send(Err(PortError::Transport(reason.to_string())));
    }

    /// Closes the connection from the server side.
    pub fn close(self) {
        drop(self);
    }
}
