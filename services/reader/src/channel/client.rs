//! services/reader/src/channel/client.rs
//!
//! The duplex messaging channel: one long-lived connection to the server with
//! an outbound queue, request/response correlation, heartbeats and
//! exponential-backoff reconnection.

use crate::channel::message::{kinds, new_message_id, now_ms, Message};
use crate::error::ChannelError;
use crate::events::{Subscribers, Subscription};
use futures::future::{BoxFuture, FutureExt, Shared as SharedFuture};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reading_session_core::domain::ChannelState;
use reading_session_core::ports::{FrameSink, FrameStream, MessageTransport};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

//=========================================================================================
// Configuration
//=========================================================================================

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Period of `ping` frames while connected. Zero disables heartbeats.
    pub heartbeat_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// Consecutive failed reconnection attempts before giving up for good.
    pub max_reconnect_attempts: u32,
    /// Default deadline for [`DuplexChannel::request`].
    pub request_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// `min(base * 2^attempt, max)`, with `attempt` counted from zero.
pub fn reconnect_delay(config: &ChannelConfig, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    config
        .reconnect_base
        .saturating_mul(factor)
        .min(config.reconnect_max)
}

//=========================================================================================
// Events
//=========================================================================================

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    StateChanged(ChannelState),
    /// Any inbound message that was not consumed as a response or a pong.
    Message(Message),
    Error(String),
    Reconnecting { attempt: u32, delay: Duration },
    /// Terminal: reconnection attempts are exhausted.
    ReconnectFailed { attempts: u32 },
}

//=========================================================================================
// Internal state
//=========================================================================================

/// The live connection's writer queue and the token that stops its tasks.
struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

/// A first connection attempt, awaited by every `connect()` caller that arrives
/// while it is in flight.
type ConnectAttempt = SharedFuture<BoxFuture<'static, Result<(), ChannelError>>>;

struct Shared {
    state: ChannelState,
    link: Option<Link>,
    connecting: Option<ConnectAttempt>,
    queue: VecDeque<Message>,
    reconnect_attempts: u32,
    manual_close: bool,
    /// Bumped on every connect, reconnect schedule and disconnect so stale
    /// connection attempts can recognise themselves.
    generation: u64,
    reconnect_task: Option<JoinHandle<()>>,
}

struct PendingRequest {
    responder: oneshot::Sender<Result<Value, ChannelError>>,
    registered_at: Instant,
}

struct ChannelInner {
    transport: Arc<dyn MessageTransport>,
    config: ChannelConfig,
    shared: Mutex<Shared>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    events: Subscribers<ChannelEvent>,
    handlers: Mutex<HashMap<String, Subscribers<Message>>>,
}

/// Removes a pending entry however `send_and_wait` exits: response, timeout,
/// teardown, or the caller dropping the future.
struct PendingGuard<'a> {
    inner: &'a ChannelInner,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.id);
    }
}

//=========================================================================================
// Public handle
//=========================================================================================

/// A cheaply cloneable handle to one channel instance.
#[derive(Clone)]
pub struct DuplexChannel {
    inner: Arc<ChannelInner>,
}

impl DuplexChannel {
    pub fn new(transport: Arc<dyn MessageTransport>, config: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                transport,
                config,
                shared: Mutex::new(Shared {
                    state: ChannelState::Disconnected,
                    link: None,
                    connecting: None,
                    queue: VecDeque::new(),
                    reconnect_attempts: 0,
                    manual_close: false,
                    generation: 0,
                    reconnect_task: None,
                }),
                pending: Mutex::new(HashMap::new()),
                events: Subscribers::new(),
                handlers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.inner.shared.lock().state
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Messages waiting for a connection.
    pub fn queued_len(&self) -> usize {
        self.inner.shared.lock().queue.len()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Opens the connection. A failed first attempt leaves the channel in
    /// `Error` and is not retried; the caller decides what to do next. Callers
    /// arriving while an attempt is in flight share its outcome.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let (attempt, started) = {
            let mut shared = self.inner.shared.lock();
            if shared.state == ChannelState::Connected {
                return Ok(());
            }
            match &shared.connecting {
                Some(attempt) => (attempt.clone(), false),
                None => {
                    shared.manual_close = false;
                    if let Some(task) = shared.reconnect_task.take() {
                        task.abort();
                    }
                    shared.generation += 1;
                    shared.state = ChannelState::Connecting;
                    let attempt = self
                        .inner
                        .clone()
                        .open_first(shared.generation)
                        .boxed()
                        .shared();
                    shared.connecting = Some(attempt.clone());
                    (attempt, true)
                }
            }
        };

        if started {
            self.inner
                .events
                .emit(&ChannelEvent::StateChanged(ChannelState::Connecting));
            info!("Connecting control channel...");
        } else {
            debug!("Joining the connection attempt already in progress.");
        }
        attempt.await
    }

    /// Caller-initiated teardown. Cancels any scheduled reconnection, stops the
    /// heartbeat and rejects every pending request.
    pub fn disconnect(&self) {
        let changed = {
            let mut shared = self.inner.shared.lock();
            shared.manual_close = true;
            shared.generation += 1;
            shared.connecting = None;
            if let Some(task) = shared.reconnect_task.take() {
                task.abort();
            }
            if let Some(link) = shared.link.take() {
                link.cancel.cancel();
            }
            let changed = shared.state != ChannelState::Disconnected;
            shared.state = ChannelState::Disconnected;
            changed
        };

        self.inner.reject_pending();
        if changed {
            info!("Control channel disconnected.");
            self.inner
                .events
                .emit(&ChannelEvent::StateChanged(ChannelState::Disconnected));
        }
    }

    /// Best-effort send. Transmits immediately when connected, otherwise queues
    /// for delivery in FIFO order once a connection is (re)established.
    /// Returns the message id.
    pub fn send(&self, mut message: Message) -> String {
        let id = message.id.get_or_insert_with(new_message_id).clone();
        if message.timestamp == 0 {
            message.timestamp = now_ms();
        }
        self.inner.transmit_or_queue(message);
        id
    }

    /// Sends `message` and waits for the first inbound message with the same id.
    pub async fn send_and_wait(
        &self,
        mut message: Message,
        timeout: Duration,
    ) -> Result<Value, ChannelError> {
        let id = message.id.get_or_insert_with(new_message_id).clone();
        let (responder, response) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if pending.contains_key(&id) {
                return Err(ChannelError::DuplicateRequest(id));
            }
            pending.insert(
                id.clone(),
                PendingRequest {
                    responder,
                    registered_at: Instant::now(),
                },
            );
        }
        let _guard = PendingGuard {
            inner: &self.inner,
            id: id.clone(),
        };

        self.send(message);

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                warn!(id = %id, "Request timed out after {:?}", timeout);
                Err(ChannelError::Timeout { id, timeout })
            }
        }
    }

    /// [`send_and_wait`](Self::send_and_wait) with the configured default timeout.
    pub async fn request(&self, message: Message) -> Result<Value, ChannelError> {
        self.send_and_wait(message, self.inner.config.request_timeout)
            .await
    }

    /// Subscribes to every channel event.
    pub fn on<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(handler)
    }

    /// Subscribes to inbound messages of one type.
    pub fn on_message<F>(&self, kind: &str, handler: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .entry(kind.to_string())
            .or_default()
            .subscribe(handler)
    }
}

//=========================================================================================
// Connection lifecycle
//=========================================================================================

impl ChannelInner {
    async fn open_first(self: Arc<Self>, generation: u64) -> Result<(), ChannelError> {
        match self.transport.open().await {
            Ok((sink, stream)) => {
                if self.install(generation, sink, stream) {
                    Ok(())
                } else {
                    Err(ChannelError::Closed)
                }
            }
            Err(e) => {
                error!("Failed to open control channel: {}", e);
                let current = {
                    let mut shared = self.shared.lock();
                    let current = shared.generation == generation;
                    if current {
                        shared.state = ChannelState::Error;
                        shared.connecting = None;
                    }
                    current
                };
                if current {
                    self.events
                        .emit(&ChannelEvent::StateChanged(ChannelState::Error));
                    self.events.emit(&ChannelEvent::Error(e.to_string()));
                }
                Err(ChannelError::Connect(e))
            }
        }
    }

    /// Wires up a freshly opened connection, unless it was superseded while opening.
    fn install(self: &Arc<Self>, generation: u64, sink: FrameSink, stream: FrameStream) -> bool {
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<String>();
        let cancel = CancellationToken::new();

        let flushed = {
            let mut shared = self.shared.lock();
            if shared.generation != generation || shared.manual_close {
                debug!("Discarding superseded connection.");
                return false;
            }

            // Queued messages go ahead of anything sent after this point.
            let mut flushed = 0usize;
            while let Some(message) = shared.queue.pop_front() {
                match serde_json::to_string(&message) {
                    Ok(frame) => {
                        let _ = outbound.send(frame);
                        flushed += 1;
                    }
                    Err(e) => warn!("Dropping unencodable queued message: {}", e),
                }
            }

            shared.link = Some(Link {
                generation,
                outbound,
                cancel: cancel.clone(),
            });
            shared.state = ChannelState::Connected;
            shared.connecting = None;
            shared.reconnect_attempts = 0;
            shared.reconnect_task = None;
            flushed
        };

        tokio::spawn(write_loop(self.clone(), generation, sink, outbound_rx, cancel.clone()));
        tokio::spawn(read_loop(self.clone(), generation, stream, cancel.clone()));
        if !self.config.heartbeat_interval.is_zero() {
            tokio::spawn(heartbeat_loop(self.clone(), generation, cancel));
        }

        info!(flushed, "Control channel connected.");
        self.events
            .emit(&ChannelEvent::StateChanged(ChannelState::Connected));
        true
    }

    fn transmit_or_queue(&self, message: Message) {
        let mut shared = self.shared.lock();
        if shared.state == ChannelState::Connected {
            if let Some(link) = &shared.link {
                match serde_json::to_string(&message) {
                    Ok(frame) => {
                        if link.outbound.send(frame).is_ok() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(kind = %message.kind, "Dropping unencodable message: {}", e);
                        return;
                    }
                }
            }
        }
        debug!(kind = %message.kind, "Channel not connected; queueing message.");
        shared.queue.push_back(message);
    }

    /// Sends only on the given live connection; never queues.
    fn transmit_now(&self, generation: u64, message: &Message) -> bool {
        let shared = self.shared.lock();
        match &shared.link {
            Some(link) if link.generation == generation => serde_json::to_string(message)
                .map(|frame| link.outbound.send(frame).is_ok())
                .unwrap_or(false),
            _ => false,
        }
    }

    fn handle_frame(&self, frame: &str) {
        let message: Message = match serde_json::from_str(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return;
            }
        };

        if message.kind == kinds::PONG {
            debug!("Heartbeat acknowledged.");
            return;
        }

        if let Some(id) = message.id.as_deref() {
            let entry = self.pending.lock().remove(id);
            if let Some(request) = entry {
                let outcome = if message.kind == kinds::ERROR {
                    Err(server_error(&message))
                } else {
                    Ok(message.payload.clone().unwrap_or(Value::Null))
                };
                debug!(id, elapsed = ?request.registered_at.elapsed(), "Resolved pending request.");
                let _ = request.responder.send(outcome);
                return;
            }
        }

        self.events.emit(&ChannelEvent::Message(message.clone()));
        let handlers = self.handlers.lock().get(&message.kind).cloned();
        match handlers {
            Some(handlers) => handlers.emit(&message),
            None => debug!(kind = %message.kind, "No handler registered for message type."),
        }
    }

    /// Reacts to the connection of `generation` going away.
    fn handle_close(self: &Arc<Self>, generation: u64, reason: Option<String>) {
        let manual = {
            let mut shared = self.shared.lock();
            let is_current = shared
                .link
                .as_ref()
                .is_some_and(|link| link.generation == generation);
            if !is_current {
                return;
            }
            if let Some(link) = shared.link.take() {
                link.cancel.cancel();
            }
            if shared.manual_close {
                shared.state = ChannelState::Disconnected;
            }
            shared.manual_close
        };

        if manual {
            self.events
                .emit(&ChannelEvent::StateChanged(ChannelState::Disconnected));
            return;
        }

        match &reason {
            Some(reason) => warn!("Control channel lost: {}", reason),
            None => warn!("Control channel closed by the server."),
        }
        if let Some(reason) = reason {
            self.events.emit(&ChannelEvent::Error(reason));
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut shared = self.shared.lock();
        if shared.manual_close {
            return;
        }

        let attempt = shared.reconnect_attempts;
        if attempt >= self.config.max_reconnect_attempts {
            shared.state = ChannelState::Error;
            shared.reconnect_task = None;
            drop(shared);
            error!(attempts = attempt, "Giving up on reconnecting the control channel.");
            self.events
                .emit(&ChannelEvent::StateChanged(ChannelState::Error));
            self.events
                .emit(&ChannelEvent::ReconnectFailed { attempts: attempt });
            return;
        }

        let delay = reconnect_delay(&self.config, attempt);
        shared.reconnect_attempts = attempt + 1;
        shared.generation += 1;
        let generation = shared.generation;
        let was_reconnecting = shared.state == ChannelState::Reconnecting;
        shared.state = ChannelState::Reconnecting;

        let inner = self.clone();
        shared.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.reconnect(generation).await;
        }));
        drop(shared);

        info!(attempt = attempt + 1, ?delay, "Scheduling control channel reconnection.");
        if !was_reconnecting {
            self.events
                .emit(&ChannelEvent::StateChanged(ChannelState::Reconnecting));
        }
        self.events.emit(&ChannelEvent::Reconnecting {
            attempt: attempt + 1,
            delay,
        });
    }

    async fn reconnect(self: Arc<Self>, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        match self.transport.open().await {
            Ok((sink, stream)) => {
                if self.install(generation, sink, stream) {
                    info!("Control channel reconnected.");
                }
            }
            Err(e) => {
                if !self.is_current(generation) {
                    return;
                }
                warn!("Reconnection attempt failed: {}", e);
                self.events.emit(&ChannelEvent::Error(e.to_string()));
                self.schedule_reconnect();
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let shared = self.shared.lock();
        !shared.manual_close && shared.generation == generation
    }

    fn reject_pending(&self) {
        let drained: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, r)| r).collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Rejecting pending requests on teardown.");
        }
        for request in drained {
            let _ = request.responder.send(Err(ChannelError::Closed));
        }
    }
}

fn server_error(message: &Message) -> ChannelError {
    let payload = message.payload.clone().unwrap_or(Value::Null);
    let code = match payload.get("code") {
        Some(Value::String(code)) => code.clone(),
        Some(Value::Null) | None => "unknown".to_string(),
        Some(other) => other.to_string(),
    };
    let text = payload
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("server error")
        .to_string();
    ChannelError::Server {
        code,
        message: text,
    }
}

//=========================================================================================
// Connection tasks
//=========================================================================================

async fn write_loop(
    inner: Arc<ChannelInner>,
    generation: u64,
    mut sink: FrameSink,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbound.recv() => match next {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        inner.handle_close(generation, Some(e.to_string()));
                        return;
                    }
                }
                None => break,
            },
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    inner: Arc<ChannelInner>,
    generation: u64,
    mut stream: FrameStream,
    cancel: CancellationToken,
) {
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            frame = stream.next() => match frame {
                Some(Ok(frame)) => inner.handle_frame(&frame),
                Some(Err(e)) => break Some(e.to_string()),
                None => break None,
            },
        }
    };
    inner.handle_close(generation, reason);
}

async fn heartbeat_loop(inner: Arc<ChannelInner>, generation: u64, cancel: CancellationToken) {
    let period = inner.config.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let ping = Message::bare(kinds::PING).with_id(new_message_id());
                if !inner.transmit_now(generation, &ping) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{MemoryConnection, MemoryServer, MemoryTransport};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quiet_config() -> ChannelConfig {
        ChannelConfig {
            heartbeat_interval: Duration::from_secs(3600),
            reconnect_base: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            request_timeout: Duration::from_secs(5),
        }
    }

    fn channel_with(config: ChannelConfig) -> (DuplexChannel, MemoryTransport, MemoryServer) {
        let (transport, server) = MemoryTransport::new();
        let channel = DuplexChannel::new(Arc::new(transport.clone()), config);
        (channel, transport, server)
    }

    async fn connected(config: ChannelConfig) -> (DuplexChannel, MemoryTransport, MemoryServer, MemoryConnection) {
        let (channel, transport, mut server) = channel_with(config);
        channel.connect().await.unwrap();
        let connection = server.accept().await.unwrap();
        (channel, transport, server, connection)
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let config = quiet_config();
        let delays: Vec<u128> = (0..6)
            .map(|attempt| reconnect_delay(&config, attempt).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(reconnect_delay(&config, 40), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn queued_messages_flush_in_order_exactly_once() {
        let (channel, _transport, mut server) = channel_with(quiet_config());

        for n in 0..5 {
            channel.send(Message::new("note", json!({ "n": n })));
        }
        assert_eq!(channel.queued_len(), 5);

        channel.connect().await.unwrap();
        let mut connection = server.accept().await.unwrap();
        channel.send(Message::new("note", json!({ "n": 5 })));

        for n in 0..6 {
            let message = connection.recv_non_ping().await.unwrap();
            assert_eq!(message.payload, Some(json!({ "n": n })));
            assert!(message.id.is_some());
        }
        let extra = tokio::time::timeout(Duration::from_millis(50), connection.recv_non_ping()).await;
        assert!(extra.is_err(), "no message may be delivered twice");
        assert_eq!(channel.queued_len(), 0);
    }

    #[tokio::test]
    async fn send_and_wait_resolves_with_matching_response() {
        let (channel, _transport, _server, mut connection) = connected(quiet_config()).await;

        let responder = tokio::spawn(async move {
            let request = connection.recv_non_ping().await.unwrap();
            let id = request.id.clone().unwrap();
            connection.send(&Message::new("unrelated", json!({ "x": 1 })).with_id("other"));
            connection.send(&Message::new("session.started", json!({ "ok": true })).with_id(id));
            connection
        });

        let payload = channel
            .send_and_wait(Message::new("session.start", json!({})), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(payload, json!({ "ok": true }));
        assert_eq!(channel.pending_len(), 0);
        let _connection = responder.await.unwrap();
    }

    #[tokio::test]
    async fn error_frame_rejects_the_matching_request() {
        let (channel, _transport, _server, mut connection) = connected(quiet_config()).await;

        let responder = tokio::spawn(async move {
            let request = connection.recv_non_ping().await.unwrap();
            connection.send(
                &Message::new(kinds::ERROR, json!({ "code": 404, "message": "no passage" }))
                    .with_id(request.id.unwrap()),
            );
            connection
        });

        let err = channel
            .send_and_wait(Message::new("session.start", json!({})), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Server { ref code, .. } if code == "404"));
        let _connection = responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out_and_is_forgotten() {
        let (channel, _transport, _server, _connection) = connected(quiet_config()).await;

        let err = channel
            .send_and_wait(Message::bare("session.start").with_id("req-1"), Duration::from_millis(250))
            .await
            .unwrap_err();

        assert!(matches!(err, ChannelError::Timeout { ref id, .. } if id == "req-1"));
        assert_eq!(channel.pending_len(), 0);
        assert_eq!(channel.state(), ChannelState::Connected);
    }

    #[tokio::test]
    async fn malformed_frames_and_pongs_are_dropped() {
        let (channel, _transport, _server, connection) = connected(quiet_config()).await;

        let events = Arc::new(AtomicUsize::new(0));
        let counter = events.clone();
        let _all = channel.on(move |event| {
            if matches!(event, ChannelEvent::Message(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let _typed = channel.on_message("progress.ack", move |message| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(message.clone());
            }
        });

        connection.send_raw("{ not json");
        connection.send(&Message::bare(kinds::PONG));
        connection.send(&Message::new("progress.ack", json!({ "index": 3 })));

        let message = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert_eq!(message.payload, Some(json!({ "index": 3 })));
        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ChannelState::Connected);
    }

    #[tokio::test]
    async fn failed_first_connect_is_not_retried() {
        let (channel, transport, _server) = channel_with(quiet_config());
        transport.refuse_next(1);

        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, ChannelError::Connect(_)));
        assert_eq!(channel.state(), ChannelState::Error);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_backoff_grows_then_resets_after_success() {
        let (channel, transport, mut server, connection) = connected(quiet_config()).await;

        let delays = Arc::new(Mutex::new(Vec::new()));
        let sink = delays.clone();
        let _sub = channel.on(move |event| {
            if let ChannelEvent::Reconnecting { delay, .. } = event {
                sink.lock().push(delay.as_millis());
            }
        });

        transport.refuse_next(3);
        connection.close();
        let connection = server.accept().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Connected);
        assert_eq!(*delays.lock(), vec![100, 200, 400, 800]);

        connection.fail("reset by peer");
        let _connection = server.accept().await.unwrap();
        assert_eq!(*delays.lock(), vec![100, 200, 400, 800, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let config = ChannelConfig {
            max_reconnect_attempts: 2,
            ..quiet_config()
        };
        let (channel, transport, _server, connection) = connected(config).await;

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let _sub = channel.on(move |event| {
            if let ChannelEvent::ReconnectFailed { attempts } = event {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(*attempts);
                }
            }
        });

        transport.refuse_next(10);
        connection.close();

        assert_eq!(rx.await.unwrap(), 2);
        assert_eq!(channel.state(), ChannelState::Error);
        assert_eq!(transport.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_reconnection_and_rejects_pending() {
        let (channel, transport, _server, connection) = connected(quiet_config()).await;

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .send_and_wait(Message::bare("session.start"), Duration::from_secs(60))
                    .await
            })
        };
        while channel.pending_len() == 0 {
            tokio::task::yield_now().await;
        }

        connection.close();
        while channel.state() != ChannelState::Reconnecting {
            tokio::task::yield_now().await;
        }
        channel.disconnect();

        assert!(matches!(waiter.await.unwrap(), Err(ChannelError::Closed)));
        assert_eq!(channel.pending_len(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.attempts(), 1);
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_while_connected() {
        let config = ChannelConfig {
            heartbeat_interval: Duration::from_secs(10),
            ..quiet_config()
        };
        let (_channel, _transport, _server, mut connection) = connected(config).await;

        let first = connection.recv().await.unwrap();
        assert_eq!(first.kind, kinds::PING);
        let second = connection.recv().await.unwrap();
        assert_eq!(second.kind, kinds::PING);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_sent_while_reconnecting_flush_in_order_exactly_once() {
        let (channel, _transport, mut server, connection) = connected(quiet_config()).await;

        connection.close();
        while channel.state() != ChannelState::Reconnecting {
            tokio::task::yield_now().await;
        }
        for n in 0..4 {
            channel.send(Message::new("note", json!({ "n": n })));
        }
        assert_eq!(channel.queued_len(), 4);

        let mut connection = server.accept().await.unwrap();
        for n in 0..4 {
            let message = connection.recv_non_ping().await.unwrap();
            assert_eq!(message.payload, Some(json!({ "n": n })));
        }
        let extra = tokio::time::timeout(Duration::from_millis(50), connection.recv_non_ping()).await;
        assert!(extra.is_err(), "no message may be delivered twice");
        assert_eq!(channel.queued_len(), 0);
        assert_eq!(channel.state(), ChannelState::Connected);
    }

    /// Holds every `open()` until the test lets it through.
    struct GatedTransport {
        inner: MemoryTransport,
        gate: Arc<tokio::sync::Semaphore>,
        opens: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MessageTransport for GatedTransport {
        async fn open(&self) -> reading_session_core::ports::PortResult<(FrameSink, FrameStream)> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await;
            self.inner.open().await
        }
    }

    fn gated_channel() -> (DuplexChannel, Arc<GatedTransport>, MemoryServer) {
        let (inner, server) = MemoryTransport::new();
        let transport = Arc::new(GatedTransport {
            inner,
            gate: Arc::new(tokio::sync::Semaphore::new(0)),
            opens: AtomicUsize::new(0),
        });
        let channel = DuplexChannel::new(transport.clone(), quiet_config());
        (channel, transport, server)
    }

    async fn connect_twice(channel: &DuplexChannel, transport: &GatedTransport) -> [Result<(), ChannelError>; 2] {
        let first = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.connect().await })
        };
        let second = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.connect().await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(channel.state(), ChannelState::Connecting);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);

        transport.gate.add_permits(1);
        let first = tokio::time::timeout(Duration::from_secs(2), first).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), second).await.unwrap().unwrap();
        [first, second]
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_attempt() {
        let (channel, transport, mut server) = gated_channel();

        let outcomes = connect_twice(&channel, &transport).await;
        assert!(outcomes.iter().all(Result::is_ok));
        assert_eq!(channel.state(), ChannelState::Connected);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
        assert!(server.accept().await.is_some());
    }

    #[tokio::test]
    async fn concurrent_connects_share_a_failed_attempt() {
        let (channel, transport, _server) = gated_channel();
        transport.inner.refuse_next(1);

        let outcomes = connect_twice(&channel, &transport).await;
        assert!(outcomes
            .iter()
            .all(|outcome| matches!(outcome, Err(ChannelError::Connect(_)))));
        assert_eq!(channel.state(), ChannelState::Error);
        assert_eq!(transport.inner.attempts(), 1);
    }
}
