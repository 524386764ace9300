//! End-to-end tests of the WebSocket and HTTP adapters against a local axum server.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use reader_lib::{
    adapters::{HttpChunkSource, LogSessionSink, SimulatedClock, WsTransport},
    channel::{ChannelConfig, ChannelEvent, DuplexChannel, Message},
    session::{SessionConfig, SessionOrchestrator, SessionPorts},
    streaming::{BufferConfig, StreamBuffer},
};
use reading_session_core::domain::{ChannelState, ReadingState};
use reading_session_core::ports::{ChunkSource, PortError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

//=========================================================================================
// Test server
//=========================================================================================

async fn spawn_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());

    let app = Router::new()
        .route("/ws", get(upgrade))
        .route("/stream/metadata", get(metadata))
        .route("/stream/chunks/{n}", get(chunk))
        .with_state(base.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    base
}

async fn upgrade(ws: WebSocketUpgrade, State(base): State<String>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, base))
}

/// Answers pings and session starts; ignores everything else.
async fn serve_socket(mut socket: WebSocket, base: String) {
    while let Some(Ok(frame)) = socket.recv().await {
        let WsMessage::Text(text) = frame else {
            continue;
        };
        let Ok(message) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };
        let reply = match message["type"].as_str() {
            Some("ping") => json!({"type": "pong"}),
            Some("session.start") => json!({
                "type": "session.started",
                "id": message["id"],
                "payload": {
                    "sessionId": "it-1",
                    "audioUrl": format!("{}/stream", base),
                    "wordTimings": [
                        {"word": "Hello", "start": 0.0, "end": 0.4},
                        {"word": "world", "start": 0.4, "end": 0.9}
                    ]
                }
            }),
            _ => continue,
        };
        if socket.send(WsMessage::Text(reply.to_string().into())).await.is_err() {
            break;
        }
    }
}

async fn metadata() -> Json<Value> {
    Json(json!({
        "streamId": "it-stream",
        "totalDurationSeconds": 12.5,
        "totalChunks": 3,
        "chunkDurationSeconds": 5.0,
        "format": "mp3",
        "sampleRate": 24000,
        "bitrate": 64000,
        "channels": 1
    }))
}

/// Echoes the requested range so the client's addressing can be checked.
async fn chunk(Path(n): Path<u32>, headers: HeaderMap) -> Result<String, StatusCode> {
    if n >= 3 {
        return Err(StatusCode::NOT_FOUND);
    }
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("none");
    Ok(format!("chunk {} {}", n, range))
}

fn ws_url(base: &str) -> String {
    format!("{}/ws", base.replacen("http://", "ws://", 1))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

//=========================================================================================
// Tests
//=========================================================================================

#[tokio::test]
async fn request_round_trips_over_websocket() {
    let base = spawn_server().await;
    let channel = DuplexChannel::new(Arc::new(WsTransport::new(ws_url(&base))), ChannelConfig::default());
    channel.connect().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Connected);

    let payload = channel
        .request(Message::new("session.start", json!({"passageText": "Hello world"})))
        .await
        .unwrap();
    assert_eq!(payload["sessionId"], "it-1");
    assert_eq!(channel.pending_len(), 0);

    channel.disconnect();
    assert_eq!(channel.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn heartbeat_pongs_never_reach_handlers() {
    let base = spawn_server().await;
    let channel = DuplexChannel::new(
        Arc::new(WsTransport::new(ws_url(&base))),
        ChannelConfig {
            heartbeat_interval: Duration::from_millis(20),
            ..ChannelConfig::default()
        },
    );

    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    let _subscription = channel.on(move |event| {
        if matches!(event, ChannelEvent::Message(_)) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    channel.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(channel.state(), ChannelState::Connected);
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    channel.disconnect();
}

#[tokio::test]
async fn chunks_are_range_addressed() {
    let base = spawn_server().await;
    let source = HttpChunkSource::new(Duration::from_secs(5)).unwrap();
    let stream_url = format!("{}/stream", base);

    let metadata = source.fetch_metadata(&stream_url).await.unwrap();
    assert_eq!(metadata.total_chunks, 3);
    assert_eq!(metadata.chunk_size_bytes(), 40_000);

    let data = source.fetch_chunk(&stream_url, &metadata, 1).await.unwrap();
    assert_eq!(&data[..], b"chunk 1 bytes=40000-79999");

    let missing = source.fetch_chunk(&stream_url, &metadata, 7).await.unwrap_err();
    assert!(matches!(missing, PortError::NotFound(_)));
}

#[tokio::test]
async fn session_starts_over_websocket_and_http() {
    let base = spawn_server().await;
    let channel = DuplexChannel::new(Arc::new(WsTransport::new(ws_url(&base))), ChannelConfig::default());
    channel.connect().await.unwrap();

    let buffer = StreamBuffer::new(
        Arc::new(HttpChunkSource::new(Duration::from_secs(5)).unwrap()),
        BufferConfig::default(),
    );
    let clock = Arc::new(SimulatedClock::new());
    let orchestrator = SessionOrchestrator::new(
        channel.clone(),
        buffer.clone(),
        SessionPorts {
            playback: clock.clone(),
            sink: Arc::new(LogSessionSink),
            speech: None,
        },
        SessionConfig::default(),
    );

    orchestrator.start_reading("Hello world").await.unwrap();
    let state = orchestrator.snapshot();
    assert_eq!(state.reading_state, ReadingState::Reading);
    assert_eq!(state.session_id.as_deref(), Some("it-1"));
    assert_eq!(state.word_timings.len(), 2);
    assert!(clock.is_playing());

    // An empty buffer prefetches ahead, which covers the whole three-chunk stream.
    wait_until(|| buffer.cached_len() == 3).await;
    let chunk = buffer.get_chunk(2).await.unwrap();
    assert_eq!(chunk.duration, 2.5);
    assert_eq!(&chunk.data[..], b"chunk 2 bytes=80000-119999");

    orchestrator.on_time_update(0.5);
    assert_eq!(orchestrator.snapshot().current_word_index, Some(1));

    orchestrator.shutdown().await;
    assert!(buffer.metadata().is_none());
    assert!(!clock.is_playing());
    channel.disconnect();
}
