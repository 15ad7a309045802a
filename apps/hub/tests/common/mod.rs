#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use hub::config::{Config, PeerSettings};
use hub::gates::GateRegistry;
use hub::AppState;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bind `app` on an ephemeral port and serve it in the background.
async fn spawn_server(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

// ---------------------------------------------------------------------------
// Token resolver
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct ResolverState {
    tokens: Arc<HashMap<String, String>>,
    calls: Arc<AtomicUsize>,
    gate: Option<Arc<Semaphore>>,
}

/// Fake token resolver: known public tokens map to internal tokens, anything
/// else is a 404.
pub struct MockResolver {
    pub addr: SocketAddr,
    calls: Arc<AtomicUsize>,
    gate: Option<Arc<Semaphore>>,
}

impl MockResolver {
    pub async fn start(tokens: &[(&str, &str)]) -> Self {
        Self::start_inner(tokens, None).await
    }

    /// Every request waits for a permit from [`MockResolver::release`].
    pub async fn start_blocked(tokens: &[(&str, &str)]) -> Self {
        Self::start_inner(tokens, Some(Arc::new(Semaphore::new(0)))).await
    }

    async fn start_inner(tokens: &[(&str, &str)], gate: Option<Arc<Semaphore>>) -> Self {
        let calls = Arc::new(AtomicUsize::new(0));
        let state = ResolverState {
            tokens: Arc::new(
                tokens
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            calls: calls.clone(),
            gate: gate.clone(),
        };
        let app = Router::new()
            .route("/resolve", post(resolve))
            .with_state(state);

        Self {
            addr: spawn_server(app).await,
            calls,
            gate,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/resolve", self.addr)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }
}

async fn resolve(State(state): State<ResolverState>, body: String) -> Response {
    state.calls.fetch_add(1, Ordering::SeqCst);
    if let Some(gate) = &state.gate {
        let _permit = gate.acquire().await;
    }
    match state.tokens.get(&body) {
        Some(internal) => (StatusCode::OK, internal.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// ---------------------------------------------------------------------------
// Upstream channel
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum UpstreamEvent {
    Connected(HeaderMap),
    Frame(String),
    Closed,
}

#[derive(Debug, Clone)]
pub enum UpstreamCommand {
    Send(String),
    Close,
    /// Stop reading the socket, so pings go unanswered.
    Stall,
}

#[derive(Clone)]
struct UpstreamState {
    events: mpsc::UnboundedSender<UpstreamEvent>,
    commands: broadcast::Sender<UpstreamCommand>,
}

/// Fake upstream channel server. `/ws` accepts upgrades and reports what it
/// sees; every other path is a 404.
pub struct MockUpstream {
    pub addr: SocketAddr,
    events: mpsc::UnboundedReceiver<UpstreamEvent>,
    commands: broadcast::Sender<UpstreamCommand>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands, _) = broadcast::channel(64);
        let state = UpstreamState {
            events: events_tx,
            commands: commands.clone(),
        };
        let app = Router::new().route("/ws", get(upstream_ws)).with_state(state);

        Self {
            addr: spawn_server(app).await,
            events,
            commands,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn missing_url(&self) -> String {
        format!("ws://{}/missing", self.addr)
    }

    pub fn send(&self, text: &str) {
        let _ = self.commands.send(UpstreamCommand::Send(text.to_string()));
    }

    pub fn close(&self) {
        let _ = self.commands.send(UpstreamCommand::Close);
    }

    pub fn stall(&self) {
        let _ = self.commands.send(UpstreamCommand::Stall);
    }

    pub async fn next_event(&mut self) -> UpstreamEvent {
        time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for upstream event")
            .expect("upstream event stream ended")
    }

    pub async fn expect_connected(&mut self) -> HeaderMap {
        match self.next_event().await {
            UpstreamEvent::Connected(headers) => headers,
            other => panic!("expected connection, got {other:?}"),
        }
    }

    pub async fn expect_frame(&mut self) -> String {
        match self.next_event().await {
            UpstreamEvent::Frame(text) => text,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    pub async fn expect_closed(&mut self) {
        match self.next_event().await {
            UpstreamEvent::Closed => {}
            other => panic!("expected close, got {other:?}"),
        }
    }

    /// Assert nothing is reported for a short while.
    pub async fn expect_quiet(&mut self) {
        let next = time::timeout(Duration::from_millis(200), self.events.recv()).await;
        assert!(next.is_err(), "expected no upstream event, got {next:?}");
    }
}

async fn upstream_ws(
    State(state): State<UpstreamState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| upstream_session(state, headers, socket))
}

async fn upstream_session(state: UpstreamState, headers: HeaderMap, mut socket: WebSocket) {
    let mut commands = state.commands.subscribe();
    let _ = state.events.send(UpstreamEvent::Connected(headers));

    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = state.events.send(UpstreamEvent::Frame(text.to_string()));
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            cmd = commands.recv() => match cmd {
                Ok(UpstreamCommand::Send(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(UpstreamCommand::Close) | Err(_) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Ok(UpstreamCommand::Stall) => {
                    std::future::pending::<()>().await;
                    return;
                }
            },
        }
    }

    let _ = state.events.send(UpstreamEvent::Closed);
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

pub fn test_config(resolver_url: String) -> Config {
    Config {
        gates_file: "unused.yaml".into(),
        resolver_url,
        port: 0,
        handshake_timeout: Duration::from_secs(3),
        peer: PeerSettings::default(),
    }
}

/// Serve the hub with the given gates YAML. Returns (addr, state).
pub async fn start_hub(gates_yaml: &str, config: Config) -> (SocketAddr, AppState) {
    let gates = GateRegistry::from_yaml(gates_yaml).expect("valid gates");
    let state = AppState::new(config, gates);
    let addr = spawn_server(hub::app(state.clone())).await;
    (addr, state)
}

/// Gate `g` with `chan_1` and `chan_2` pointing at the given URLs.
pub fn two_channel_gate(chan_1: &str, chan_2: &str) -> String {
    format!(
        "gates:\n  g:\n    channels:\n      chan_1:\n        url: {chan_1}\n      chan_2:\n        url: {chan_2}\n"
    )
}

// ---------------------------------------------------------------------------
// Client helpers
// ---------------------------------------------------------------------------

pub async fn connect(addr: SocketAddr, gate: &str, headers: &[(&str, &str)]) -> Client {
    let mut request = format!("ws://{addr}/ws/{gate}")
        .into_client_request()
        .expect("client request");
    for (name, value) in headers {
        request.headers_mut().insert(
            tungstenite::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            value.parse().unwrap(),
        );
    }
    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("ws connect");
    ws
}

pub async fn send_text(client: &mut Client, text: &str) {
    client
        .send(tungstenite::Message::Text(text.to_string().into()))
        .await
        .expect("send");
}

pub async fn recv_text(client: &mut Client) -> String {
    loop {
        let msg = time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timeout")
            .expect("stream ended")
            .expect("read error");
        match msg {
            tungstenite::Message::Text(text) => return text.to_string(),
            tungstenite::Message::Close(frame) => panic!("expected text, got close {frame:?}"),
            _ => {}
        }
    }
}

pub async fn recv_json(client: &mut Client) -> serde_json::Value {
    serde_json::from_str(&recv_text(client).await).expect("parse frame")
}

/// Read the next `_control` frame and return its payload.
pub async fn recv_control(client: &mut Client) -> serde_json::Value {
    let frame = recv_json(client).await;
    assert_eq!(frame["channel"], "_control", "not a control frame: {frame}");
    frame["payload"].clone()
}

/// Wait for the hub to close the connection, skipping anything before it.
pub async fn expect_closed(client: &mut Client) -> Option<u16> {
    loop {
        let next = time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for close");
        match next {
            Some(Ok(tungstenite::Message::Close(frame))) => {
                return frame.map(|f| u16::from(f.code));
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}
