//! A single WebSocket endpoint with ping/pong liveness and bounded queues.
//!
//! Each peer owns two tasks: a read pump feeding the inbound queue and a
//! write pump draining the outbound queue and emitting pings. Both run under
//! one `CancellationToken` (the peer lifetime), a child of the token passed
//! to [`Peer::spawn`]. Whichever pump fails first cancels the lifetime and
//! the other follows.

use std::fmt::Display;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::config::PeerSettings;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Sent when an inbound frame exceeds the size limit. 1006 itself is
/// reserved for local use and may not appear in a close frame.
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;

/// Transport-neutral view of an incoming WebSocket message.
#[derive(Debug)]
pub enum WireFrame {
    Data(Bytes),
    Ping,
    Pong,
    Close(Option<u16>),
    Other,
}

/// Bridges the axum (client side) and tungstenite (upstream side) message
/// types so both sides share the same pumps.
pub trait WireMessage: Sized + Send + 'static {
    fn into_wire(self) -> WireFrame;
    /// Valid UTF-8 goes out as a text frame, anything else as binary.
    fn data(frame: Bytes) -> Self;
    fn ping() -> Self;
    fn close(code: u16, reason: &str) -> Self;
}

/// Socket errors as seen by the read pump.
pub trait WireError: Display + Send + 'static {
    /// The socket refused a frame or message over its configured size limit.
    fn is_too_large(&self) -> bool;
}

impl WireError for tokio_tungstenite::tungstenite::Error {
    fn is_too_large(&self) -> bool {
        matches!(self, tokio_tungstenite::tungstenite::Error::Capacity(_))
    }
}

impl WireError for axum::Error {
    fn is_too_large(&self) -> bool {
        std::error::Error::source(self)
            .and_then(|e| e.downcast_ref::<tokio_tungstenite::tungstenite::Error>())
            .is_some_and(WireError::is_too_large)
    }
}

impl WireMessage for axum::extract::ws::Message {
    fn into_wire(self) -> WireFrame {
        use axum::extract::ws::Message;
        match self {
            Message::Text(text) => WireFrame::Data(Bytes::copy_from_slice(text.as_str().as_bytes())),
            Message::Binary(data) => WireFrame::Data(data),
            Message::Ping(_) => WireFrame::Ping,
            Message::Pong(_) => WireFrame::Pong,
            Message::Close(frame) => WireFrame::Close(frame.map(|f| f.code)),
        }
    }

    fn data(frame: Bytes) -> Self {
        use axum::extract::ws::Message;
        match String::from_utf8(frame.to_vec()) {
            Ok(text) => Message::Text(text.into()),
            Err(e) => Message::Binary(Bytes::from(e.into_bytes())),
        }
    }

    fn ping() -> Self {
        axum::extract::ws::Message::Ping(Bytes::new())
    }

    fn close(code: u16, reason: &str) -> Self {
        axum::extract::ws::Message::Close(Some(axum::extract::ws::CloseFrame {
            code,
            reason: reason.to_owned().into(),
        }))
    }
}

impl WireMessage for tokio_tungstenite::tungstenite::Message {
    fn into_wire(self) -> WireFrame {
        use tokio_tungstenite::tungstenite::Message;
        match self {
            Message::Text(text) => WireFrame::Data(Bytes::copy_from_slice(text.as_str().as_bytes())),
            Message::Binary(data) => WireFrame::Data(data),
            Message::Ping(_) => WireFrame::Ping,
            Message::Pong(_) => WireFrame::Pong,
            Message::Close(frame) => WireFrame::Close(frame.map(|f| u16::from(f.code))),
            Message::Frame(_) => WireFrame::Other,
        }
    }

    fn data(frame: Bytes) -> Self {
        use tokio_tungstenite::tungstenite::Message;
        match String::from_utf8(frame.to_vec()) {
            Ok(text) => Message::Text(text.into()),
            Err(e) => Message::Binary(Bytes::from(e.into_bytes())),
        }
    }

    fn ping() -> Self {
        tokio_tungstenite::tungstenite::Message::Ping(Bytes::new())
    }

    fn close(code: u16, reason: &str) -> Self {
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;
        tokio_tungstenite::tungstenite::Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        }))
    }
}

/// Cloneable sending side of a peer. Shared by the router tasks.
#[derive(Clone)]
pub struct PeerHandle {
    name: Arc<str>,
    outbound: mpsc::Sender<Bytes>,
    lifetime: CancellationToken,
    close_code: Arc<OnceLock<u16>>,
}

impl PeerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a frame. Suspends while the queue is full; once the peer's
    /// lifetime has ended the frame is dropped and `false` is returned.
    pub async fn send_raw(&self, frame: Bytes) -> bool {
        tokio::select! {
            biased;
            _ = self.lifetime.cancelled() => false,
            res = self.outbound.send(frame) => res.is_ok(),
        }
    }

    /// Idempotent. Frames already queued are still flushed by the write pump.
    pub fn close(&self) {
        self.close_with(CLOSE_NORMAL);
    }

    /// The first close code wins.
    pub fn close_with(&self, code: u16) {
        let _ = self.close_code.set(code);
        self.lifetime.cancel();
    }

    /// Resolves once the peer is terminally done.
    pub fn done(&self) -> WaitForCancellationFuture<'_> {
        self.lifetime.cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.lifetime.is_cancelled()
    }
}

/// Inbound frames in arrival order. Ends when the peer terminates.
pub struct Inbound {
    rx: mpsc::Receiver<Bytes>,
}

impl Inbound {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Owning side of a peer: the pump tasks and, until taken, the inbound queue.
pub struct Peer {
    handle: PeerHandle,
    inbound: Option<Inbound>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    settings: PeerSettings,
}

impl Peer {
    /// Start the pumps for an already-established socket.
    pub fn spawn<S, M, E>(
        name: impl Into<Arc<str>>,
        socket: S,
        settings: &PeerSettings,
        parent: &CancellationToken,
    ) -> Self
    where
        S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Send + 'static,
        M: WireMessage,
        E: WireError,
    {
        let name: Arc<str> = name.into();
        let lifetime = parent.child_token();
        let close_code = Arc::new(OnceLock::new());
        let (out_tx, out_rx) = mpsc::channel(settings.outbound_capacity);
        let (in_tx, in_rx) = mpsc::channel(settings.inbound_capacity);

        let (sink, stream) = socket.split::<M>();
        let pump = PumpCtx {
            name: name.clone(),
            lifetime: lifetime.clone(),
            close_code: close_code.clone(),
            settings: settings.clone(),
        };
        let reader = tokio::spawn(read_pump::<_, M, E>(pump.clone(), stream, in_tx));
        let writer = tokio::spawn(write_pump::<_, M, E>(pump, sink, out_rx));

        Self {
            handle: PeerHandle {
                name,
                outbound: out_tx,
                lifetime,
                close_code,
            },
            inbound: Some(Inbound { rx: in_rx }),
            reader,
            writer,
            settings: settings.clone(),
        }
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn handle(&self) -> PeerHandle {
        self.handle.clone()
    }

    /// The inbound queue can be taken once.
    pub fn take_inbound(&mut self) -> Option<Inbound> {
        self.inbound.take()
    }

    pub async fn send_raw(&self, frame: Bytes) -> bool {
        self.handle.send_raw(frame).await
    }

    pub fn close(&self) {
        self.handle.close();
    }

    pub fn done(&self) -> WaitForCancellationFuture<'_> {
        self.handle.done()
    }

    /// Close and wait for both pumps, giving the write pump up to one write
    /// wait to flush and send the close frame before it is aborted.
    pub async fn shutdown(self) {
        self.handle.close();
        let Peer {
            handle,
            reader,
            mut writer,
            settings,
            ..
        } = self;

        if time::timeout(settings.write_wait, &mut writer).await.is_err() {
            tracing::debug!(peer = %handle.name, "write pump did not finish in time; aborting");
            writer.abort();
        }
        let _ = reader.await;
    }
}

#[derive(Clone)]
struct PumpCtx {
    name: Arc<str>,
    lifetime: CancellationToken,
    close_code: Arc<OnceLock<u16>>,
    settings: PeerSettings,
}

async fn read_pump<St, M, E>(ctx: PumpCtx, mut stream: St, inbound: mpsc::Sender<Bytes>)
where
    St: Stream<Item = Result<M, E>> + Unpin,
    M: WireMessage,
    E: WireError,
{
    let name = &ctx.name;
    let mut deadline = Instant::now() + ctx.settings.pong_wait;

    loop {
        let next = tokio::select! {
            _ = ctx.lifetime.cancelled() => break,
            next = time::timeout_at(deadline, stream.next()) => next,
        };

        let msg = match next {
            Err(_) => {
                tracing::debug!(peer = %name, "read deadline exceeded");
                break;
            }
            Ok(None) => {
                tracing::debug!(peer = %name, "stream ended");
                break;
            }
            Ok(Some(Err(e))) if e.is_too_large() => {
                tracing::warn!(peer = %name, error = %e, "inbound frame too large");
                let _ = ctx.close_code.set(CLOSE_MESSAGE_TOO_BIG);
                break;
            }
            Ok(Some(Err(e))) => {
                tracing::debug!(peer = %name, error = %e, "read error");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg.into_wire() {
            WireFrame::Data(frame) => {
                if frame.len() > ctx.settings.max_message_size {
                    tracing::warn!(peer = %name, size = frame.len(), "inbound frame too large");
                    let _ = ctx.close_code.set(CLOSE_MESSAGE_TOO_BIG);
                    break;
                }
                tokio::select! {
                    _ = ctx.lifetime.cancelled() => break,
                    res = inbound.send(frame) => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
            WireFrame::Pong => deadline = Instant::now() + ctx.settings.pong_wait,
            WireFrame::Close(code) => {
                log_close(name, code);
                break;
            }
            WireFrame::Ping | WireFrame::Other => {}
        }
    }

    ctx.lifetime.cancel();
}

async fn write_pump<Si, M, E>(ctx: PumpCtx, mut sink: Si, mut outbound: mpsc::Receiver<Bytes>)
where
    Si: Sink<M, Error = E> + Unpin,
    M: WireMessage,
    E: WireError,
{
    let name = &ctx.name;
    let period = ctx.settings.ping_period;
    let mut ping = time::interval_at(Instant::now() + period, period);

    loop {
        let msg = tokio::select! {
            _ = ctx.lifetime.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => M::data(frame),
                None => break,
            },
            _ = ping.tick() => M::ping(),
        };

        match time::timeout(ctx.settings.write_wait, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(peer = %name, error = %e, "write error");
                break;
            }
            Err(_) => {
                tracing::debug!(peer = %name, "write deadline exceeded");
                break;
            }
        }
    }

    ctx.lifetime.cancel();

    // Flush what was queued before the close, then send the close frame.
    outbound.close();
    let code = ctx.close_code.get().copied().unwrap_or(CLOSE_NORMAL);
    let drain = async {
        while let Some(frame) = outbound.recv().await {
            if sink.send(M::data(frame)).await.is_err() {
                return;
            }
        }
        let _ = sink.send(M::close(code, "")).await;
        let _ = sink.close().await;
    };
    if time::timeout(ctx.settings.write_wait, drain).await.is_err() {
        tracing::debug!(peer = %name, "close handshake timed out");
    }
}

fn log_close(name: &str, code: Option<u16>) {
    match code {
        Some(CLOSE_GOING_AWAY) | Some(CLOSE_ABNORMAL) => {
            tracing::debug!(peer = %name, ?code, "peer closed")
        }
        _ => tracing::info!(peer = %name, ?code, "unexpected close"),
    }
}
