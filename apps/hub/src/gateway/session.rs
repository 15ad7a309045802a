//! Session supervisor: authenticate the client, dial every channel of its
//! gate, route until any participant goes away, then close everything once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::WebSocket;
use axum::http::HeaderMap;
use futures_util::future::{join_all, try_join_all};
use meh_common::id::{prefix, prefixed_ulid};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::HubError;
use crate::gates::Gate;
use crate::AppState;

use super::peer::{Inbound, Peer, CLOSE_GOING_AWAY};
use super::router;
use super::upstream::{dial, upstream_headers};

/// Counts a live session for as long as it is held.
struct ActiveSession(Arc<AtomicUsize>);

impl ActiveSession {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Drive one upgraded client connection to completion.
pub async fn serve(state: AppState, gate: Arc<Gate>, socket: WebSocket, headers: HeaderMap) {
    let session_id = prefixed_ulid(prefix::SESSION);
    let started = Instant::now();
    let _active = ActiveSession::enter(&state.active_sessions);
    let scope = state.shutdown.child_token();

    // The client is not under `scope`, so a going-away code can be set
    // before its pumps stop.
    let mut client = Peer::spawn("client", socket, &state.config.peer, &CancellationToken::new());
    let Some(mut client_inbound) = client.take_inbound() else {
        return;
    };

    tracing::info!(%session_id, gate = %gate.name, "client connected");

    let handshake = tokio::select! {
        res = handshake(&state, &gate, &headers, &mut client_inbound, &scope) => res,
        _ = client.done() => Err(HubError::ws("client left during handshake")),
        _ = scope.cancelled() => Err(HubError::ws("hub is shutting down")),
    };

    let mut channels = match handshake {
        Ok(channels) => channels,
        Err(err) => {
            err.log(&session_id);
            client.send_raw(err.control_frame()).await;
            if state.shutdown.is_cancelled() {
                client.handle().close_with(CLOSE_GOING_AWAY);
            }
            scope.cancel();
            client.shutdown().await;
            tracing::info!(
                %session_id,
                gate = %gate.name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "session refused"
            );
            return;
        }
    };

    let mut routes = HashMap::with_capacity(channels.len());
    for (label, peer) in channels.iter_mut() {
        if let Some(inbound) = peer.take_inbound() {
            routes.insert(label.clone(), (peer.handle(), inbound));
        }
    }

    tracing::info!(%session_id, gate = %gate.name, channels = routes.len(), "session routing");

    let routed = router::route(
        client.handle(),
        client_inbound,
        routes,
        &scope,
        state.config.peer.max_message_size,
    )
    .await;

    if let Err(err) = &routed {
        err.log(&session_id);
        client.send_raw(err.control_frame()).await;
    }
    if state.shutdown.is_cancelled() {
        client.handle().close_with(CLOSE_GOING_AWAY);
    }

    scope.cancel();
    let peers = channels.into_values().chain(std::iter::once(client));
    join_all(peers.map(Peer::shutdown)).await;

    tracing::info!(
        %session_id,
        gate = %gate.name,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "session closed"
    );
}

/// Steps between upgrade and routing, all bounded by one handshake deadline:
/// read the public token, resolve it, then dial every channel in parallel.
/// No channel is dialed before the resolver has answered.
async fn handshake(
    state: &AppState,
    gate: &Gate,
    headers: &HeaderMap,
    client_inbound: &mut Inbound,
    scope: &CancellationToken,
) -> Result<HashMap<String, Peer>, HubError> {
    let deadline = Instant::now() + state.config.handshake_timeout;

    let frame = match time::timeout_at(deadline, client_inbound.recv()).await {
        Err(_) => return Err(HubError::bad_input("timeout waiting for authentication message")),
        Ok(None) => return Err(HubError::ws("client closed before authenticating")),
        Ok(Some(frame)) => frame,
    };
    let public_token = String::from_utf8(frame.to_vec())
        .map_err(|_| HubError::bad_input("authentication message is not valid UTF-8"))?;
    if public_token.is_empty() {
        return Err(HubError::unauthorized("missing authentication token"));
    }

    let internal_token = time::timeout_at(
        deadline,
        state.resolver.resolve_public_token(&public_token),
    )
    .await
    .map_err(|_| HubError::internal("timeout resolving authentication token"))??;

    let upstream = upstream_headers(headers, &internal_token)?;
    let settings = &state.config.peer;
    let dial_scope = scope.child_token();

    let dials = gate.channels.iter().map(|(label, channel)| {
        let upstream = &upstream;
        let dial_scope = &dial_scope;
        async move {
            let peer = time::timeout_at(deadline, dial(label, channel, upstream, settings, dial_scope))
                .await
                .map_err(|_| {
                    HubError::ws("channel dial timed out")
                        .with_details(serde_json::json!({ "channel": label }))
                })??;
            Ok::<_, HubError>((label.clone(), peer))
        }
    });

    match try_join_all(dials).await {
        Ok(peers) => Ok(peers.into_iter().collect()),
        Err(err) => {
            dial_scope.cancel();
            Err(err)
        }
    }
}
