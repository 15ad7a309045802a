//! HTTP front: `GET /ws/{gate}` upgrades the client and hands it to the
//! session supervisor.

use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::timeout::TimeoutLayer;

use crate::AppState;

use super::session;

pub fn router(upgrade_timeout: Duration) -> Router<AppState> {
    Router::new()
        .route("/ws/{gate}", get(ws_upgrade))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            upgrade_timeout,
        ))
}

/// The gate is resolved before the upgrade so unknown gates get a plain 404.
async fn ws_upgrade(
    Path(gate): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let gate = match state.gates.by_name(&gate) {
        Ok(gate) => gate,
        Err(err) => {
            tracing::debug!(error = %err, "rejecting upgrade");
            return err.into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let settings = &state.config.peer;
    ws.read_buffer_size(settings.read_buffer_size)
        .write_buffer_size(settings.write_buffer_size)
        .max_message_size(settings.max_message_size)
        .max_frame_size(settings.max_message_size)
        .on_failed_upgrade(|e| tracing::debug!(error = %e, "client upgrade failed"))
        .on_upgrade(move |socket| session::serve(state, gate, socket, headers))
}
