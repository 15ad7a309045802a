//! Dialing upstream channels on behalf of an authenticated client.

use axum::http::header::{
    AUTHORIZATION, CONNECTION, HOST, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;

use crate::config::PeerSettings;
use crate::error::HubError;
use crate::gates::ChannelConfig;

use super::peer::Peer;

/// Client request headers that belong to the client↔hub upgrade and must not
/// be replayed on the hub↔upstream dial. `Host` is derived from the channel
/// URL by the dialer.
static HOP_BY_HOP: [HeaderName; 7] = [
    UPGRADE,
    CONNECTION,
    SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION,
    SEC_WEBSOCKET_EXTENSIONS,
    SEC_WEBSOCKET_PROTOCOL,
    HOST,
];

/// Copy of the client's request headers prepared for upstream dials: hop-by-hop
/// WebSocket headers removed, `Authorization` replaced with the internal token.
pub fn upstream_headers(client: &HeaderMap, internal_token: &str) -> Result<HeaderMap, HubError> {
    let mut headers = client.clone();
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }

    let bearer = HeaderValue::from_str(&format!("Bearer {internal_token}")).map_err(|_| {
        HubError::internal("internal token is not a valid header value")
    })?;
    headers.insert(AUTHORIZATION, bearer);

    Ok(headers)
}

/// Buffer and size limits for hub-side tungstenite sockets.
pub fn socket_config(settings: &PeerSettings) -> WebSocketConfig {
    WebSocketConfig::default()
        .read_buffer_size(settings.read_buffer_size)
        .write_buffer_size(settings.write_buffer_size)
        .max_message_size(Some(settings.max_message_size))
        .max_frame_size(Some(settings.max_message_size))
}

/// Open one channel and start its peer under `scope`.
pub async fn dial(
    label: &str,
    channel: &ChannelConfig,
    headers: &HeaderMap,
    settings: &PeerSettings,
    scope: &CancellationToken,
) -> Result<Peer, HubError> {
    let dial_error = |message: &str, error: String| {
        HubError::ws(message.to_string()).with_details(serde_json::json!({
            "channel": label,
            "url": channel.url.as_str(),
            "error": error,
        }))
    };

    let mut request = channel
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| dial_error("invalid channel request", e.to_string()))?;
    request.headers_mut().extend(headers.clone());

    let (socket, response) =
        tokio_tungstenite::connect_async_with_config(request, Some(socket_config(settings)), false)
            .await
            .map_err(|e| dial_error("channel dial failed", e.to_string()))?;

    tracing::debug!(channel = %label, status = %response.status(), "channel connected");

    Ok(Peer::spawn(label, socket, settings, scope))
}
