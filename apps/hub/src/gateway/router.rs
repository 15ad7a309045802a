//! Frame pump between one client peer and the channel peers of its gate.

use std::collections::HashMap;
use std::sync::Arc;

use meh_common::Envelope;
use serde_json::value::RawValue;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::HubError;

use super::peer::{Inbound, PeerHandle};

/// Route until the first task finishes or `scope` is cancelled.
///
/// One task reads the client and one task reads each channel. Any of them
/// finishing ends routing for the whole session: there is no degraded mode
/// with fewer channels. The remaining tasks are aborted before returning;
/// closing the peers is left to the caller.
pub async fn route(
    client: PeerHandle,
    client_inbound: Inbound,
    channels: HashMap<String, (PeerHandle, Inbound)>,
    scope: &CancellationToken,
    max_message_size: usize,
) -> Result<(), HubError> {
    let mut tasks = JoinSet::new();
    let mut targets = HashMap::with_capacity(channels.len());

    for (label, (handle, inbound)) in channels {
        targets.insert(label.clone(), handle);
        tasks.spawn(upstream_to_client(
            label,
            inbound,
            client.clone(),
            max_message_size,
        ));
    }
    tasks.spawn(client_to_upstream(client_inbound, client, Arc::new(targets)));

    let result = tokio::select! {
        _ = scope.cancelled() => Ok(()),
        joined = tasks.join_next() => match joined {
            Some(Ok(res)) => res,
            Some(Err(e)) => Err(HubError::internal("routing task failed")
                .with_details(serde_json::json!({ "error": e.to_string() }))),
            None => Ok(()),
        },
    };

    tasks.shutdown().await;
    result
}

async fn client_to_upstream(
    mut inbound: Inbound,
    client: PeerHandle,
    channels: Arc<HashMap<String, PeerHandle>>,
) -> Result<(), HubError> {
    while let Some(frame) = inbound.recv().await {
        let envelope = match Envelope::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                let err = HubError::from(e);
                client.send_raw(err.control_frame()).await;
                continue;
            }
        };

        let target = if envelope.is_control() {
            None
        } else {
            channels.get(&envelope.channel)
        };
        let Some(target) = target else {
            let err = HubError::bad_input("unknown channel")
                .with_details(serde_json::json!({ "channel": envelope.channel }));
            client.send_raw(err.control_frame()).await;
            continue;
        };

        target.send_raw(envelope.payload).await;
    }

    tracing::debug!("client inbound ended");
    Ok(())
}

async fn upstream_to_client(
    label: String,
    mut inbound: Inbound,
    client: PeerHandle,
    max_message_size: usize,
) -> Result<(), HubError> {
    while let Some(frame) = inbound.recv().await {
        // Spliced verbatim into the envelope, so it must be JSON on its own.
        if !frame.is_empty() && serde_json::from_slice::<&RawValue>(&frame).is_err() {
            tracing::warn!(channel = %label, size = frame.len(), "upstream frame is not JSON");
            let err = HubError::internal("upstream frame is not valid JSON")
                .with_details(serde_json::json!({ "channel": label }));
            client.send_raw(err.control_frame()).await;
            continue;
        }

        let envelope = Envelope::new(label.clone(), frame);

        if envelope.encoded_len() > max_message_size {
            tracing::warn!(channel = %label, size = envelope.payload.len(), "upstream frame too large for client");
            let err = HubError::internal("upstream frame exceeds maximum message size")
                .with_details(serde_json::json!({ "channel": label }));
            client.send_raw(err.control_frame()).await;
            continue;
        }

        client.send_raw(envelope.encode()).await;
    }

    tracing::debug!(channel = %label, "channel inbound ended");
    Ok(())
}
