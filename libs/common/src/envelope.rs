//! Client envelope codec: `{"channel": "<label>", "payload": <opaque JSON>}`.
//!
//! Only the header is typed. The payload travels as the exact bytes the
//! sender produced and is never re-serialized.

use bytes::Bytes;
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::Value;

use crate::code::ControlError;

/// Reserved label for hub-originated error frames. Never a channel.
pub const CONTROL_CHANNEL: &str = "_control";

/// Upper bound for a single frame in either direction (128 * 10^6 bytes).
pub const MAX_MESSAGE_SIZE: usize = 128_000_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no channel")]
    MissingChannel,
    #[error("channel is not a string")]
    ChannelNotString,
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// A decoded client envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub channel: String,
    pub payload: Bytes,
}

#[derive(Deserialize)]
struct WireEnvelope<'a> {
    /// `None` only when the key is absent; a present `null` is `Some(Null)`.
    #[serde(default, deserialize_with = "present")]
    channel: Option<Value>,
    #[serde(borrow)]
    payload: Option<&'a RawValue>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Envelope {
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// Wrap a hub error for the `_control` channel.
    pub fn control(error: &ControlError) -> Self {
        // Serializing a struct of strings and a Value cannot fail.
        let payload = serde_json::to_vec(error).unwrap_or_else(|_| b"{}".to_vec());
        Self::new(CONTROL_CHANNEL, payload)
    }

    pub fn is_control(&self) -> bool {
        self.channel == CONTROL_CHANNEL
    }

    /// Encode without parsing the payload. An empty payload encodes as `null`.
    pub fn encode(&self) -> Bytes {
        let channel = Value::from(self.channel.as_str()).to_string();
        let mut out = Vec::with_capacity(self.payload.len() + channel.len() + 24);
        out.extend_from_slice(b"{\"channel\":");
        out.extend_from_slice(channel.as_bytes());
        out.extend_from_slice(b",\"payload\":");
        if self.payload.is_empty() {
            out.extend_from_slice(b"null");
        } else {
            out.extend_from_slice(&self.payload);
        }
        out.push(b'}');
        Bytes::from(out)
    }

    /// Size of [`Envelope::encode`] output, without encoding.
    pub fn encoded_len(&self) -> usize {
        let channel = Value::from(self.channel.as_str()).to_string();
        let payload = if self.payload.is_empty() {
            4
        } else {
            self.payload.len()
        };
        // {"channel":  ,"payload":  }
        11 + channel.len() + 11 + payload + 1
    }

    /// Decode a raw client frame. Newlines are folded to spaces and the frame
    /// is trimmed first. A missing payload decodes as `null`.
    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        let normalized: Vec<u8> = raw
            .iter()
            .map(|&b| if b == b'\n' { b' ' } else { b })
            .collect();
        let trimmed = normalized.trim_ascii();

        if trimmed.first() != Some(&b'{') {
            return Err(FrameError::NotAnObject);
        }

        let wire: WireEnvelope<'_> = serde_json::from_slice(trimmed)
            .map_err(|e| FrameError::Malformed(e.to_string()))?;

        let channel = match wire.channel {
            None => return Err(FrameError::MissingChannel),
            Some(Value::String(s)) => s,
            Some(_) => return Err(FrameError::ChannelNotString),
        };

        let payload = match wire.payload {
            Some(raw) => Bytes::copy_from_slice(raw.get().as_bytes()),
            None => Bytes::from_static(b"null"),
        };

        Ok(Self { channel, payload })
    }
}
