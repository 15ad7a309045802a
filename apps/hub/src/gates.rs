//! Load-time registry of gates and their upstream channels.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use meh_common::CONTROL_CHANNEL;
use reqwest::Url;
use serde::Deserialize;

use crate::error::HubError;

const MAX_LABEL_LEN: usize = 64;

/// One upstream endpoint within a gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub url: Url,
}

/// A named fan-out of channel labels to upstream WebSocket URLs.
#[derive(Debug, Clone)]
pub struct Gate {
    pub name: String,
    pub channels: BTreeMap<String, ChannelConfig>,
}

#[derive(Debug, Deserialize)]
struct GatesFile {
    gates: HashMap<String, GateSection>,
}

#[derive(Debug, Deserialize)]
struct GateSection {
    channels: BTreeMap<String, ChannelSection>,
}

#[derive(Debug, Deserialize)]
struct ChannelSection {
    url: String,
}

/// Read-only after startup; shared behind an `Arc` in the app state.
#[derive(Debug, Default)]
pub struct GateRegistry {
    gates: HashMap<String, Arc<Gate>>,
}

impl GateRegistry {
    pub fn load(path: &Path) -> Result<Self, HubError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HubError::internal("cannot read gate registry").with_details(serde_json::json!({
                "path": path.display().to_string(),
                "error": e.to_string(),
            }))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, HubError> {
        let file: GatesFile = serde_yaml::from_str(raw).map_err(|e| {
            HubError::internal("invalid gate registry")
                .with_details(serde_json::json!({ "error": e.to_string() }))
        })?;

        if file.gates.is_empty() {
            return Err(HubError::internal("gate registry defines no gates"));
        }

        let mut gates = HashMap::with_capacity(file.gates.len());
        for (name, section) in file.gates {
            let gate = build_gate(&name, section)?;
            gates.insert(name, Arc::new(gate));
        }

        Ok(Self { gates })
    }

    pub fn by_name(&self, name: &str) -> Result<Arc<Gate>, HubError> {
        self.gates.get(name).cloned().ok_or_else(|| {
            HubError::not_found("gate not found").with_details(serde_json::json!({ "gate": name }))
        })
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

fn build_gate(name: &str, section: GateSection) -> Result<Gate, HubError> {
    let config_error = |message: &str, channel: &str| {
        HubError::internal(message.to_string())
            .with_details(serde_json::json!({ "gate": name, "channel": channel }))
    };

    if section.channels.is_empty() {
        return Err(config_error("gate has no channels", ""));
    }

    let mut channels = BTreeMap::new();
    for (label, channel) in section.channels {
        if label == CONTROL_CHANNEL {
            return Err(config_error("channel label is reserved", &label));
        }
        if !is_valid_label(&label) {
            return Err(config_error("invalid channel label", &label));
        }
        let url = Url::parse(&channel.url)
            .map_err(|_| config_error("channel url is not absolute", &label))?;
        if !matches!(url.scheme(), "ws" | "wss") || !url.has_host() {
            return Err(config_error("channel url must be ws:// or wss://", &label));
        }
        channels.insert(label, ChannelConfig { url });
    }

    Ok(Gate {
        name: name.to_string(),
        channels,
    })
}

/// Labels are case-sensitive ASCII identifiers: alphanumerics, `_`, `-`, `.`.
pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}
