use std::path::PathBuf;
use std::time::Duration;

use meh_common::envelope::MAX_MESSAGE_SIZE;

/// Read deadline; rearmed on every pong.
pub const PONG_WAIT: Duration = Duration::from_secs(10);
/// Ping cadence, 90% of [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(9);
/// Deadline for any single write, pings included.
pub const WRITE_WAIT: Duration = Duration::from_secs(16);
/// WebSocket read/write buffer size.
pub const BUFFER_SIZE: usize = 2048;
/// Bound on the HTTP part of the client upgrade.
pub const UPGRADE_TIMEOUT: Duration = Duration::from_secs(2);
/// Window between client upgrade and a fully dialed channel set.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket peer tunables. `Default` yields the wire-normative values.
#[derive(Debug, Clone)]
pub struct PeerSettings {
    pub max_message_size: usize,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub write_wait: Duration,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub upgrade_timeout: Duration,
    /// Capacity of the outbound queue; senders suspend when it is full.
    pub outbound_capacity: usize,
    /// Capacity of the inbound queue between the read pump and the router.
    pub inbound_capacity: usize,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            pong_wait: PONG_WAIT,
            ping_period: PING_PERIOD,
            write_wait: WRITE_WAIT,
            read_buffer_size: BUFFER_SIZE,
            write_buffer_size: BUFFER_SIZE,
            upgrade_timeout: UPGRADE_TIMEOUT,
            outbound_capacity: 256,
            inbound_capacity: 256,
        }
    }
}

impl PeerSettings {
    /// Shrink pong wait and derive the ping period the same way the defaults do.
    pub fn with_pong_wait(mut self, pong_wait: Duration) -> Self {
        self.pong_wait = pong_wait;
        self.ping_period = pong_wait * 9 / 10;
        self
    }
}

/// Hub configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the YAML gate registry.
    pub gates_file: PathBuf,
    /// Token resolver endpoint (`POST`, plain-text body).
    pub resolver_url: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Deadline for auth frame, token resolution and channel dials together.
    pub handshake_timeout: Duration,
    pub peer: PeerSettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            gates_file: PathBuf::from(required_var("GATES_FILE")),
            resolver_url: required_var("RESOLVER_URL"),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4100),
            handshake_timeout: std::env::var("HANDSHAKE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(HANDSHAKE_TIMEOUT),
            peer: PeerSettings::default(),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}
