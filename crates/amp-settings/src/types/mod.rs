//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so partial
//! JSON is accepted and missing fields take their [`Default`] value.

mod transport;

pub use transport::*;

use std::time::Duration;

use amp_core::ProtocolVersion;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Every option the amp client recognizes.
///
/// # JSON Format
///
/// ```json
/// {
///   "socketUrl": "wss://example.com/api",
///   "protocol": "v1",
///   "socket": { "giveUp": { "policy": "stop", "afterAttempts": 5 } }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// WebSocket endpoint.
    pub socket_url: String,
    /// HTTP long-polling endpoint.
    pub polling_url: String,
    /// Base URL of the HTTP diagnostic sink (`/info` and `/error` are appended).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics_url: Option<String>,
    /// Header alias table.
    pub protocol: ProtocolVersion,
    /// Never construct the socket transport.
    pub force_polling: bool,
    /// Record `{previous, changedAt}` provenance on diff merges.
    pub track_changes: bool,
    /// Pending request timeout; `0` disables it.
    pub request_timeout_ms: u64,
    /// Report transport status changes to the diagnostic sink.
    pub log_transport_changes: bool,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Socket transport settings.
    pub socket: SocketSettings,
    /// Polling transport settings.
    pub polling: PollingSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            socket_url: "ws://127.0.0.1:8080/api".to_string(),
            polling_url: "http://127.0.0.1:8080/pooling".to_string(),
            diagnostics_url: None,
            protocol: ProtocolVersion::V2,
            force_polling: false,
            track_changes: true,
            request_timeout_ms: 60_000,
            log_transport_changes: false,
            log_level: "warn".to_string(),
            socket: SocketSettings::default(),
            polling: PollingSettings::default(),
        }
    }
}

impl ClientSettings {
    /// Request timeout, or `None` when disabled.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    /// Reject values the transports cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.polling_url.is_empty() {
            return Err(SettingsError::InvalidValue("pollingUrl must be set".into()));
        }
        if !self.force_polling && self.socket_url.is_empty() {
            return Err(SettingsError::InvalidValue(
                "socketUrl must be set unless forcePolling is on".into(),
            ));
        }
        if self.socket.reconnect_cap > 31 {
            return Err(SettingsError::InvalidValue(
                "socket.reconnectCap must be at most 31".into(),
            ));
        }
        for (name, value) in [
            ("socket.pingIntervalMs", self.socket.ping_interval_ms),
            ("socket.healthyPingIntervalMs", self.socket.healthy_ping_interval_ms),
            ("socket.pongTimeoutMs", self.socket.pong_timeout_ms),
            ("socket.connectTimeoutMs", self.socket.connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}
