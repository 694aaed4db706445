//! Socket connection status and lifecycle state.

use std::collections::VecDeque;

use serde::Serialize;
use tokio::time::Instant;

/// Events kept in a status log; older entries are dropped first.
const MAX_EVENTS: usize = 256;

/// Socket lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SocketState {
    /// Dialing, or waiting out the reconnect backoff.
    Connecting,
    /// Open, but no pong received yet.
    OpenUnhealthy,
    /// Open and answering pings.
    Healthy,
    /// Reconnect abandoned by the give-up policy.
    GivenUp,
    /// Closed by the client.
    Closed,
}

/// One entry of the status event log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// Event name (`connect`, `open`, `pong`, `close`, `wsError`, ...).
    pub name: String,
    /// Milliseconds since the transport started.
    pub since_start_ms: u64,
    /// Milliseconds since the current connection attempt started.
    pub since_connect_ms: u64,
    /// WebSocket close code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    /// WebSocket close reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Error text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Health and history of one socket transport.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// Reached healthy at least once. Never reset.
    pub success: bool,
    /// Current attempt has an open connection.
    pub opened: bool,
    /// Current connection has answered a ping.
    pub connected: bool,
    /// Payloads received.
    pub messages: u64,
    /// Connection attempts made.
    pub connects: u32,
    /// Attempts it took to first become healthy.
    pub retries: u32,
    /// Bounded event log, oldest first.
    pub events: VecDeque<StatusEvent>,
    #[serde(skip)]
    started_at: Instant,
    #[serde(skip)]
    connect_started_at: Instant,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStatus {
    /// Fresh status, clocks starting now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            success: false,
            opened: false,
            connected: false,
            messages: 0,
            connects: 0,
            retries: 0,
            events: VecDeque::new(),
            started_at: now,
            connect_started_at: now,
        }
    }

    /// Start a connection attempt.
    pub fn begin_attempt(&mut self) {
        self.connects += 1;
        self.opened = false;
        self.connected = false;
        self.connect_started_at = Instant::now();
        self.record("connect");
    }

    /// The connection opened.
    pub fn mark_opened(&mut self) {
        self.opened = true;
        self.record("open");
    }

    /// The connection is gone.
    pub fn mark_disconnected(&mut self) {
        self.opened = false;
        self.connected = false;
    }

    /// Count a payload. Returns `true` when this pong is the first of the
    /// current connection, which makes the socket healthy.
    pub fn on_message(&mut self, is_pong: bool) -> bool {
        self.messages += 1;
        if !is_pong || self.connected {
            return false;
        }
        self.connected = true;
        self.success = true;
        self.retries = self.connects;
        self.record("pong");
        true
    }

    /// Append a bare event.
    pub fn record(&mut self, name: &str) {
        self.record_detail(name, None, None, None);
    }

    /// Append an event with close/error details.
    pub fn record_detail(
        &mut self,
        name: &str,
        code: Option<u16>,
        reason: Option<String>,
        message: Option<String>,
    ) {
        if self.events.len() == MAX_EVENTS {
            let _ = self.events.pop_front();
        }
        self.events.push_back(StatusEvent {
            name: name.to_owned(),
            since_start_ms: millis_since(self.started_at),
            since_connect_ms: millis_since(self.connect_started_at),
            code,
            reason,
            message,
        });
    }

    /// Whether any event with `name` was recorded.
    pub fn has_event(&self, name: &str) -> bool {
        self.events.iter().any(|e| e.name == name)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn millis_since(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
