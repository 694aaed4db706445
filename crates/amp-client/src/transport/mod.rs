//! Transports and the supervisor that arbitrates between them.
//!
//! - [`socket`]: persistent WebSocket with keepalive, health detection and
//!   exponential-backoff reconnect
//! - [`polling`]: per-topic HTTP long-polling loops
//! - [`supervisor`]: routes sends to whichever transport is current and
//!   fails over from polling to the socket once it proves healthy
//! - [`status`]: connection status and state reported by the socket

pub mod polling;
pub mod socket;
pub mod status;
pub mod supervisor;

use std::fmt;

use amp_core::{Message, TransportError};
use async_trait::async_trait;
use serde::Serialize;

pub use polling::{PollingConfig, PollingTransport};
pub use socket::{GiveUpAction, SocketConfig, SocketTransport, give_up_action, reconnect_delay};
pub use status::{ConnectionStatus, SocketState, StatusEvent};
pub use supervisor::{StatusOutcome, TransportChange, TransportSupervisor};

/// Which transport carries traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Persistent WebSocket.
    Socket,
    /// HTTP long-polling.
    Polling,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket => f.write_str("socket"),
            Self::Polling => f.write_str("polling"),
        }
    }
}

/// Receives raw payloads from either transport.
pub trait InboundHandler: Send + Sync {
    /// Decode and dispatch `payload`. Returns whether it contained a pong.
    fn on_payload(&self, payload: &str) -> bool;
}

/// Provides the current resume cursor for long-poll re-arming.
#[cfg_attr(test, mockall::automock)]
pub trait SubscriptionSource: Send + Sync {
    /// A `subscribe` message covering every tracked topic.
    fn subscribe_message(&self) -> Message;
}

/// Something that can carry a message to the server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport identity.
    fn kind(&self) -> TransportKind;

    /// Send one message.
    async fn send(&self, message: Message) -> Result<(), TransportError>;
}
