//! Transport arbitration.
//!
//! Polling is the bootstrap path. The socket becomes current once it answers
//! a ping and stays current until its connection drops, after which traffic
//! falls back to polling.

use amp_core::{Message, TransportError};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use super::polling::PollingTransport;
use super::socket::SocketTransport;
use super::status::ConnectionStatus;
use super::{Transport, TransportKind};

/// Reported whenever the socket's health changes.
#[derive(Clone, Debug, Serialize)]
pub struct TransportChange {
    /// Transport current before the change.
    pub previous: TransportKind,
    /// Transport current after the change.
    pub current: TransportKind,
    /// Socket status that triggered the change.
    pub status: ConnectionStatus,
}

/// Result of feeding a socket status into the supervisor.
#[derive(Clone, Debug)]
pub struct StatusOutcome {
    /// What to report to observers.
    pub change: TransportChange,
    /// The current transport switched; subscriptions must be re-sent on it.
    pub resubscribe: bool,
}

/// Owns both transports and routes sends to the current one.
pub struct TransportSupervisor {
    polling: PollingTransport,
    socket: Option<SocketTransport>,
    current: RwLock<Option<TransportKind>>,
}

impl TransportSupervisor {
    /// Supervisor over `polling` and, unless polling is forced, `socket`.
    pub fn new(polling: PollingTransport, socket: Option<SocketTransport>) -> Self {
        Self {
            polling,
            socket,
            current: RwLock::new(None),
        }
    }

    /// Transport sends go to. Polling until the socket proves itself.
    pub fn current(&self) -> TransportKind {
        self.current.read().unwrap_or(TransportKind::Polling)
    }

    /// The current transport.
    pub fn active(&self) -> &dyn Transport {
        match (self.current(), &self.socket) {
            (TransportKind::Socket, Some(socket)) => socket as &dyn Transport,
            _ => &self.polling,
        }
    }

    /// Send through the current transport.
    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.active().send(message).await
    }

    /// Apply a socket status change.
    pub fn on_socket_status(&self, status: ConnectionStatus) -> StatusOutcome {
        let previous = self.current();
        let mut resubscribe = false;
        {
            let mut current = self.current.write();
            if status.connected && self.socket.is_some() {
                if *current != Some(TransportKind::Socket) {
                    *current = Some(TransportKind::Socket);
                    self.polling.stop();
                    resubscribe = true;
                }
            } else if *current == Some(TransportKind::Socket) {
                *current = None;
                self.polling.resume();
                resubscribe = true;
            }
        }
        let current = self.current();
        if previous != current {
            info!(%previous, %current, "transport changed");
        }
        StatusOutcome {
            change: TransportChange {
                previous,
                current,
                status,
            },
            resubscribe,
        }
    }

    /// The socket transport, absent when polling is forced.
    pub fn socket(&self) -> Option<&SocketTransport> {
        self.socket.as_ref()
    }

    /// The polling transport.
    pub fn polling(&self) -> &PollingTransport {
        &self.polling
    }

    /// Stop both transports.
    pub fn close(&self) {
        if let Some(socket) = &self.socket {
            socket.close();
        }
        self.polling.stop();
        *self.current.write() = None;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
