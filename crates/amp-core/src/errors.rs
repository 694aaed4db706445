//! Error taxonomy for the amp client.
//!
//! - [`TransportError`]: the bytes did not make it (not connected, closed
//!   mid-send, write/connect failure, non-2xx polling status, ping failure)
//! - [`ApplicationError`]: the server processed the request and answered with
//!   a structured error, tagged with the [`ErrorSource`] the server chose
//! - [`ClientError`]: what the public client API returns

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::CodecError;
use crate::message::WireError;

/// Which side of the server produced an error (`s` field of the wire error).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSource {
    /// Server-side application logic.
    #[default]
    Application,
    /// Server-side transport or routing.
    Transport,
}

impl ErrorSource {
    /// Numeric wire code.
    pub fn code(self) -> u8 {
        match self {
            Self::Application => 0,
            Self::Transport => 1,
        }
    }

    /// Decode a wire code; anything but `1` is an application error.
    pub fn from_code(code: u8) -> Self {
        if code == 1 {
            Self::Transport
        } else {
            Self::Application
        }
    }
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application => f.write_str("application"),
            Self::Transport => f.write_str("transport"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TransportError
// ─────────────────────────────────────────────────────────────────────────────

/// Failure to move a message between client and server.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection closed before or during the send.
    #[error("connection closed")]
    Closed,

    /// Writing to an open connection failed.
    #[error("write failed: {message}")]
    Write {
        /// Underlying failure.
        message: String,
    },

    /// The message could not be serialized.
    #[error(transparent)]
    Encode(#[from] CodecError),

    /// A polling request returned a non-2xx status.
    #[error("polling request failed with status {status}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },

    /// A polling request failed below HTTP (DNS, connect, reset).
    #[error("network error: {message}")]
    Network {
        /// Underlying failure.
        message: String,
    },

    /// A keepalive ping could not be written.
    #[error("ping failed: {message}")]
    Ping {
        /// Underlying failure.
        message: String,
    },

    /// The reconnect loop hit its give-up threshold and stopped.
    #[error("reconnect abandoned after {attempts} attempts")]
    GivenUp {
        /// Attempts made before giving up.
        attempts: u32,
    },
}

impl TransportError {
    /// A 4xx polling status: terminal for the current poll cycle.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Http { status, .. } if (400..500).contains(status))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ApplicationError
// ─────────────────────────────────────────────────────────────────────────────

/// Structured error returned by the server in a `response` message.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{origin} error: {message}")]
pub struct ApplicationError {
    /// Server-chosen source tag.
    pub origin: ErrorSource,
    /// Human-readable message.
    pub message: String,
    /// Optional machine-readable code.
    pub code: Option<i64>,
}

impl From<WireError> for ApplicationError {
    fn from(err: WireError) -> Self {
        Self {
            origin: err.source,
            message: err.message,
            code: err.code,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ClientError
// ─────────────────────────────────────────────────────────────────────────────

/// Error returned by the public client API.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request never reached the server or the reply never came back.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server answered with an error.
    #[error(transparent)]
    Application(#[from] ApplicationError),

    /// No response arrived within the configured request timeout.
    #[error("request {correlation_id} timed out after {timeout_ms}ms")]
    Timeout {
        /// Correlation id of the abandoned request.
        correlation_id: u64,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The client was closed while the operation was pending.
    #[error("client closed")]
    Closed,

    /// The client could not be built from its settings.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Transport-class failure, including server errors tagged `transport`.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout { .. } | Self::Closed => true,
            Self::Application(err) => err.origin == ErrorSource::Transport,
            Self::Config(_) => false,
        }
    }

    /// Server-side application failure.
    pub fn is_application(&self) -> bool {
        matches!(self, Self::Application(err) if err.origin == ErrorSource::Application)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
