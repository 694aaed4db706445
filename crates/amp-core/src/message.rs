//! Wire message model.
//!
//! A [`Message`] is one header plus an optional opaque body. Field names here
//! are semantic; the single-character wire aliases live in [`crate::codec`].

use std::collections::BTreeMap;
use std::fmt;

use indexmap::IndexMap;
use serde_json::Value;

use crate::errors::ErrorSource;

/// Resume cursor carried by `subscribe` messages: topic → last applied `ts`.
///
/// Insertion order is preserved so the wire form is deterministic.
pub type Subscriptions = IndexMap<String, i64>;

// ─────────────────────────────────────────────────────────────────────────────
// MessageType
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of a wire message (`t` header field).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Server → client topic update.
    #[default]
    Publish,
    /// Client → server subscription cursor.
    Subscribe,
    /// RPC call.
    Request,
    /// RPC reply, matched by correlation id.
    Response,
    /// Keepalive probe.
    Ping,
    /// Keepalive reply.
    Pong,
    /// Server liveness signal with no payload semantics.
    Alive,
    /// Client metadata announcement.
    Meta,
    /// A code this client does not know.
    Other(u8),
}

impl MessageType {
    /// Numeric wire code.
    pub fn code(self) -> u8 {
        match self {
            Self::Publish => 0,
            Self::Subscribe => 1,
            Self::Request => 2,
            Self::Response => 3,
            Self::Ping => 4,
            Self::Pong => 5,
            Self::Alive => 6,
            Self::Meta => 9,
            Self::Other(code) => code,
        }
    }

    /// Decode a numeric wire code. Never fails; unknown codes map to [`Self::Other`].
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Publish,
            1 => Self::Subscribe,
            2 => Self::Request,
            3 => Self::Response,
            4 => Self::Ping,
            5 => Self::Pong,
            6 => Self::Alive,
            9 => Self::Meta,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publish => f.write_str("publish"),
            Self::Subscribe => f.write_str("subscribe"),
            Self::Request => f.write_str("request"),
            Self::Response => f.write_str("response"),
            Self::Ping => f.write_str("ping"),
            Self::Pong => f.write_str("pong"),
            Self::Alive => f.write_str("alive"),
            Self::Meta => f.write_str("meta"),
            Self::Other(code) => write!(f, "type({code})"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// UpdateType
// ─────────────────────────────────────────────────────────────────────────────

/// How a publish body applies to a topic's snapshot (`p` header field).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum UpdateType {
    /// Incremental change merged into the snapshot.
    #[default]
    Diff,
    /// Wholesale snapshot replacement.
    Full,
    /// Pass-through notification.
    Append,
    /// Pass-through notification.
    Update,
    /// Topic closed by the server.
    Close,
    /// Start of a burst of updates.
    BurstStart,
    /// End of a burst of updates.
    BurstEnd,
    /// Transient event.
    Event,
    /// A code this client does not know.
    Other(u8),
}

impl UpdateType {
    /// Numeric wire code.
    pub fn code(self) -> u8 {
        match self {
            Self::Diff => 0,
            Self::Full => 1,
            Self::Append => 2,
            Self::Update => 3,
            Self::Close => 4,
            Self::BurstStart => 5,
            Self::BurstEnd => 6,
            Self::Event => 8,
            Self::Other(code) => code,
        }
    }

    /// Decode a numeric wire code. Unknown codes map to [`Self::Other`].
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Diff,
            1 => Self::Full,
            2 => Self::Append,
            3 => Self::Update,
            4 => Self::Close,
            5 => Self::BurstStart,
            6 => Self::BurstEnd,
            8 => Self::Event,
            other => Self::Other(other),
        }
    }

    /// Whether handlers get this update as a notification without any
    /// snapshot mutation.
    pub fn is_pass_through(self) -> bool {
        matches!(
            self,
            Self::Append | Self::Update | Self::Event | Self::BurstStart | Self::BurstEnd
        )
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Diff => f.write_str("diff"),
            Self::Full => f.write_str("full"),
            Self::Append => f.write_str("append"),
            Self::Update => f.write_str("update"),
            Self::Close => f.write_str("close"),
            Self::BurstStart => f.write_str("burstStart"),
            Self::BurstEnd => f.write_str("burstEnd"),
            Self::Event => f.write_str("event"),
            Self::Other(code) => write!(f, "update({code})"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message
// ─────────────────────────────────────────────────────────────────────────────

/// Structured error attached to a `response` (`e` header field).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireError {
    /// Which side of the server produced the error.
    pub source: ErrorSource,
    /// Human-readable message.
    pub message: String,
    /// Optional machine-readable code.
    pub code: Option<i64>,
}

/// One wire message: header fields plus an optional body.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    /// Message kind.
    pub kind: MessageType,
    /// Pairs a request with its response.
    pub correlation_id: Option<u64>,
    /// Server-side failure carried by a response.
    pub error: Option<WireError>,
    /// Topic or method key.
    pub uri: Option<String>,
    /// Update timestamp (or ping token).
    pub ts: Option<i64>,
    /// Publish application mode.
    pub update_type: Option<UpdateType>,
    /// Resume cursor of a subscribe message.
    pub subscriptions: Option<Subscriptions>,
    /// String metadata of a meta message.
    pub meta: Option<BTreeMap<String, String>>,
    /// Opaque structured payload.
    pub body: Option<Value>,
}

impl Message {
    /// A `request` for `uri` tagged with `correlation_id`.
    pub fn request(uri: impl Into<String>, correlation_id: u64, body: Value) -> Self {
        Self {
            kind: MessageType::Request,
            correlation_id: Some(correlation_id),
            uri: Some(uri.into()),
            body: Some(body),
            ..Self::default()
        }
    }

    /// A successful `response` to `correlation_id`.
    pub fn response(correlation_id: u64, body: Value) -> Self {
        Self {
            kind: MessageType::Response,
            correlation_id: Some(correlation_id),
            body: Some(body),
            ..Self::default()
        }
    }

    /// A failed `response` to `correlation_id`.
    pub fn error_response(correlation_id: u64, error: WireError) -> Self {
        Self {
            kind: MessageType::Response,
            correlation_id: Some(correlation_id),
            error: Some(error),
            ..Self::default()
        }
    }

    /// A `publish` update for `uri`.
    pub fn publish(
        uri: impl Into<String>,
        ts: i64,
        update_type: UpdateType,
        body: Option<Value>,
    ) -> Self {
        Self {
            kind: MessageType::Publish,
            uri: Some(uri.into()),
            ts: Some(ts),
            update_type: Some(update_type),
            body,
            ..Self::default()
        }
    }

    /// A `subscribe` message carrying the full resume cursor.
    pub fn subscribe(subscriptions: Subscriptions) -> Self {
        Self {
            kind: MessageType::Subscribe,
            subscriptions: Some(subscriptions),
            ..Self::default()
        }
    }

    /// A keepalive probe; `token` travels in the `ts` field.
    #[allow(clippy::cast_possible_wrap)]
    pub fn ping(token: u64) -> Self {
        Self {
            kind: MessageType::Ping,
            ts: Some(token as i64),
            ..Self::default()
        }
    }

    /// A keepalive reply.
    pub fn pong() -> Self {
        Self {
            kind: MessageType::Pong,
            ..Self::default()
        }
    }

    /// A `meta` message announcing client metadata.
    pub fn meta(meta: BTreeMap<String, String>) -> Self {
        Self {
            kind: MessageType::Meta,
            meta: Some(meta),
            ..Self::default()
        }
    }

    /// The topic key, or `""` when absent.
    pub fn topic(&self) -> &str {
        self.uri.as_deref().unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
