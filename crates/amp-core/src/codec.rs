//! Line-framed wire codec.
//!
//! One message is a JSON header object, optionally followed by `\n` and a
//! JSON body. A payload carries one or more messages separated by a blank
//! line (`\n\n`).
//!
//! Two header alias tables exist:
//!
//! | field | v2 | v1 |
//! |---|---|---|
//! | type | `t` | `t` |
//! | correlation id | `i` | n/a |
//! | error | `e` (`s` source, `m` message, `c` code) | n/a |
//! | uri | `u` | `s` |
//! | ts | `s` | `n` |
//! | update type | `p` | `f` (truthy ⇒ full) |
//! | subscriptions | `b` (object topic → ts) | `u` (list of `{"s","n"}`) |
//! | meta | `m` | n/a |
//!
//! Unpacking never fails: a segment whose header does not parse is dropped,
//! a body that does not parse leaves the message without a body.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::errors::ErrorSource;
use crate::message::{Message, MessageType, Subscriptions, UpdateType, WireError};

/// Separator between messages in one payload.
pub const MESSAGE_SEPARATOR: &str = "\n\n";

/// Header alias table generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// Legacy stream/number aliases.
    V1,
    /// Current single-character aliases.
    #[default]
    V2,
}

/// Errors raised while packing a message.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The header could not be serialized.
    #[error("failed to encode message header: {0}")]
    Header(#[source] serde_json::Error),
    /// The body could not be serialized.
    #[error("failed to encode message body: {0}")]
    Body(#[source] serde_json::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Header wire shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct HeaderV2 {
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    kind: Option<u8>,
    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<u64>,
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorHeader>,
    #[serde(rename = "u", default, skip_serializing_if = "Option::is_none")]
    uri: Option<String>,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    ts: Option<i64>,
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    update_type: Option<u8>,
    #[serde(rename = "b", default, skip_serializing_if = "Option::is_none")]
    subscriptions: Option<Subscriptions>,
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    meta: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ErrorHeader {
    #[serde(rename = "s", default)]
    source: u8,
    #[serde(rename = "m", default)]
    message: String,
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    code: Option<i64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HeaderV1 {
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    kind: Option<u8>,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    stream: Option<String>,
    #[serde(rename = "n", default, skip_serializing_if = "Option::is_none")]
    no: Option<i64>,
    #[serde(rename = "f", default, skip_serializing_if = "Option::is_none")]
    full: Option<Value>,
    #[serde(rename = "u", default, skip_serializing_if = "Option::is_none")]
    subscriptions: Option<Vec<CursorV1>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorV1 {
    #[serde(rename = "s", default)]
    stream: String,
    #[serde(rename = "n", default)]
    no: i64,
}

impl HeaderV2 {
    fn from_message(msg: &Message) -> Self {
        Self {
            kind: Some(msg.kind.code()),
            correlation_id: msg.correlation_id,
            error: msg.error.as_ref().map(|e| ErrorHeader {
                source: e.source.code(),
                message: e.message.clone(),
                code: e.code,
            }),
            uri: msg.uri.clone(),
            ts: msg.ts,
            update_type: msg.update_type.map(UpdateType::code),
            subscriptions: msg.subscriptions.clone(),
            meta: msg.meta.clone(),
        }
    }

    fn into_message(self) -> Message {
        Message {
            kind: self.kind.map(MessageType::from_code).unwrap_or_default(),
            correlation_id: self.correlation_id,
            error: self.error.map(|e| WireError {
                source: ErrorSource::from_code(e.source),
                message: e.message,
                code: e.code,
            }),
            uri: self.uri,
            ts: self.ts,
            update_type: self.update_type.map(UpdateType::from_code),
            subscriptions: self.subscriptions,
            meta: self.meta,
            body: None,
        }
    }
}

impl HeaderV1 {
    fn from_message(msg: &Message) -> Self {
        Self {
            kind: Some(msg.kind.code()),
            stream: msg.uri.clone(),
            no: msg.ts,
            full: (msg.update_type == Some(UpdateType::Full)).then(|| Value::from(1)),
            subscriptions: msg.subscriptions.as_ref().map(|subs| {
                subs.iter()
                    .map(|(stream, no)| CursorV1 {
                        stream: stream.clone(),
                        no: *no,
                    })
                    .collect()
            }),
        }
    }

    fn into_message(self) -> Message {
        let full = self.full.as_ref().is_some_and(is_truthy);
        Message {
            kind: self.kind.map(MessageType::from_code).unwrap_or_default(),
            uri: self.stream,
            ts: self.no,
            update_type: full.then_some(UpdateType::Full),
            subscriptions: self.subscriptions.map(|list| {
                list.into_iter()
                    .filter(|c| !c.stream.is_empty())
                    .map(|c| (c.stream, c.no))
                    .collect()
            }),
            ..Message::default()
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Codec
// ─────────────────────────────────────────────────────────────────────────────

/// Packs and unpacks messages for one protocol generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Codec {
    version: ProtocolVersion,
}

impl Codec {
    /// Codec for the given alias table.
    pub const fn new(version: ProtocolVersion) -> Self {
        Self { version }
    }

    /// Selected alias table.
    pub const fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Encode one message. The body segment is written only when present and
    /// not `null`.
    pub fn pack(&self, msg: &Message) -> Result<String, CodecError> {
        let mut buf = match self.version {
            ProtocolVersion::V2 => serde_json::to_string(&HeaderV2::from_message(msg)),
            ProtocolVersion::V1 => serde_json::to_string(&HeaderV1::from_message(msg)),
        }
        .map_err(CodecError::Header)?;

        if let Some(body) = msg.body.as_ref().filter(|b| !b.is_null()) {
            buf.push('\n');
            buf.push_str(&serde_json::to_string(body).map_err(CodecError::Body)?);
        }
        Ok(buf)
    }

    /// Encode several messages into one payload.
    pub fn pack_batch(&self, msgs: &[Message]) -> Result<String, CodecError> {
        let packed = msgs
            .iter()
            .map(|m| self.pack(m))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(packed.join(MESSAGE_SEPARATOR))
    }

    /// Decode a payload. Each segment is parsed independently; segments with
    /// an unparseable header are skipped.
    pub fn unpack(&self, payload: &str) -> Vec<Message> {
        if payload.is_empty() {
            return Vec::new();
        }
        payload
            .split(MESSAGE_SEPARATOR)
            .filter_map(|segment| self.unpack_one(segment))
            .collect()
    }

    /// Decode one segment: header line plus optional body.
    pub fn unpack_one(&self, segment: &str) -> Option<Message> {
        let (header, body) = match segment.split_once('\n') {
            Some((header, body)) => (header, Some(body)),
            None => (segment, None),
        };

        let parsed = match self.version {
            ProtocolVersion::V2 => {
                serde_json::from_str::<HeaderV2>(header).map(HeaderV2::into_message)
            }
            ProtocolVersion::V1 => {
                serde_json::from_str::<HeaderV1>(header).map(HeaderV1::into_message)
            }
        };
        let mut msg = match parsed {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, header, "dropping segment with invalid header");
                return None;
            }
        };

        if let Some(body) = body.filter(|b| !b.is_empty()) {
            match serde_json::from_str::<Value>(body) {
                Ok(value) => msg.body = Some(value),
                Err(e) => debug!(error = %e, "ignoring invalid message body"),
            }
        }

        if msg.kind == MessageType::Publish && msg.update_type.is_none() {
            msg.update_type = Some(UpdateType::Diff);
        }
        Some(msg)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
