//! # amp-core
//!
//! Shared vocabulary for the amp realtime client.
//!
//! - **Messages**: [`Message`] with its [`MessageType`] and [`UpdateType`] codes
//! - **Codec**: [`Codec`] packs and unpacks the line-framed wire format for
//!   both header alias generations ([`ProtocolVersion`])
//! - **Errors**: [`TransportError`], [`ApplicationError`] and the facade-level
//!   [`ClientError`]
//! - **Merge engine**: [`Snapshot`] with full/diff reconciliation, change
//!   provenance and ordered list views
//!
//! Nothing in this crate performs I/O.

#![deny(unsafe_code)]

pub mod codec;
pub mod errors;
pub mod merge;
pub mod message;

pub use codec::{Codec, CodecError, MESSAGE_SEPARATOR, ProtocolVersion};
pub use errors::{ApplicationError, ClientError, ErrorSource, TransportError};
pub use merge::{Change, Node, NodeKind, NodePath, ObjectNode, Snapshot, merge_into};
pub use message::{Message, MessageType, Subscriptions, UpdateType, WireError};
