//! # amp-client
//!
//! Realtime client engine for the amp wire protocol.
//!
//! One [`Client`] multiplexes three concerns over one logical connection:
//!
//! - **Requests**: [`Client::request`] sends a `request` and resolves when the
//!   matching `response` arrives ([`correlator`])
//! - **Subscriptions**: [`Client::subscribe`] tracks a topic, merges its
//!   `full`/`diff` publishes into a snapshot and notifies handlers
//!   ([`registry`])
//! - **Failover**: traffic starts on HTTP long-polling and moves to the
//!   WebSocket once it answers a ping, falling back when it drops
//!   ([`transport`])
//!
//! ```no_run
//! # async fn demo() -> Result<(), amp_core::ClientError> {
//! use amp_client::Client;
//! use amp_settings::ClientSettings;
//!
//! let client = Client::builder(ClientSettings::default()).build()?;
//! let _ = client.subscribe("prices", |event| println!("{event:?}"));
//! let sum = client.request("math/add", serde_json::json!({"x": 1, "y": 2})).await?;
//! # let _ = sum;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod client;
pub mod correlator;
pub mod registry;
pub mod transport;

pub use client::{Client, ClientBuilder, TransportObserver};
pub use correlator::{Correlator, PendingRequest, Reply};
pub use registry::{
    ChangeObserver, Delivery, HandlerId, PublishOutcome, Subscription, SubscriptionRegistry,
    TopicEvent, TopicHandler,
};
pub use transport::{
    ConnectionStatus, PollingTransport, SocketState, SocketTransport, StatusEvent, Transport,
    TransportChange, TransportKind, TransportSupervisor,
};

pub use amp_core::{ApplicationError, ClientError, ErrorSource, Snapshot, TransportError};
