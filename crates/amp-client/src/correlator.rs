//! Request/response correlation.
//!
//! Each outgoing request gets a fresh, strictly increasing correlation id and
//! a one-shot slot that the matching `response` fills.

use std::collections::HashMap;

use amp_core::{ApplicationError, ClientError, Message};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

/// Outcome delivered to a pending request.
pub type Reply = Result<Value, ApplicationError>;

/// A request awaiting its response.
#[derive(Debug)]
pub struct PendingRequest {
    correlation_id: u64,
    reply: oneshot::Receiver<Reply>,
}

impl PendingRequest {
    /// Id carried by the request message.
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Wait for the response. A slot dropped without an answer (cancelled,
    /// client closed) yields [`ClientError::Closed`].
    pub async fn wait(self) -> Result<Value, ClientError> {
        match self.reply.await {
            Ok(reply) => reply.map_err(ClientError::from),
            Err(_) => Err(ClientError::Closed),
        }
    }
}

/// Pending-request table.
#[derive(Debug, Default)]
pub struct Correlator {
    last_id: u64,
    pending: HashMap<u64, oneshot::Sender<Reply>>,
}

impl Correlator {
    /// Empty table; the first id handed out is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and build its wire message.
    pub fn build_request(&mut self, uri: &str, payload: Value) -> (Message, PendingRequest) {
        self.last_id += 1;
        let correlation_id = self.last_id;
        let (tx, rx) = oneshot::channel();
        let _ = self.pending.insert(correlation_id, tx);
        (
            Message::request(uri, correlation_id, payload),
            PendingRequest {
                correlation_id,
                reply: rx,
            },
        )
    }

    /// Complete the request a `response` answers. Returns `false` for
    /// responses nobody is waiting on.
    pub fn resolve(&mut self, message: Message) -> bool {
        let Some(correlation_id) = message.correlation_id else {
            debug!("response without correlation id dropped");
            return false;
        };
        let Some(slot) = self.pending.remove(&correlation_id) else {
            debug!(correlation_id, "response for unknown request dropped");
            return false;
        };
        let reply = match message.error {
            Some(error) => Err(ApplicationError::from(error)),
            None => Ok(message.body.unwrap_or(Value::Null)),
        };
        let _ = slot.send(reply);
        true
    }

    /// Forget a request (timed out, or never sent).
    pub fn cancel(&mut self, correlation_id: u64) -> bool {
        self.pending.remove(&correlation_id).is_some()
    }

    /// Drop every pending slot; waiters see [`ClientError::Closed`].
    pub fn fail_all(&mut self) {
        self.pending.clear();
    }

    /// Requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amp_core::{ErrorSource, WireError};
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn ids_strictly_increase() {
        let mut correlator = Correlator::new();
        let ids: Vec<_> = (0..4)
            .map(|_| correlator.build_request("x", json!(null)).1.correlation_id())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(correlator.pending_count(), 4);
    }

    #[test]
    fn request_message_shape() {
        let mut correlator = Correlator::new();
        let (message, pending) = correlator.build_request("math/add", json!({"x": 1, "y": 2}));
        assert_eq!(message.correlation_id, Some(pending.correlation_id()));
        assert_eq!(message.uri.as_deref(), Some("math/add"));
        assert_eq!(message.body, Some(json!({"x": 1, "y": 2})));
    }

    #[tokio::test]
    async fn response_resolves_exactly_once() {
        let mut correlator = Correlator::new();
        let (_, pending) = correlator.build_request("math/add", json!({"x": 1, "y": 2}));

        assert!(correlator.resolve(Message::response(1, json!(3))));
        assert!(!correlator.resolve(Message::response(1, json!(4))));
        assert_eq!(pending.wait().await.unwrap(), json!(3));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_response_is_application_error() {
        let mut correlator = Correlator::new();
        let (_, pending) = correlator.build_request("fail", json!(null));
        let _ = correlator.resolve(Message::error_response(
            1,
            WireError {
                source: ErrorSource::Transport,
                message: "upstream down".into(),
                code: Some(502),
            },
        ));

        let err = pending.wait().await.unwrap_err();
        assert!(err.is_transport());
        assert_matches!(err, ClientError::Application(ref e) if e.message == "upstream down" && e.code == Some(502));
    }

    #[tokio::test]
    async fn missing_body_resolves_null() {
        let mut correlator = Correlator::new();
        let (_, pending) = correlator.build_request("x", json!(null));
        let mut response = Message::response(1, json!(null));
        response.body = None;
        assert!(correlator.resolve(response));
        assert_eq!(pending.wait().await.unwrap(), Value::Null);
    }

    #[test]
    fn unknown_or_unkeyed_responses_are_dropped() {
        let mut correlator = Correlator::new();
        assert!(!correlator.resolve(Message::response(99, json!(1))));
        let mut unkeyed = Message::response(1, json!(1));
        unkeyed.correlation_id = None;
        assert!(!correlator.resolve(unkeyed));
    }

    #[tokio::test]
    async fn cancelled_and_failed_requests_close() {
        let mut correlator = Correlator::new();
        let (_, first) = correlator.build_request("a", json!(null));
        let (_, second) = correlator.build_request("b", json!(null));

        assert!(correlator.cancel(first.correlation_id()));
        assert!(!correlator.resolve(Message::response(1, json!(1))));
        assert_matches!(first.wait().await, Err(ClientError::Closed));

        correlator.fail_all();
        assert_matches!(second.wait().await, Err(ClientError::Closed));
        assert_eq!(correlator.pending_count(), 0);
    }
}
