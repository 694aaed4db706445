//! HTTP long-polling transport.
//!
//! Every subscribed topic gets its own request loop. A topic has at most one
//! request in flight; a successful poll re-arms immediately from the latest
//! cursor, a 4xx abandons the topic and anything else retries after a fixed
//! delay.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use amp_core::{Codec, Message, MessageType, Subscriptions, TransportError};
use amp_settings::ClientSettings;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{InboundHandler, SubscriptionSource, Transport, TransportKind};

/// Polling transport configuration.
#[derive(Clone, Debug)]
pub struct PollingConfig {
    /// Long-polling endpoint.
    pub url: String,
    /// Delay before retrying a topic after a retryable failure.
    pub retry_delay: Duration,
}

impl PollingConfig {
    /// Configuration from client settings.
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            url: settings.polling_url.clone(),
            retry_delay: settings.polling.retry_delay(),
        }
    }
}

struct PollingInner {
    config: PollingConfig,
    codec: Codec,
    http: reqwest::Client,
    in_flight: Mutex<HashSet<String>>,
    stopped: AtomicBool,
    inbound: Arc<dyn InboundHandler>,
    cursor: Arc<dyn SubscriptionSource>,
    cancel: CancellationToken,
}

/// Long-polling transport handle.
#[derive(Clone)]
pub struct PollingTransport {
    inner: Arc<PollingInner>,
}

impl PollingTransport {
    /// Create the transport. Nothing is polled until a `subscribe` is sent.
    pub fn new(
        config: PollingConfig,
        codec: Codec,
        http: reqwest::Client,
        inbound: Arc<dyn InboundHandler>,
        cursor: Arc<dyn SubscriptionSource>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(PollingInner {
                config,
                codec,
                http,
                in_flight: Mutex::new(HashSet::new()),
                stopped: AtomicBool::new(false),
                inbound,
                cursor,
                cancel,
            }),
        }
    }

    /// Suppress re-arming. Requests already in flight still complete.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    /// Allow re-arming again.
    pub fn resume(&self) {
        self.inner.stopped.store(false, Ordering::SeqCst);
    }

    /// Whether re-arming is suppressed.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Topics with a request in flight.
    pub fn in_flight(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.inner.in_flight.lock().iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Route one message: `subscribe` arms topic loops, anything else is a
    /// one-shot POST whose reply is fed to the inbound handler.
    pub async fn send_message(&self, message: &Message) -> Result<(), TransportError> {
        if message.kind == MessageType::Subscribe {
            if let Some(subscriptions) = &message.subscriptions {
                PollingInner::arm(&self.inner, subscriptions);
            }
            return Ok(());
        }

        let text = self.inner.codec.pack(message)?;
        let body = self.inner.post(text).await?;
        if !body.is_empty() {
            let _ = self.inner.inbound.on_payload(&body);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.send_message(&message).await
    }
}

impl PollingInner {
    /// Start a loop for every topic in `subscriptions` not already in flight.
    fn arm(this: &Arc<Self>, subscriptions: &Subscriptions) {
        for (topic, ts) in subscriptions {
            if !this.in_flight.lock().insert(topic.clone()) {
                continue;
            }
            let inner = Arc::clone(this);
            let topic = topic.clone();
            let ts = *ts;
            let _ = tokio::spawn(async move { inner.poll_topic(topic, ts).await });
        }
    }

    /// Re-arm from the current cursor unless stopped.
    fn rearm(this: &Arc<Self>) {
        if this.stopped.load(Ordering::SeqCst) || this.cancel.is_cancelled() {
            return;
        }
        let subscribe = this.cursor.subscribe_message();
        if let Some(subscriptions) = &subscribe.subscriptions {
            Self::arm(this, subscriptions);
        }
    }

    async fn poll_topic(self: Arc<Self>, topic: String, ts: i64) {
        let mut cursor = Subscriptions::new();
        let _ = cursor.insert(topic.clone(), ts);
        let result = match self.codec.pack(&Message::subscribe(cursor)) {
            Ok(text) => self.post(text).await,
            Err(e) => Err(TransportError::from(e)),
        };
        let _ = self.in_flight.lock().remove(&topic);

        match result {
            Ok(body) => {
                if !body.is_empty() {
                    let _ = self.inbound.on_payload(&body);
                }
                Self::rearm(&self);
            }
            Err(e) if e.is_client_error() => {
                warn!(topic = %topic, error = %e, "poll rejected, abandoning topic");
            }
            Err(e) => {
                warn!(
                    topic = %topic,
                    error = %e,
                    retry_ms = self.config.retry_delay.as_millis(),
                    "poll failed, retrying"
                );
                tokio::select! {
                    () = self.cancel.cancelled() => {}
                    () = tokio::time::sleep(self.config.retry_delay) => Self::rearm(&self),
                }
            }
        }
    }

    async fn post(&self, text: String) -> Result<String, TransportError> {
        let response = self
            .http
            .post(&self.config.url)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(text)
            .send()
            .await
            .map_err(|e| TransportError::Network {
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| TransportError::Network {
            message: e.to_string(),
        })?;
        if !status.is_success() {
            debug!(status = status.as_u16(), "polling request failed");
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
