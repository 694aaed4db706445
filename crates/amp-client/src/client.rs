//! Client facade.
//!
//! [`Client`] ties the codec, correlator, registry and transports together.
//! Inbound payloads from either transport land in [`ClientCore`], which
//! dispatches each message by type. Best-effort traffic (pong replies,
//! subscribe messages) goes through an outbox task so no lock is ever held
//! across a send.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use amp_core::{ClientError, Codec, Message, MessageType, Snapshot};
use amp_logging::{DiagnosticSink, HttpSink, TracingSink};
use amp_settings::ClientSettings;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::correlator::Correlator;
use crate::registry::{HandlerId, PublishOutcome, SubscriptionRegistry, TopicEvent};
use crate::transport::{
    ConnectionStatus, InboundHandler, PollingConfig, PollingTransport, SocketConfig, SocketState,
    SocketTransport, SubscriptionSource, TransportChange, TransportKind, TransportSupervisor,
};

/// Observer told about every transport status change.
pub type TransportObserver = Arc<dyn Fn(&TransportChange) + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Core
// ─────────────────────────────────────────────────────────────────────────────

/// State shared by the facade and both transports.
pub(crate) struct ClientCore {
    registry: Mutex<SubscriptionRegistry>,
    correlator: Mutex<Correlator>,
    codec: Codec,
    diagnostics: Arc<dyn DiagnosticSink>,
    outbox: mpsc::UnboundedSender<Message>,
}

impl ClientCore {
    pub(crate) fn new(
        codec: Codec,
        track_changes: bool,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let observer_tx = outbox.clone();
        let registry = SubscriptionRegistry::new(
            track_changes,
            Some(Box::new(move |message: Message| {
                let _ = observer_tx.send(message);
            })),
        );
        let core = Arc::new(Self {
            registry: Mutex::new(registry),
            correlator: Mutex::new(Correlator::new()),
            codec,
            diagnostics,
            outbox,
        });
        (core, outbox_rx)
    }

    fn on_publish(&self, message: Message) {
        let outcome = self.registry.lock().apply_publish(message);
        if let PublishOutcome::Delivered(delivery) = outcome {
            let _ = delivery.dispatch(self.diagnostics.as_ref());
        }
    }

    fn resubscribe(&self) {
        let message = self.registry.lock().subscribe_message();
        if message.subscriptions.as_ref().is_some_and(|s| !s.is_empty()) {
            let _ = self.outbox.send(message);
        }
    }
}

impl InboundHandler for ClientCore {
    fn on_payload(&self, payload: &str) -> bool {
        let mut saw_pong = false;
        for message in self.codec.unpack(payload) {
            match message.kind {
                MessageType::Publish => self.on_publish(message),
                MessageType::Response => {
                    let _ = self.correlator.lock().resolve(message);
                }
                MessageType::Ping => {
                    let _ = self.outbox.send(Message::pong());
                }
                MessageType::Pong => saw_pong = true,
                MessageType::Alive => {}
                other => debug!(kind = %other, "unhandled message type dropped"),
            }
        }
        saw_pong
    }
}

impl SubscriptionSource for ClientCore {
    fn subscribe_message(&self) -> Message {
        self.registry.lock().subscribe_message()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Configures and starts a [`Client`].
pub struct ClientBuilder {
    settings: ClientSettings,
    diagnostics: Option<Arc<dyn DiagnosticSink>>,
    on_transport_change: Option<TransportObserver>,
    http: Option<reqwest::Client>,
    init_logging: bool,
}

impl ClientBuilder {
    /// Builder over `settings`.
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings,
            diagnostics: None,
            on_transport_change: None,
            http: None,
            init_logging: false,
        }
    }

    /// Route diagnostics to `sink` instead of the one derived from settings.
    #[must_use]
    pub fn diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    /// Observe transport changes.
    #[must_use]
    pub fn on_transport_change(
        mut self,
        observer: impl Fn(&TransportChange) + Send + Sync + 'static,
    ) -> Self {
        self.on_transport_change = Some(Arc::new(observer));
        self
    }

    /// Share an HTTP client with the polling transport.
    #[must_use]
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Install the global stderr subscriber at `logLevel` when building.
    /// Hosts with their own `tracing` setup leave this off.
    #[must_use]
    pub fn init_logging(mut self) -> Self {
        self.init_logging = true;
        self
    }

    /// Validate settings and start the transports.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<Client, ClientError> {
        let settings = self.settings;
        settings
            .validate()
            .map_err(|e| ClientError::Config(e.to_string()))?;
        if self.init_logging {
            amp_logging::init_subscriber(&settings.log_level);
        }
        let _ = reqwest::Url::parse(&settings.polling_url)
            .map_err(|e| ClientError::Config(format!("pollingUrl: {e}")))?;
        if !settings.force_polling {
            let _ = reqwest::Url::parse(&settings.socket_url)
                .map_err(|e| ClientError::Config(format!("socketUrl: {e}")))?;
        }
        let runtime = Handle::try_current()
            .map_err(|_| ClientError::Config("client must be built inside a Tokio runtime".into()))?;

        let http = self.http.unwrap_or_default();
        let diagnostics = self.diagnostics.unwrap_or_else(|| match &settings.diagnostics_url {
            Some(url) => {
                Arc::new(HttpSink::with_client(http.clone(), url.as_str())) as Arc<dyn DiagnosticSink>
            }
            None => Arc::new(TracingSink) as Arc<dyn DiagnosticSink>,
        });

        let codec = Codec::new(settings.protocol);
        let (core, outbox_rx) = ClientCore::new(codec, settings.track_changes, diagnostics);
        let cancel = CancellationToken::new();

        let polling = PollingTransport::new(
            PollingConfig::from_settings(&settings),
            codec,
            http,
            Arc::clone(&core) as Arc<dyn InboundHandler>,
            Arc::clone(&core) as Arc<dyn SubscriptionSource>,
            cancel.child_token(),
        );
        let (socket, status_rx) = if settings.force_polling {
            (None, None)
        } else {
            let (socket, status_rx) = SocketTransport::spawn(
                SocketConfig::from_settings(&settings),
                codec,
                Arc::clone(&core) as Arc<dyn InboundHandler>,
                cancel.child_token(),
            );
            (Some(socket), Some(status_rx))
        };
        let supervisor = Arc::new(TransportSupervisor::new(polling, socket));

        let _ = runtime.spawn(run_outbox(
            Arc::clone(&supervisor),
            outbox_rx,
            cancel.clone(),
        ));
        if let Some(status_rx) = status_rx {
            let _ = runtime.spawn(run_status(
                Arc::clone(&core),
                Arc::clone(&supervisor),
                status_rx,
                self.on_transport_change,
                settings.log_transport_changes,
                cancel.clone(),
            ));
        }

        info!(
            transport = %supervisor.current(),
            socket_url = %settings.socket_url,
            polling_url = %settings.polling_url,
            force_polling = settings.force_polling,
            "client started"
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                core,
                supervisor,
                runtime,
                request_timeout: settings.request_timeout(),
                cancel: cancel.clone(),
                _guard: cancel.drop_guard(),
            }),
        })
    }
}

/// Forwards best-effort messages to the current transport in the order they
/// were queued. Pong replies go straight to the socket, where pings arrive.
async fn run_outbox(
    supervisor: Arc<TransportSupervisor>,
    mut outbox: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            next = outbox.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };
        let kind = message.kind;
        let socket = supervisor.socket().filter(|_| {
            kind == MessageType::Pong || supervisor.current() == TransportKind::Socket
        });

        if let Some(socket) = socket {
            // Queueing is ordered; only the write result is awaited elsewhere.
            match socket.queue(&message) {
                Ok(written) => {
                    let _ = tokio::spawn(async move {
                        if let Err(e) = written.await {
                            debug!(%kind, error = %e, "best-effort send failed");
                        }
                    });
                }
                Err(e) => debug!(%kind, error = %e, "best-effort send failed"),
            }
        } else if kind == MessageType::Subscribe {
            // Arming does not wait on the network.
            if let Err(e) = supervisor.polling().send_message(&message).await {
                debug!(%kind, error = %e, "best-effort send failed");
            }
        } else {
            let supervisor = Arc::clone(&supervisor);
            let _ = tokio::spawn(async move {
                if let Err(e) = supervisor.polling().send_message(&message).await {
                    debug!(%kind, error = %e, "best-effort send failed");
                }
            });
        }
    }
}

/// Feeds socket status changes to the supervisor and reports them.
async fn run_status(
    core: Arc<ClientCore>,
    supervisor: Arc<TransportSupervisor>,
    mut status_rx: mpsc::UnboundedReceiver<ConnectionStatus>,
    observer: Option<TransportObserver>,
    log_changes: bool,
    cancel: CancellationToken,
) {
    loop {
        let status = tokio::select! {
            () = cancel.cancelled() => break,
            next = status_rx.recv() => match next {
                Some(status) => status,
                None => break,
            },
        };

        let outcome = supervisor.on_socket_status(status);
        if outcome.resubscribe {
            core.resubscribe();
        }
        if log_changes {
            let record = serde_json::to_value(&outcome.change).unwrap_or(Value::Null);
            if outcome.change.status.connected {
                core.diagnostics.info(&record);
            } else {
                core.diagnostics.error(&record);
            }
        }
        if let Some(observer) = &observer {
            observer(&outcome.change);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

struct ClientInner {
    core: Arc<ClientCore>,
    supervisor: Arc<TransportSupervisor>,
    runtime: Handle,
    request_timeout: Option<Duration>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

/// Realtime client handle. Clones share one connection; dropping the last
/// clone shuts it down.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("transport", &self.transport())
            .field("topics", &self.topics())
            .field("pending_requests", &self.pending_requests())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Client {
    /// Start building a client.
    pub fn builder(settings: ClientSettings) -> ClientBuilder {
        ClientBuilder::new(settings)
    }

    /// Register `handler` for `topic`.
    ///
    /// The first handler of a topic triggers a `subscribe` on the current
    /// transport. Later handlers are called at once with the current state.
    pub fn subscribe(
        &self,
        topic: &str,
        handler: impl Fn(&TopicEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        let (id, replay) = self.inner.core.registry.lock().add(topic, Arc::new(handler));
        if let Some(replay) = replay {
            let _ = replay.dispatch(self.inner.core.diagnostics.as_ref());
        }
        id
    }

    /// Detach a handler; the topic is dropped with its last handler.
    pub fn unsubscribe(&self, topic: &str, id: HandlerId) -> bool {
        self.inner.core.registry.lock().remove(topic, id)
    }

    /// Call `uri` and wait for its response.
    pub async fn request(&self, uri: &str, payload: Value) -> Result<Value, ClientError> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(ClientError::Closed);
        }
        let (message, pending) = inner.core.correlator.lock().build_request(uri, payload);
        let correlation_id = pending.correlation_id();
        debug!(uri, correlation_id, transport = %inner.supervisor.current(), "request");

        let exchange = async {
            inner.supervisor.send(message).await?;
            pending.wait().await
        };
        let timed = async {
            match inner.request_timeout {
                Some(limit) => tokio::time::timeout(limit, exchange)
                    .await
                    .unwrap_or(Err(ClientError::Timeout {
                        correlation_id,
                        timeout_ms: duration_ms(limit),
                    })),
                None => exchange.await,
            }
        };
        let result = tokio::select! {
            () = inner.cancel.cancelled() => Err(ClientError::Closed),
            result = timed => result,
        };

        if let Err(e) = &result {
            let _ = inner.core.correlator.lock().cancel(correlation_id);
            if !e.is_application() {
                warn!(uri, correlation_id, error = %e, "request failed");
            }
        }
        result
    }

    /// Fire a request whose failure is reported to the diagnostic sink.
    pub fn request_detached(&self, uri: &str, payload: Value) {
        let client = self.clone();
        let uri = uri.to_string();
        let _ = self.inner.runtime.spawn(async move {
            if let Err(e) = client.request(&uri, payload).await {
                client.inner.core.diagnostics.error(&json!({
                    "name": "requestFailed",
                    "uri": uri,
                    "message": e.to_string(),
                }));
            }
        });
    }

    /// Send client metadata to the server.
    pub async fn set_meta(&self, meta: BTreeMap<String, String>) -> Result<(), ClientError> {
        if self.inner.cancel.is_cancelled() {
            return Err(ClientError::Closed);
        }
        self.inner.supervisor.send(Message::meta(meta)).await?;
        Ok(())
    }

    /// Transport currently carrying traffic.
    pub fn transport(&self) -> TransportKind {
        self.inner.supervisor.current()
    }

    /// Socket lifecycle state, `None` when polling is forced.
    pub fn socket_state(&self) -> Option<SocketState> {
        self.inner.supervisor.socket().map(SocketTransport::state)
    }

    /// Socket connection status, `None` when polling is forced.
    pub fn socket_status(&self) -> Option<ConnectionStatus> {
        self.inner.supervisor.socket().map(SocketTransport::status)
    }

    /// Subscribed topics, in subscription order.
    pub fn topics(&self) -> Vec<String> {
        self.inner.core.registry.lock().topics()
    }

    /// Current merged state of `topic`.
    pub fn snapshot(&self, topic: &str) -> Option<Arc<Snapshot>> {
        self.inner.core.registry.lock().snapshot(topic)
    }

    /// Requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.core.correlator.lock().pending_count()
    }

    /// Close both transports and fail every pending request.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.supervisor.close();
        self.inner.core.correlator.lock().fail_all();
        info!("client closed");
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
