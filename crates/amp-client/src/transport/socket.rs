//! Persistent WebSocket transport.
//!
//! One driver task owns the connection: it dials, pings, waits for the first
//! pong and reconnects with exponential backoff. Senders queue frames for the
//! driver and wait for the write result. The queue outlives individual
//! connections, so a frame sent while connecting is written once the next
//! connection opens.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use amp_core::{Codec, Message, TransportError};
use amp_settings::{ClientSettings, GiveUpPolicy};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::status::{ConnectionStatus, SocketState};
use super::{InboundHandler, Transport, TransportKind};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Backoff after `attempts` consecutive failed connections:
/// `unit * 2^min(attempts, cap)`.
pub fn reconnect_delay(attempts: u32, unit: Duration, cap: u32) -> Duration {
    let exponent = attempts.min(cap).min(31);
    unit.saturating_mul(1_u32 << exponent)
}

/// What the reconnect loop does before an attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GiveUpAction {
    /// Dial as usual.
    Proceed,
    /// Enter [`SocketState::GivenUp`] and stop.
    Stop,
    /// Report once, then dial as usual.
    Notify,
}

/// Decide the give-up action for attempt number `attempts`.
///
/// The policy only applies once `attempts` exceeds `after` and the socket
/// has never been healthy.
pub fn give_up_action(
    policy: GiveUpPolicy,
    after: u32,
    attempts: u32,
    success: bool,
    notified: bool,
) -> GiveUpAction {
    if success || attempts <= after {
        return GiveUpAction::Proceed;
    }
    match policy {
        GiveUpPolicy::Never => GiveUpAction::Proceed,
        GiveUpPolicy::Stop => GiveUpAction::Stop,
        GiveUpPolicy::Notify if !notified => GiveUpAction::Notify,
        GiveUpPolicy::Notify => GiveUpAction::Proceed,
    }
}

/// Socket driver configuration.
#[derive(Clone, Debug)]
pub struct SocketConfig {
    /// WebSocket endpoint.
    pub url: String,
    /// Ping interval before the first pong.
    pub ping_interval: Duration,
    /// Ping interval once healthy.
    pub healthy_ping_interval: Duration,
    /// Window for the first pong after open.
    pub pong_timeout: Duration,
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// Backoff time unit.
    pub reconnect_unit: Duration,
    /// Backoff exponent cap.
    pub reconnect_cap: u32,
    /// Give-up policy.
    pub give_up_policy: GiveUpPolicy,
    /// Attempts allowed before the policy applies.
    pub give_up_after: u32,
}

impl SocketConfig {
    /// Driver configuration from client settings.
    pub fn from_settings(settings: &ClientSettings) -> Self {
        let socket = &settings.socket;
        Self {
            url: settings.socket_url.clone(),
            ping_interval: socket.ping_interval(),
            healthy_ping_interval: socket.healthy_ping_interval(),
            pong_timeout: socket.pong_timeout(),
            connect_timeout: socket.connect_timeout(),
            reconnect_unit: socket.reconnect_unit(),
            reconnect_cap: socket.reconnect_cap,
            give_up_policy: socket.give_up.policy,
            give_up_after: socket.give_up.after_attempts,
        }
    }
}

struct Outbound {
    text: String,
    reply: oneshot::Sender<Result<(), TransportError>>,
}

struct SocketShared {
    codec: Codec,
    outbound: mpsc::UnboundedSender<Outbound>,
    status: Mutex<ConnectionStatus>,
}

/// Handle to the socket driver task.
#[derive(Clone)]
pub struct SocketTransport {
    shared: Arc<SocketShared>,
    state: watch::Receiver<SocketState>,
    cancel: CancellationToken,
}

impl SocketTransport {
    /// Start the driver. Every status change (healthy, disconnected,
    /// give-up) is pushed to the returned receiver.
    pub fn spawn(
        config: SocketConfig,
        codec: Codec,
        inbound: Arc<dyn InboundHandler>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionStatus>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SocketShared {
            codec,
            outbound,
            status: Mutex::new(ConnectionStatus::new()),
        });
        let (state_tx, state_rx) = watch::channel(SocketState::Connecting);
        let (status_tx, status_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            config,
            shared: Arc::clone(&shared),
            inbound,
            state: state_tx,
            status_tx,
            cancel: cancel.clone(),
        };
        let _ = tokio::spawn(driver.run(outbound_rx));

        (
            Self {
                shared,
                state: state_rx,
                cancel,
            },
            status_rx,
        )
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    /// Receiver following lifecycle state changes.
    pub fn watch_state(&self) -> watch::Receiver<SocketState> {
        self.state.clone()
    }

    /// Snapshot of the connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.lock().clone()
    }

    /// Stop the driver. Frames still queued fail with
    /// [`TransportError::Closed`].
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Queue `message` behind every frame queued before it and return a
    /// future resolving with its write result.
    ///
    /// Fails at once only when the driver has stopped. Otherwise the frame
    /// waits for an open connection, across reconnects if needed.
    pub fn queue(
        &self,
        message: &Message,
    ) -> Result<impl Future<Output = Result<(), TransportError>> + Send + use<>, TransportError> {
        match self.state() {
            SocketState::Closed => return Err(TransportError::Closed),
            SocketState::GivenUp => {
                let attempts = self.shared.status.lock().connects;
                return Err(TransportError::GivenUp { attempts });
            }
            _ => {}
        }
        let text = self.shared.codec.pack(message)?;
        let (reply, written) = oneshot::channel();
        self.shared
            .outbound
            .send(Outbound { text, reply })
            .map_err(|_| TransportError::Closed)?;
        Ok(async move { written.await.unwrap_or(Err(TransportError::Closed)) })
    }

    /// Encode and write one message, waiting for the connection to open.
    pub async fn send_message(&self, message: &Message) -> Result<(), TransportError> {
        self.queue(message)?.await
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.send_message(&message).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Driver
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    Cancelled,
}

struct Driver {
    config: SocketConfig,
    shared: Arc<SocketShared>,
    inbound: Arc<dyn InboundHandler>,
    state: watch::Sender<SocketState>,
    status_tx: mpsc::UnboundedSender<ConnectionStatus>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(self, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        let end = self.reconnect(&mut outbound).await;
        self.set_state(end);

        outbound.close();
        let attempts = self.shared.status.lock().connects;
        while let Ok(out) = outbound.try_recv() {
            let err = match end {
                SocketState::GivenUp => TransportError::GivenUp { attempts },
                _ => TransportError::Closed,
            };
            let _ = out.reply.send(Err(err));
        }
        info!(url = %self.config.url, state = ?end, "socket driver stopped");
    }

    /// Dial and re-dial until cancelled or given up. Returns the terminal
    /// state.
    async fn reconnect(&self, outbound: &mut mpsc::UnboundedReceiver<Outbound>) -> SocketState {
        let mut backoff_attempts: u32 = 0;
        let mut notified = false;

        loop {
            let (attempt, success) = {
                let mut status = self.shared.status.lock();
                status.begin_attempt();
                (status.connects, status.success)
            };

            match give_up_action(
                self.config.give_up_policy,
                self.config.give_up_after,
                attempt,
                success,
                notified,
            ) {
                GiveUpAction::Stop => {
                    error!(url = %self.config.url, attempt, "socket reconnect abandoned");
                    self.shared.status.lock().record("giveUp");
                    self.set_state(SocketState::GivenUp);
                    self.publish();
                    return SocketState::GivenUp;
                }
                GiveUpAction::Notify => {
                    error!(url = %self.config.url, attempt, "socket unreachable, still retrying");
                    notified = true;
                    self.shared.status.lock().record("giveUp");
                    self.publish();
                }
                GiveUpAction::Proceed => {}
            }

            debug!(url = %self.config.url, attempt, "socket connecting");
            let dialed = tokio::select! {
                () = self.cancel.cancelled() => return SocketState::Closed,
                result = timeout(self.config.connect_timeout, connect_async(self.config.url.as_str())) => result,
            };

            let mut reached_healthy = false;
            let mut cancelled = false;
            match dialed {
                Ok(Ok((ws, _))) => {
                    let (end, healthy) = self.run_session(ws, outbound).await;
                    reached_healthy = healthy;
                    cancelled = end == SessionEnd::Cancelled;
                }
                Ok(Err(e)) => {
                    warn!(url = %self.config.url, attempt, error = %e, "socket connect failed");
                    self.shared
                        .status
                        .lock()
                        .record_detail("wsError", None, None, Some(e.to_string()));
                }
                Err(_) => {
                    warn!(url = %self.config.url, attempt, "socket connect timed out");
                    self.shared.status.lock().record("connectTimeout");
                }
            }

            self.shared.status.lock().mark_disconnected();
            if cancelled || self.cancel.is_cancelled() {
                return SocketState::Closed;
            }
            if reached_healthy {
                backoff_attempts = 0;
            }

            self.set_state(SocketState::Connecting);
            self.publish();

            backoff_attempts = backoff_attempts.saturating_add(1);
            let delay = reconnect_delay(
                backoff_attempts,
                self.config.reconnect_unit,
                self.config.reconnect_cap,
            );
            debug!(attempt, delay_ms = delay.as_millis(), "socket reconnect scheduled");

            tokio::select! {
                () = self.cancel.cancelled() => return SocketState::Closed,
                () = sleep(delay) => {}
            }
        }
    }

    /// Drive one open connection until it closes. Returns how it ended and
    /// whether it became healthy.
    async fn run_session(
        &self,
        ws: WsStream,
        outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> (SessionEnd, bool) {
        let (mut sink, mut stream) = ws.split();
        self.shared.status.lock().mark_opened();
        self.set_state(SocketState::OpenUnhealthy);
        info!(url = %self.config.url, "socket open");

        let mut healthy = false;
        let mut ping_interval = self.config.ping_interval;
        let mut ping_token: u64 = 0;
        let mut next_ping = Instant::now();
        let mut pong_deadline = Some(Instant::now() + self.config.pong_timeout);

        let end = loop {
            let watchdog = pong_deadline.unwrap_or(next_ping);
            let mut became_healthy = false;

            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = sink.send(Frame::Close(None)).await;
                    break SessionEnd::Cancelled;
                }
                Some(out) = outbound.recv() => {
                    let result = sink
                        .send(Frame::Text(out.text.into()))
                        .await
                        .map_err(|e| TransportError::Write { message: e.to_string() });
                    let failed = result.as_ref().err().map(ToString::to_string);
                    let _ = out.reply.send(result);
                    if let Some(message) = failed {
                        warn!(error = %message, "socket write failed");
                        self.shared.status.lock().record_detail("sendError", None, None, Some(message));
                        break SessionEnd::Closed;
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Frame::Text(text))) => {
                        became_healthy = self.handle_payload(text.as_str());
                    }
                    Some(Ok(Frame::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => became_healthy = self.handle_payload(text),
                        Err(e) => debug!(error = %e, "dropping non-utf8 binary frame"),
                    },
                    Some(Ok(Frame::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), Some(f.reason.as_str().to_owned())))
                            .unwrap_or_default();
                        info!(?code, ?reason, "socket closed by server");
                        self.shared.status.lock().record_detail("close", code, reason, None);
                        break SessionEnd::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "socket read failed");
                        self.shared.status.lock().record_detail("wsError", None, None, Some(e.to_string()));
                        break SessionEnd::Closed;
                    }
                    None => {
                        self.shared.status.lock().record("close");
                        break SessionEnd::Closed;
                    }
                },
                () = sleep_until(next_ping) => {
                    ping_token += 1;
                    next_ping = Instant::now() + ping_interval;
                    if let Err(e) = self.send_ping(&mut sink, ping_token).await {
                        warn!(error = %e, "socket ping failed");
                        self.shared.status.lock().record_detail("pingError", None, None, Some(e.to_string()));
                        break SessionEnd::Closed;
                    }
                }
                () = sleep_until(watchdog), if pong_deadline.is_some() => {
                    warn!(url = %self.config.url, "no pong within timeout, closing socket");
                    self.shared.status.lock().record("pongTimeout");
                    let _ = sink.close().await;
                    break SessionEnd::Closed;
                }
            }

            if became_healthy {
                healthy = true;
                pong_deadline = None;
                ping_interval = self.config.healthy_ping_interval;
                next_ping = Instant::now() + ping_interval;
                self.set_state(SocketState::Healthy);
                self.publish();
                info!(url = %self.config.url, "socket healthy");
            }
        };

        (end, healthy)
    }

    async fn send_ping(
        &self,
        sink: &mut futures::stream::SplitSink<WsStream, Frame>,
        token: u64,
    ) -> Result<(), TransportError> {
        let text = self.shared.codec.pack(&Message::ping(token))?;
        sink.send(Frame::Text(text.into()))
            .await
            .map_err(|e| TransportError::Ping {
                message: e.to_string(),
            })
    }

    /// Dispatch a payload; `true` when it carried the connection's first pong.
    fn handle_payload(&self, text: &str) -> bool {
        let is_pong = self.inbound.on_payload(text);
        self.shared.status.lock().on_message(is_pong)
    }

    fn set_state(&self, state: SocketState) {
        let _ = self.state.send_replace(state);
    }

    fn publish(&self) {
        let status = self.shared.status.lock().clone();
        let _ = self.status_tx.send(status);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
