//! In-process amp WebSocket server for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use amp_core::{Codec, ErrorSource, Message, MessageType, ProtocolVersion, UpdateType, WireError};
use amp_settings::ClientSettings;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as Frame;

/// How the server treats incoming messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behaviour {
    /// Answer pings, requests and subscribes.
    Responsive,
    /// Accept the connection, record traffic, never answer.
    Silent,
}

struct State {
    codec: Codec,
    behaviour: Mutex<Behaviour>,
    connections: AtomicUsize,
    received: Mutex<Vec<Message>>,
    kick: watch::Sender<u64>,
    push: broadcast::Sender<String>,
}

/// Test server handle. The listener task lives as long as the runtime.
pub struct TestServer {
    addr: SocketAddr,
    state: Arc<State>,
}

impl TestServer {
    pub async fn start(behaviour: Behaviour) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (kick, _) = watch::channel(0);
        let (push, _) = broadcast::channel(64);
        let state = Arc::new(State {
            codec: Codec::new(ProtocolVersion::V2),
            behaviour: Mutex::new(behaviour),
            connections: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            kick,
            push,
        });

        let accept_state = Arc::clone(&state);
        let _ = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let _ = tokio::spawn(serve(stream, Arc::clone(&accept_state)));
            }
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/api", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Message> {
        self.state.received.lock().clone()
    }

    pub fn received_of(&self, kind: MessageType) -> Vec<Message> {
        self.received().into_iter().filter(|m| m.kind == kind).collect()
    }

    pub fn set_behaviour(&self, behaviour: Behaviour) {
        *self.state.behaviour.lock() = behaviour;
    }

    /// Close every open connection from the server side.
    pub fn kick(&self) {
        self.state.kick.send_modify(|generation| *generation += 1);
    }

    /// Send messages to every open connection.
    pub fn push(&self, messages: &[Message]) {
        let text = self.state.codec.pack_batch(messages).unwrap();
        let _ = self.state.push.send(text);
    }
}

async fn serve(stream: TcpStream, state: Arc<State>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let _ = state.connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut stream) = ws.split();
    let mut kick = state.kick.subscribe();
    let _ = kick.borrow_and_update();
    let mut push = state.push.subscribe();

    if *state.behaviour.lock() == Behaviour::Responsive {
        let ping = state.codec.pack(&Message::ping(99)).unwrap();
        let _ = sink.send(Frame::Text(ping.into())).await;
    }

    loop {
        tokio::select! {
            _ = kick.changed() => {
                let _ = sink.close().await;
                return;
            }
            pushed = push.recv() => {
                if let Ok(text) = pushed {
                    let _ = sink.send(Frame::Text(text.into())).await;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Frame::Text(text))) => {
                    let replies = handle(&state, text.as_str());
                    if !replies.is_empty() {
                        let text = state.codec.pack_batch(&replies).unwrap();
                        if sink.send(Frame::Text(text.into())).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(_)) => {}
                _ => return,
            },
        }
    }
}

fn handle(state: &State, payload: &str) -> Vec<Message> {
    let mut replies = Vec::new();
    for message in state.codec.unpack(payload) {
        state.received.lock().push(message.clone());
        if *state.behaviour.lock() == Behaviour::Silent {
            continue;
        }
        match message.kind {
            MessageType::Ping => replies.push(Message::pong()),
            MessageType::Request => {
                let id = message.correlation_id.unwrap_or_default();
                if message.topic() == "fail" {
                    replies.push(Message::error_response(
                        id,
                        WireError {
                            source: ErrorSource::Application,
                            message: "no such method".into(),
                            code: Some(404),
                        },
                    ));
                } else {
                    replies.push(Message::response(
                        id,
                        json!({"uri": message.topic(), "echo": message.body}),
                    ));
                }
            }
            MessageType::Subscribe => {
                for (topic, ts) in message.subscriptions.iter().flatten() {
                    replies.push(Message::publish(
                        topic.clone(),
                        ts + 1,
                        UpdateType::Full,
                        Some(json!({"topic": topic, "resumedFrom": ts})),
                    ));
                }
            }
            _ => {}
        }
    }
    replies
}

/// Client settings with fast timers, pointed at `socket_url`. The polling
/// endpoint is unreachable so data can only arrive over the socket.
pub fn fast_settings(socket_url: &str) -> ClientSettings {
    let mut settings = ClientSettings {
        socket_url: socket_url.to_string(),
        polling_url: "http://127.0.0.1:1/pooling".into(),
        ..ClientSettings::default()
    };
    settings.socket.ping_interval_ms = 50;
    settings.socket.healthy_ping_interval_ms = 200;
    settings.socket.pong_timeout_ms = 300;
    settings.socket.connect_timeout_ms = 2_000;
    settings.socket.reconnect_unit_ms = 20;
    settings.socket.reconnect_cap = 3;
    settings.polling.retry_delay_ms = 60_000;
    settings
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
