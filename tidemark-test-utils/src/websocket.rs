//! Scriptable in-process venue WebSocket server.
//!
//! Speaks the reference wire protocol (`op`/`args` commands) plus the
//! `method: "SUBSCRIBE"` command family, and exposes fault injection used by
//! the resilience tests: suppressed reads (so heartbeat probes go
//! unanswered), withheld acks, and forced disconnects.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Initial behavior switches; everything is also togglable at runtime.
#[derive(Clone, Debug, Default)]
pub struct MockVenueConfig {
    /// Never read client frames, so protocol pings go unanswered.
    pub silent: bool,
    /// Withhold subscription acks.
    pub withhold_acks: bool,
    /// Reject the login exchange.
    pub reject_auth: bool,
}

struct Shared {
    subscriptions: Mutex<Vec<String>>,
    clients: Mutex<Vec<mpsc::UnboundedSender<Message>>>,
    connections: AtomicUsize,
    silent: AtomicBool,
    withhold_acks: AtomicBool,
    reject_auth: AtomicBool,
}

/// Handle to a running mock venue.
pub struct MockVenueServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MockVenueServer {
    pub async fn spawn(config: MockVenueConfig) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            subscriptions: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            silent: AtomicBool::new(config.silent),
            withhold_acks: AtomicBool::new(config.withhold_acks),
            reject_auth: AtomicBool::new(config.reject_auth),
        });
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let accept_shared = shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let shared = accept_shared.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_socket(shared, stream, peer).await {
                                    debug!(error = %err, "mock venue connection ended");
                                }
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "mock venue accept failed");
                            break;
                        }
                    }
                }
            }
        });
        Ok(Self {
            addr,
            shared,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }

    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Topics subscribed across all connections, in arrival order.
    #[must_use]
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_subscriptions(&self) {
        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Total connections accepted so far.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn set_silent(&self, silent: bool) {
        self.shared.silent.store(silent, Ordering::SeqCst);
    }

    pub fn set_withhold_acks(&self, withhold: bool) {
        self.shared.withhold_acks.store(withhold, Ordering::SeqCst);
    }

    /// Push one raw frame to every connected client.
    pub fn push_frame(&self, frame: Value) {
        let payload = frame.to_string();
        self.shared
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|slot| slot.send(Message::Text(payload.clone())).is_ok());
    }

    /// Close every client connection from the server side.
    pub fn disconnect_clients(&self) {
        let mut clients = self
            .shared
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for slot in clients.iter() {
            let _ = slot.send(Message::Close(None));
        }
        clients.clear();
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

impl Drop for MockVenueServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

async fn handle_socket(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let ws = accept_async(stream).await?;
    shared.connections.fetch_add(1, Ordering::SeqCst);
    debug!(%peer, "mock venue client connected");

    if shared.silent.load(Ordering::SeqCst) {
        // Hold the socket open without ever reading: pings stay unanswered
        // and the client's liveness probe must force the close.
        let _ws = ws;
        std::future::pending::<()>().await;
        return Ok(());
    }

    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    shared
        .clients
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(message) = source.next().await {
        match message? {
            Message::Text(text) => handle_command(&shared, &tx, &text),
            Message::Binary(bytes) => {
                if let Ok(text) = String::from_utf8(bytes) {
                    handle_command(&shared, &tx, &text);
                }
            }
            Message::Ping(payload) => {
                let _ = tx.send(Message::Pong(payload));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    drop(tx);
    writer.abort();
    Ok(())
}

fn handle_command(shared: &Shared, tx: &mpsc::UnboundedSender<Message>, text: &str) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        warn!(payload = text, "mock venue received undecodable frame");
        return;
    };

    match value.get("op").and_then(Value::as_str) {
        Some("ping") => {
            let _ = tx.send(Message::Text(json!({"op": "pong"}).to_string()));
            return;
        }
        Some("login") | Some("auth") => {
            let success = !shared.reject_auth.load(Ordering::SeqCst);
            let reply = json!({"type": "auth", "success": success});
            let _ = tx.send(Message::Text(reply.to_string()));
            return;
        }
        Some("subscribe") => {
            let topics: Vec<String> = value
                .get("args")
                .and_then(Value::as_array)
                .map(|args| {
                    args.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            record_topics(shared, &topics);
            if !shared.withhold_acks.load(Ordering::SeqCst) {
                let ack = json!({
                    "id": value.get("id"),
                    "type": "subscribed",
                    "success": true,
                });
                let _ = tx.send(Message::Text(ack.to_string()));
            }
            return;
        }
        _ => {}
    }

    if value.get("method").and_then(Value::as_str) == Some("SUBSCRIBE") {
        let topics: Vec<String> = value
            .get("params")
            .and_then(Value::as_array)
            .map(|params| {
                params
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        record_topics(shared, &topics);
        if !shared.withhold_acks.load(Ordering::SeqCst) {
            let ack = json!({"result": null, "id": value.get("id")});
            let _ = tx.send(Message::Text(ack.to_string()));
        }
    }
}

fn record_topics(shared: &Shared, topics: &[String]) {
    let mut subscriptions = shared
        .subscriptions
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    for topic in topics {
        subscriptions.push(topic.clone());
    }
}
