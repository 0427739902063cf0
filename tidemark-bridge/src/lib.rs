//! Secondary distribution of replica state.
//!
//! The bridge listens on its own endpoint and, on a fixed interval, pushes a
//! JSON array of every registered replica's top levels to each connected
//! client. The client side re-hydrates read-only replica mirrors from that
//! broadcast; no reconciliation is needed because the source already
//! guarantees consistency.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async};
use tracing::{debug, warn};

use tidemark_core::{BookOrder, Price, Quantity, Symbol};
use tidemark_feed::{FeedError, FeedResult};
use tidemark_replica::BookReplica;

/// Endpoint and cadence of the broadcast.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub broadcast_interval: Duration,
    /// How many levels per side go out with each frame.
    pub depth: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            broadcast_interval: Duration::from_millis(1_000),
            depth: 100,
        }
    }
}

/// One book inside a broadcast frame: `{symbol, asks, bids}` with levels as
/// `[price, quantity]` pairs.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BridgeFrame {
    pub symbol: Symbol,
    pub asks: Vec<(Price, Quantity)>,
    pub bids: Vec<(Price, Quantity)>,
}

type ClientSlots = Arc<Mutex<Vec<mpsc::UnboundedSender<Message>>>>;
type SharedBooks = Arc<RwLock<Vec<Arc<BookReplica>>>>;

/// Broadcast server for secondary consumers.
pub struct DistributionBridge {
    addr: SocketAddr,
    books: SharedBooks,
    shutdown_tx: Option<oneshot::Sender<()>>,
    accept_handle: JoinHandle<()>,
    broadcast_handle: JoinHandle<()>,
}

impl DistributionBridge {
    /// Bind the endpoint and start the accept and broadcast tasks.
    pub async fn spawn(config: BridgeConfig, books: Vec<Arc<BookReplica>>) -> FeedResult<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|err| FeedError::Transport(err.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|err| FeedError::Transport(err.to_string()))?;

        let clients: ClientSlots = Arc::new(Mutex::new(Vec::new()));
        let books: SharedBooks = Arc::new(RwLock::new(books));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let accept_clients = clients.clone();
        let accept_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let clients = accept_clients.clone();
                            tokio::spawn(async move {
                                if let Err(err) = serve_client(clients, stream, peer).await {
                                    debug!(error = %err, "bridge client ended with error");
                                }
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "failed to accept bridge connection");
                            break;
                        }
                    }
                }
            }
        });

        let broadcast_books = books.clone();
        let broadcast_clients = clients.clone();
        let cadence = config.broadcast_interval;
        let depth = config.depth;
        let broadcast_handle = tokio::spawn(async move {
            let mut ticks = interval(cadence);
            loop {
                ticks.tick().await;
                broadcast_once(&broadcast_books, &broadcast_clients, depth);
            }
        });

        Ok(Self {
            addr,
            books,
            shutdown_tx: Some(shutdown_tx),
            accept_handle,
            broadcast_handle,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Add another replica to the broadcast set.
    pub fn register(&self, replica: Arc<BookReplica>) {
        self.books
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(replica);
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.broadcast_handle.abort();
        self.accept_handle.abort();
    }
}

impl Drop for DistributionBridge {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.broadcast_handle.abort();
        self.accept_handle.abort();
    }
}

fn broadcast_once(books: &SharedBooks, clients: &ClientSlots, depth: usize) {
    let frames: Vec<BridgeFrame> = books
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|replica| {
            let (bids, asks) = replica.top_levels(depth);
            BridgeFrame {
                symbol: replica.symbol().to_string(),
                asks,
                bids,
            }
        })
        .collect();
    let payload = match serde_json::to_string(&frames) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "failed to serialize bridge frames");
            return;
        }
    };
    // Slow or dead clients drop out here; they never block the broadcast.
    clients
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|slot| slot.send(Message::Text(payload.clone())).is_ok());
}

async fn serve_client(
    clients: ClientSlots,
    stream: TcpStream,
    peer: SocketAddr,
) -> FeedResult<()> {
    let ws = accept_async(stream)
        .await
        .map_err(|err| FeedError::Transport(err.to_string()))?;
    debug!(%peer, "bridge client connected");
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    clients
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Ping(payload)) => {
                let _ = tx.send(Message::Pong(payload));
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    drop(tx);
    writer.abort();
    Ok(())
}

/// Read-only mirror of the broadcast: each frame fully replaces the matching
/// local replica.
pub struct BridgeClient {
    mirrors: Arc<RwLock<std::collections::HashMap<Symbol, Arc<BookReplica>>>>,
    reader_handle: JoinHandle<()>,
}

impl BridgeClient {
    /// Connect to a bridge endpoint and start mirroring.
    pub async fn connect(url: &str) -> FeedResult<Self> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|err| FeedError::Transport(err.to_string()))?;
        let mirrors: Arc<RwLock<std::collections::HashMap<Symbol, Arc<BookReplica>>>> =
            Arc::new(RwLock::new(std::collections::HashMap::new()));
        let reader_mirrors = mirrors.clone();
        let (mut sink, mut source) = ws.split();
        let reader_handle = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => apply_frames(&reader_mirrors, &text),
                    Ok(Message::Ping(payload)) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });
        Ok(Self {
            mirrors,
            reader_handle,
        })
    }

    /// The mirror replica for `symbol`, once a frame mentioning it arrived.
    #[must_use]
    pub fn mirror(&self, symbol: &str) -> Option<Arc<BookReplica>> {
        self.mirrors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .cloned()
    }

    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        self.mirrors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn shutdown(&self) {
        self.reader_handle.abort();
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

fn apply_frames(
    mirrors: &RwLock<std::collections::HashMap<Symbol, Arc<BookReplica>>>,
    text: &str,
) {
    let frames: Vec<BridgeFrame> = match serde_json::from_str(text) {
        Ok(frames) => frames,
        Err(err) => {
            warn!(error = %err, "undecodable bridge frame");
            return;
        }
    };
    for frame in frames {
        let replica = {
            let mut map = mirrors.write().unwrap_or_else(PoisonError::into_inner);
            map.entry(frame.symbol.clone())
                .or_insert_with(|| Arc::new(BookReplica::new(frame.symbol.clone())))
                .clone()
        };
        let to_orders = |levels: &[(Price, Quantity)]| {
            levels
                .iter()
                .map(|&(price, quantity)| BookOrder::price_keyed(price, quantity))
                .collect::<Vec<_>>()
        };
        replica.insert_snapshot(to_orders(&frame.bids), to_orders(&frame.asks));
    }
}
