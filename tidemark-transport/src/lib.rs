//! Single-connection WebSocket wrapper with liveness detection and fault
//! escalation.
//!
//! A `Transport` owns at most one underlying connection, heartbeats it, and
//! reports open/close/error/message events to its listeners. It never retries
//! on its own; reconnection policy belongs to the owning controller.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

use tidemark_feed::{
    EventChannel, FatalError, FatalHandle, FatalKind, FeedError, FeedResult, ListenerId,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STATE_CLOSED: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_OPEN: u8 = 2;

/// Lifecycle of the underlying connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

/// Why the connection ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseReason {
    /// `disconnect` was called or the transport was replaced.
    Local,
    /// The peer closed or the stream ended.
    Remote,
    /// The liveness probe went unanswered.
    HeartbeatTimeout,
    /// A socket-level error forced the close sequence.
    Error,
}

/// Tuning knobs for one transport instance.
#[derive(Clone)]
pub struct TransportOptions {
    /// Grace period between a heartbeat reply and the next probe.
    pub heartbeat_interval: Duration,
    /// How long a probe may go unanswered before the socket is declared dead.
    pub heartbeat_timeout: Duration,
    /// Rolling window after which the fault counter resets to zero.
    pub fault_window: Duration,
    /// Faults tolerated inside one window before escalation.
    pub fault_limit: u32,
    /// Where fault storms are escalated to.
    pub fatal: Option<FatalHandle>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(1000),
            heartbeat_timeout: Duration::from_millis(1000),
            fault_window: Duration::from_secs(120),
            fault_limit: 4,
            fatal: None,
        }
    }
}

enum LinkCommand {
    Send(String),
    Close,
}

/// The four listener registries exposed by a transport.
pub struct TransportChannels {
    pub open: EventChannel<()>,
    pub close: EventChannel<CloseReason>,
    pub error: EventChannel<FeedError>,
    pub message: EventChannel<String>,
}

impl TransportChannels {
    fn new() -> Self {
        Self {
            open: EventChannel::new(),
            close: EventChannel::new(),
            error: EventChannel::new(),
            message: EventChannel::new(),
        }
    }
}

struct FaultWindow {
    count: AtomicU32,
    limit: u32,
    fatal: Option<FatalHandle>,
}

impl FaultWindow {
    fn record(&self, context: &str) {
        let seen = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if seen > self.limit {
            warn!(faults = seen, context, "transport fault storm");
            if let Some(fatal) = &self.fatal {
                fatal.raise(
                    FatalError::new(FatalKind::FaultStorm, "transport fault storm")
                        .with_venue_detail(context.to_string()),
                );
            }
        }
    }

    fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }
}

/// Owns one streaming connection; reusable for a fresh `connect` after close.
pub struct Transport {
    options: TransportOptions,
    channels: Arc<TransportChannels>,
    faults: Arc<FaultWindow>,
    state: Arc<AtomicU8>,
    command_tx: Option<mpsc::UnboundedSender<LinkCommand>>,
    loop_handle: Option<JoinHandle<()>>,
    reset_handle: Option<JoinHandle<()>>,
}

impl Transport {
    #[must_use]
    pub fn new(options: TransportOptions) -> Self {
        let faults = Arc::new(FaultWindow {
            count: AtomicU32::new(0),
            limit: options.fault_limit,
            fatal: options.fatal.clone(),
        });
        Self {
            options,
            channels: Arc::new(TransportChannels::new()),
            faults,
            state: Arc::new(AtomicU8::new(STATE_CLOSED)),
            command_tx: None,
            loop_handle: None,
            reset_handle: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => ConnectionState::Open,
            STATE_CONNECTING => ConnectionState::Connecting,
            _ => ConnectionState::Closed,
        }
    }

    pub fn on_open<F: Fn(&()) + Send + Sync + 'static>(&self, listener: F) -> ListenerId {
        self.channels.open.subscribe(listener)
    }

    pub fn on_close<F: Fn(&CloseReason) + Send + Sync + 'static>(&self, listener: F) -> ListenerId {
        self.channels.close.subscribe(listener)
    }

    pub fn on_error<F: Fn(&FeedError) + Send + Sync + 'static>(&self, listener: F) -> ListenerId {
        self.channels.error.subscribe(listener)
    }

    pub fn on_message<F: Fn(&String) + Send + Sync + 'static>(&self, listener: F) -> ListenerId {
        self.channels.message.subscribe(listener)
    }

    pub fn remove_open_listener(&self, id: ListenerId) -> bool {
        self.channels.open.unsubscribe(id)
    }

    pub fn remove_close_listener(&self, id: ListenerId) -> bool {
        self.channels.close.unsubscribe(id)
    }

    pub fn remove_error_listener(&self, id: ListenerId) -> bool {
        self.channels.error.unsubscribe(id)
    }

    pub fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.channels.message.unsubscribe(id)
    }

    /// Open a connection to `url`, closing and discarding any prior one.
    pub async fn connect(&mut self, url: &str) -> FeedResult<()> {
        self.disconnect().await;
        self.ensure_fault_reset_task();
        self.state.store(STATE_CONNECTING, Ordering::SeqCst);
        let (ws, _) = match connect_async(url).await {
            Ok(connected) => connected,
            Err(err) => {
                self.state.store(STATE_CLOSED, Ordering::SeqCst);
                let error = FeedError::Transport(err.to_string());
                self.faults.record("connect failed");
                self.channels.error.publish(&error);
                return Err(error);
            }
        };
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        self.command_tx = Some(command_tx);
        self.state.store(STATE_OPEN, Ordering::SeqCst);
        let channels = self.channels.clone();
        let faults = self.faults.clone();
        let state = self.state.clone();
        let heartbeat = HeartbeatTimings {
            interval: self.options.heartbeat_interval,
            timeout: self.options.heartbeat_timeout,
        };
        self.loop_handle = Some(tokio::spawn(async move {
            run_loop(ws, command_rx, channels, faults, state, heartbeat).await;
        }));
        Ok(())
    }

    /// Queue a payload for transmission; a no-op when not connected.
    pub fn send(&self, payload: impl Into<String>) {
        if self.state.load(Ordering::SeqCst) != STATE_OPEN {
            return;
        }
        if let Some(tx) = &self.command_tx {
            let _ = tx.send(LinkCommand::Send(payload.into()));
        }
    }

    /// Force-close the current connection, releasing its resources.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(LinkCommand::Close);
        }
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.await;
        }
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
    }

    fn ensure_fault_reset_task(&mut self) {
        if self.reset_handle.is_some() {
            return;
        }
        let faults = self.faults.clone();
        let window = self.options.fault_window;
        self.reset_handle = Some(tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + window, window);
            loop {
                ticks.tick().await;
                faults.reset();
            }
        }));
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(LinkCommand::Close);
        }
        if let Some(handle) = self.reset_handle.take() {
            handle.abort();
        }
    }
}

struct HeartbeatTimings {
    interval: Duration,
    timeout: Duration,
}

enum ProbePhase {
    /// A probe is in flight; the socket dies if the deadline passes.
    AwaitReply,
    /// The last probe was answered; the next one goes out at the deadline.
    Grace,
}

struct Heartbeat {
    timings: HeartbeatTimings,
    phase: ProbePhase,
    deadline: Instant,
    sequence: u64,
}

impl Heartbeat {
    fn new(timings: HeartbeatTimings) -> Self {
        let deadline = Instant::now() + timings.timeout;
        Self {
            timings,
            phase: ProbePhase::AwaitReply,
            deadline,
            sequence: 0,
        }
    }

    fn probe_payload(&self) -> Vec<u8> {
        self.sequence.to_be_bytes().to_vec()
    }

    fn arm_next_probe(&mut self) {
        self.sequence += 1;
        self.phase = ProbePhase::AwaitReply;
        self.deadline = Instant::now() + self.timings.timeout;
    }

    fn on_reply(&mut self, payload: &[u8]) {
        if payload == self.sequence.to_be_bytes() {
            self.phase = ProbePhase::Grace;
            self.deadline = Instant::now() + self.timings.interval;
        } else {
            debug!("ignoring stale heartbeat reply");
        }
    }
}

async fn run_loop(
    mut ws: WsStream,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    channels: Arc<TransportChannels>,
    faults: Arc<FaultWindow>,
    state: Arc<AtomicU8>,
    timings: HeartbeatTimings,
) {
    channels.open.publish(&());
    let mut heartbeat = Heartbeat::new(timings);
    if ws.send(Message::Ping(heartbeat.probe_payload())).await.is_err() {
        faults.record("initial probe failed");
        finish(&channels, &state, CloseReason::Error);
        return;
    }

    let reason = loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(LinkCommand::Send(payload)) => {
                    if let Err(err) = ws.send(Message::Text(payload)).await {
                        faults.record("send failed");
                        channels.error.publish(&FeedError::Transport(err.to_string()));
                        break CloseReason::Error;
                    }
                }
                Some(LinkCommand::Close) | None => {
                    let _ = ws.send(Message::Close(None)).await;
                    break CloseReason::Local;
                }
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => channels.message.publish(&text),
                Some(Ok(Message::Binary(bytes))) => {
                    if let Ok(text) = String::from_utf8(bytes) {
                        channels.message.publish(&text);
                    } else {
                        warn!("received non UTF-8 binary payload");
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(payload))) => heartbeat.on_reply(&payload),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "peer closed the stream");
                    break CloseReason::Remote;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(err)) => {
                    faults.record("stream error");
                    channels.error.publish(&FeedError::Transport(err.to_string()));
                    break CloseReason::Error;
                }
                None => break CloseReason::Remote,
            },
            _ = sleep_until(heartbeat.deadline) => match heartbeat.phase {
                ProbePhase::Grace => {
                    heartbeat.arm_next_probe();
                    if ws.send(Message::Ping(heartbeat.probe_payload())).await.is_err() {
                        faults.record("probe send failed");
                        break CloseReason::Error;
                    }
                }
                ProbePhase::AwaitReply => {
                    warn!("heartbeat reply overdue; force closing");
                    faults.record("heartbeat timeout");
                    let _ = ws.send(Message::Close(None)).await;
                    break CloseReason::HeartbeatTimeout;
                }
            },
        }
    };

    finish(&channels, &state, reason);
}

fn finish(channels: &TransportChannels, state: &AtomicU8, reason: CloseReason) {
    state.store(STATE_CLOSED, Ordering::SeqCst);
    channels.close.publish(&reason);
}
