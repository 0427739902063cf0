//! Per-feed subscription state machine.
//!
//! A `SubscriptionController` drives its `Transport` through connect →
//! authenticate (optional) → subscribe → live, and re-drives the whole
//! sequence from scratch whenever the transport reports closure, replaying
//! every previously accepted subscription in first-accepted order. Reconnects
//! are transparent to consumers: they never re-subscribe themselves.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant};
use tracing::{debug, info, warn};

use tidemark_core::{
    BookEvent, BookEventKind, DepthSnapshot, LevelChange, SequencedDelta, Side, Symbol,
};
use tidemark_feed::{
    Credentials, FatalError, FatalHandle, FatalKind, FeedError, FeedEvents, FeedResult,
    SnapshotFetcher, SnapshotPolicy, Subscription, SubscriptionKind, VenueAdapter, VenueMessage,
};
use tidemark_replica::{
    BookReplica, ConsistencyMonitor, DeltaDisposition, MonitorConfig, RestSnapshotClient,
    SequenceReconciler, SnapshotDecision, SyncState,
};
use tidemark_transport::{CloseReason, ConnectionState, Transport, TransportOptions};

/// Feed lifecycle as observed by consumers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControllerState {
    Idle,
    Connecting,
    Authenticating,
    Subscribing,
    Live,
}

/// Reconnect pacing: immediate first attempt, then capped exponential
/// backoff with jitter. Every accepted subscription is always replayed.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(20);
        let scaled = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);
        if self.jitter && !scaled.is_zero() {
            let factor = rand::thread_rng().gen_range(0.5..1.0);
            scaled.mul_f64(factor)
        } else {
            scaled
        }
    }
}

/// Everything one feed session needs to know about its venue endpoints and
/// timing limits.
#[derive(Clone)]
pub struct SessionConfig {
    pub ws_url: String,
    pub rest_url: Option<String>,
    pub credentials: Option<Credentials>,
    /// Deadline for the login exchange and for every subscribe ack.
    pub handshake_timeout: Duration,
    /// Cadence of the in-band keepalive, for venues that ping in-band.
    pub keepalive_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub monitor: MonitorConfig,
    pub transport: TransportOptions,
    /// Pause before retrying a stale or failed snapshot fetch.
    pub snapshot_retry_delay: Duration,
}

impl SessionConfig {
    #[must_use]
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            rest_url: None,
            credentials: None,
            handshake_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(20),
            reconnect: ReconnectPolicy::default(),
            monitor: MonitorConfig::default(),
            transport: TransportOptions::default(),
            snapshot_retry_delay: Duration::from_millis(250),
        }
    }

    #[must_use]
    pub fn with_rest_url(mut self, rest_url: impl Into<String>) -> Self {
        self.rest_url = Some(rest_url.into());
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

enum Command {
    Connect(oneshot::Sender<FeedResult<()>>),
    Subscribe(Subscription, oneshot::Sender<FeedResult<()>>),
    Shutdown,
}

enum TransportSignal {
    Open,
    Close(CloseReason),
    Error(String),
    Message(String),
}

struct SnapshotOutcome {
    symbol: Symbol,
    result: FeedResult<DepthSnapshot>,
}

enum AwaitOutcome {
    Matched(VenueMessage),
    TimedOut,
    Closed,
}

type ReplicaMap = Arc<RwLock<HashMap<Symbol, Arc<BookReplica>>>>;

/// Cloneable consumer-facing handle to a running controller.
#[derive(Clone)]
pub struct FeedHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: Arc<FeedEvents>,
    replicas: ReplicaMap,
    state_rx: watch::Receiver<ControllerState>,
}

impl FeedHandle {
    /// Open the transport and run the venue handshake.
    pub async fn connect(&self) -> FeedResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect(reply_tx))
            .map_err(|_| FeedError::Other("controller stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| FeedError::Other("controller stopped".into()))?
    }

    /// Register and issue a subscription; resolves on the venue ack.
    pub async fn subscribe(&self, subscription: Subscription) -> FeedResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe(subscription, reply_tx))
            .map_err(|_| FeedError::Other("controller stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| FeedError::Other("controller stopped".into()))?
    }

    /// Stop the controller and close its transport.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    #[must_use]
    pub fn events(&self) -> Arc<FeedEvents> {
        self.events.clone()
    }

    /// The live replica for `symbol`, once an order-book subscription exists.
    #[must_use]
    pub fn replica(&self, symbol: &str) -> Option<Arc<BookReplica>> {
        self.replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .cloned()
    }

    #[must_use]
    pub fn state(&self) -> ControllerState {
        *self.state_rx.borrow()
    }

    /// Await a specific lifecycle state; useful in tests and supervisors.
    pub async fn wait_for_state(&self, target: ControllerState) {
        let mut state_rx = self.state_rx.clone();
        while *state_rx.borrow() != target {
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// The per-feed state machine. Construct with [`SubscriptionController::new`],
/// then drive it with [`SubscriptionController::run`] (usually via
/// [`start_session`]).
pub struct SubscriptionController {
    venue: Arc<dyn VenueAdapter>,
    config: SessionConfig,
    transport: Transport,
    transport_rx: mpsc::UnboundedReceiver<TransportSignal>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    snapshot_tx: mpsc::UnboundedSender<SnapshotOutcome>,
    snapshot_rx: mpsc::UnboundedReceiver<SnapshotOutcome>,
    subscriptions: Vec<Subscription>,
    events: Arc<FeedEvents>,
    replicas: ReplicaMap,
    monitors: HashMap<Symbol, ConsistencyMonitor>,
    reconcilers: HashMap<Symbol, SequenceReconciler>,
    fetcher: Option<Arc<dyn SnapshotFetcher>>,
    fatal: FatalHandle,
    state_tx: watch::Sender<ControllerState>,
}

impl SubscriptionController {
    pub fn new(
        venue: Arc<dyn VenueAdapter>,
        mut config: SessionConfig,
        fatal: FatalHandle,
    ) -> FeedResult<(Self, FeedHandle)> {
        config.transport.fatal = Some(fatal.clone());
        let transport = Transport::new(config.transport.clone());

        let (signal_tx, transport_rx) = mpsc::unbounded_channel();
        let open_tx = signal_tx.clone();
        transport.on_open(move |_| {
            let _ = open_tx.send(TransportSignal::Open);
        });
        let close_tx = signal_tx.clone();
        transport.on_close(move |reason| {
            let _ = close_tx.send(TransportSignal::Close(*reason));
        });
        let error_tx = signal_tx.clone();
        transport.on_error(move |err| {
            let _ = error_tx.send(TransportSignal::Error(err.to_string()));
        });
        let message_tx = signal_tx;
        transport.on_message(move |raw| {
            let _ = message_tx.send(TransportSignal::Message(raw.clone()));
        });

        let fetcher: Option<Arc<dyn SnapshotFetcher>> =
            match (venue.snapshot_policy(), &config.rest_url) {
                (SnapshotPolicy::RestSequenced, Some(rest_url)) => Some(Arc::new(
                    RestSnapshotClient::new(rest_url.clone(), venue.clone())?,
                )),
                (SnapshotPolicy::RestSequenced, None) => {
                    return Err(FeedError::InvalidRequest(format!(
                        "venue '{}' needs a rest_url for snapshot fetches",
                        venue.name()
                    )))
                }
                (SnapshotPolicy::WsManaged, _) => None,
            };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ControllerState::Idle);
        let events = Arc::new(FeedEvents::new());
        let replicas: ReplicaMap = Arc::new(RwLock::new(HashMap::new()));

        let handle = FeedHandle {
            cmd_tx,
            events: events.clone(),
            replicas: replicas.clone(),
            state_rx,
        };
        let controller = Self {
            venue,
            config,
            transport,
            transport_rx,
            cmd_rx,
            snapshot_tx,
            snapshot_rx,
            subscriptions: Vec::new(),
            events,
            replicas,
            monitors: HashMap::new(),
            reconcilers: HashMap::new(),
            fetcher,
            fatal,
            state_tx,
        };
        Ok((controller, handle))
    }

    /// Replace the snapshot fetcher (tests inject canned collaborators here).
    pub fn set_snapshot_fetcher(&mut self, fetcher: Arc<dyn SnapshotFetcher>) {
        self.fetcher = Some(fetcher);
    }

    fn set_state(&self, state: ControllerState) {
        self.state_tx.send_replace(state);
    }

    /// Drive the feed until shutdown.
    pub async fn run(mut self) {
        let mut keepalive = interval(self.config.keepalive_interval);
        keepalive.tick().await;
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Connect(reply)) => {
                        let result = self.establish().await;
                        let lift = result.is_ok();
                        let _ = reply.send(result);
                        if lift {
                            self.set_state(ControllerState::Live);
                        }
                    }
                    Some(Command::Subscribe(subscription, reply)) => {
                        let result = self.accept_subscription(subscription).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown) | None => {
                        self.transport.disconnect().await;
                        self.set_state(ControllerState::Idle);
                        break;
                    }
                },
                Some(signal) = self.transport_rx.recv() => {
                    self.handle_signal(signal).await;
                }
                Some(outcome) = self.snapshot_rx.recv() => {
                    self.handle_snapshot_outcome(outcome);
                }
                _ = keepalive.tick() => {
                    if self.transport.state() == ConnectionState::Open {
                        if let Some(payload) = self.venue.heartbeat_command() {
                            self.transport.send(payload);
                        }
                    }
                }
            }
        }
    }

    /// Connect the transport and run the optional login exchange.
    async fn establish(&mut self) -> FeedResult<()> {
        self.set_state(ControllerState::Connecting);
        self.transport.connect(&self.config.ws_url).await?;

        let login = self
            .config
            .credentials
            .as_ref()
            .and_then(|credentials| self.venue.login_command(credentials));
        if let Some(payload) = login {
            self.set_state(ControllerState::Authenticating);
            self.transport.send(payload);
            let deadline = Instant::now() + self.config.handshake_timeout;
            match self
                .await_matching(deadline, |msg| matches!(msg, VenueMessage::AuthAck { .. }))
                .await
            {
                AwaitOutcome::Matched(VenueMessage::AuthAck { success: true, .. }) => {
                    info!(venue = self.venue.name(), "login acknowledged");
                }
                AwaitOutcome::Matched(VenueMessage::AuthAck { detail, .. }) => {
                    return Err(FeedError::Authentication(
                        detail.unwrap_or_else(|| "login rejected".into()),
                    ));
                }
                AwaitOutcome::Matched(_) => {
                    return Err(FeedError::Other("unexpected handshake reply".into()))
                }
                AwaitOutcome::TimedOut => {
                    let fatal = FatalError::new(
                        FatalKind::HandshakeTimeout,
                        "login exchange unanswered",
                    )
                    .with_venue_detail(self.venue.name().to_string());
                    self.fatal.raise(fatal.clone());
                    return Err(FeedError::Fatal(fatal));
                }
                AwaitOutcome::Closed => {
                    return Err(FeedError::Transport("connection closed during login".into()))
                }
            }
        }
        Ok(())
    }

    async fn accept_subscription(&mut self, subscription: Subscription) -> FeedResult<()> {
        if self.transport.state() != ConnectionState::Open {
            return Err(FeedError::Transport(
                "transport not connected; call connect first".into(),
            ));
        }
        self.prepare_symbol_state(&subscription);
        let result = self.issue_subscribe(&subscription).await;
        if result.is_ok() {
            // Structural dedup; a duplicate still re-ran the wire handshake
            // above, but replay tracks each subscription once.
            if !self.subscriptions.contains(&subscription) {
                self.subscriptions.push(subscription);
            }
            self.set_state(ControllerState::Live);
        }
        result
    }

    /// Stand up the replica, monitor and reconciler a subscription needs.
    fn prepare_symbol_state(&mut self, subscription: &Subscription) {
        if subscription.kind != SubscriptionKind::OrderBook {
            return;
        }
        let Some(symbol) = subscription.symbol.clone() else {
            return;
        };
        let replica = self.ensure_replica(&symbol);
        if self.venue.snapshot_policy() == SnapshotPolicy::RestSequenced {
            self.reconcilers
                .entry(symbol)
                .or_insert_with(|| SequenceReconciler::new(replica.symbol()));
        }
    }

    fn ensure_replica(&mut self, symbol: &str) -> Arc<BookReplica> {
        let existing = self
            .replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .cloned();
        if let Some(replica) = existing {
            return replica;
        }
        let replica = Arc::new(BookReplica::new(symbol));
        self.replicas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(symbol.to_string(), replica.clone());
        let monitor = ConsistencyMonitor::spawn(
            replica.clone(),
            self.config.monitor.clone(),
            self.fatal.clone(),
        );
        self.monitors.insert(symbol.to_string(), monitor);
        replica
    }

    fn replica(&self, symbol: &str) -> Option<Arc<BookReplica>> {
        self.replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .cloned()
    }

    async fn issue_subscribe(&mut self, subscription: &Subscription) -> FeedResult<()> {
        self.set_state(ControllerState::Subscribing);
        let correlation_id = self.venue.next_correlation_id();
        let command = self.venue.subscribe_command(&correlation_id, subscription);
        self.transport.send(command);

        let deadline = Instant::now() + self.config.handshake_timeout;
        let wanted = correlation_id.clone();
        let outcome = self
            .await_matching(deadline, move |msg| {
                matches!(msg, VenueMessage::Ack { id, .. } if *id == wanted)
            })
            .await;
        match outcome {
            AwaitOutcome::Matched(VenueMessage::Ack { success: true, .. }) => {
                info!(topic = %subscription.topic, "subscription acknowledged");
                self.start_book_sync(subscription);
                Ok(())
            }
            AwaitOutcome::Matched(VenueMessage::Ack { detail, .. }) => Err(FeedError::Venue(
                detail.unwrap_or_else(|| "subscription rejected".into()),
            )),
            AwaitOutcome::Matched(_) => Err(FeedError::Other("unexpected subscribe reply".into())),
            AwaitOutcome::TimedOut => {
                let fatal = FatalError::new(
                    FatalKind::SubscribeTimeout,
                    format!("no ack for '{}'", subscription.topic),
                )
                .with_venue_detail(self.venue.name().to_string());
                self.fatal.raise(fatal.clone());
                Err(FeedError::Fatal(fatal))
            }
            AwaitOutcome::Closed => Err(FeedError::Transport(
                "connection closed awaiting subscribe ack".into(),
            )),
        }
    }

    /// Kick off the snapshot fetch for a freshly acknowledged book
    /// subscription on a sequenced venue.
    fn start_book_sync(&mut self, subscription: &Subscription) {
        if subscription.kind != SubscriptionKind::OrderBook {
            return;
        }
        let Some(symbol) = subscription.symbol.clone() else {
            return;
        };
        let needs_fetch = self
            .reconcilers
            .get(&symbol)
            .map(|reconciler| reconciler.state() == SyncState::Synchronizing)
            .unwrap_or(false);
        if needs_fetch {
            self.spawn_snapshot_fetch(symbol, Duration::ZERO);
        }
    }

    fn spawn_snapshot_fetch(&self, symbol: Symbol, delay: Duration) {
        let Some(fetcher) = self.fetcher.clone() else {
            warn!(symbol = %symbol, "no snapshot fetcher configured");
            return;
        };
        let outcome_tx = self.snapshot_tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            let result = fetcher.fetch(&symbol).await;
            let _ = outcome_tx.send(SnapshotOutcome { symbol, result });
        });
    }

    fn handle_snapshot_outcome(&mut self, outcome: SnapshotOutcome) {
        let retry_delay = self.config.snapshot_retry_delay;
        let synchronizing = self
            .reconcilers
            .get(&outcome.symbol)
            .map(|reconciler| reconciler.state() == SyncState::Synchronizing)
            .unwrap_or(false);
        if !synchronizing {
            // A late fetch for an unknown or already synchronized book.
            return;
        }
        let snapshot = match outcome.result {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(symbol = %outcome.symbol, error = %err, "snapshot fetch failed");
                self.spawn_snapshot_fetch(outcome.symbol, retry_delay);
                return;
            }
        };
        let decision = match self.reconcilers.get_mut(&outcome.symbol) {
            Some(reconciler) => reconciler.accept_snapshot(snapshot.last_update_id),
            None => return,
        };
        match decision {
            SnapshotDecision::Accept { replay } => {
                if let Some(replica) = self.replica(&outcome.symbol) {
                    replica.insert_snapshot(
                        snapshot.side_orders(Side::Buy),
                        snapshot.side_orders(Side::Sell),
                    );
                    for delta in &replay {
                        replica.apply(&LevelChange::at_price(
                            delta.side,
                            delta.price,
                            Some(delta.quantity),
                        ));
                    }
                    info!(
                        symbol = %outcome.symbol,
                        replayed = replay.len(),
                        "book synchronized"
                    );
                    self.events
                        .update
                        .publish(&BookEvent::now(outcome.symbol, BookEventKind::Snapshot));
                }
            }
            SnapshotDecision::Stale => {
                debug!(symbol = %outcome.symbol, "stale snapshot; refetching");
                self.spawn_snapshot_fetch(outcome.symbol, retry_delay);
            }
        }
    }

    async fn handle_signal(&mut self, signal: TransportSignal) {
        match signal {
            TransportSignal::Open => debug!("transport reported open"),
            TransportSignal::Message(raw) => {
                self.handle_raw(&raw, |_| false);
            }
            TransportSignal::Error(detail) => {
                warn!(%detail, "transport error");
            }
            TransportSignal::Close(CloseReason::Local) => {
                // Deliberate local closes (shutdown or connection replacement)
                // must not trigger the reconnect machinery.
                debug!("transport closed locally");
            }
            TransportSignal::Close(reason) => {
                warn!(?reason, "transport closed; reconnecting");
                self.on_connection_lost();
                self.reconnect_and_replay().await;
            }
        }
    }

    fn on_connection_lost(&mut self) {
        self.set_state(ControllerState::Idle);
        let replicas: Vec<Arc<BookReplica>> = self
            .replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for replica in replicas {
            replica.clear();
            self.events.update.publish(&BookEvent::now(
                replica.symbol().to_string(),
                BookEventKind::Cleared,
            ));
        }
        for reconciler in self.reconcilers.values_mut() {
            reconciler.begin_resync();
        }
    }

    /// Reconnect indefinitely, then replay every accepted subscription in
    /// first-accepted order before reporting live.
    async fn reconnect_and_replay(&mut self) {
        let mut attempt: u32 = 0;
        loop {
            let delay = self.config.reconnect.delay_for(attempt);
            if !delay.is_zero() {
                sleep(delay).await;
            }
            attempt += 1;
            match self.establish().await {
                Ok(()) => match self.replay_subscriptions().await {
                    Ok(()) => {
                        self.set_state(ControllerState::Live);
                        info!(
                            subscriptions = self.subscriptions.len(),
                            "feed live after reconnect"
                        );
                        return;
                    }
                    Err(FeedError::Fatal(_)) => return,
                    Err(err) => {
                        warn!(error = %err, "replay failed; reconnecting");
                    }
                },
                Err(FeedError::Fatal(_)) => return,
                Err(err) => {
                    warn!(error = %err, attempt, "reconnect attempt failed");
                }
            }
        }
    }

    async fn replay_subscriptions(&mut self) -> FeedResult<()> {
        let pending = self.subscriptions.clone();
        for subscription in &pending {
            self.prepare_symbol_state(subscription);
            self.issue_subscribe(subscription).await?;
        }
        Ok(())
    }

    /// Decode one raw frame; the message matching `matcher` (if any) is
    /// returned, everything else is dispatched normally.
    fn handle_raw(
        &mut self,
        raw: &str,
        matcher: impl Fn(&VenueMessage) -> bool,
    ) -> Option<VenueMessage> {
        let messages = match self.venue.decode(raw) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(error = %err, "failed to decode venue frame");
                return None;
            }
        };
        let mut matched = None;
        for message in messages {
            if matched.is_none() && matcher(&message) {
                matched = Some(message);
            } else {
                self.dispatch(message);
            }
        }
        matched
    }

    fn dispatch(&mut self, message: VenueMessage) {
        match message {
            VenueMessage::BookSnapshot {
                symbol,
                bids,
                asks,
            } => {
                if let Some(replica) = self.replica(&symbol) {
                    replica.insert_snapshot(bids, asks);
                    self.events
                        .update
                        .publish(&BookEvent::now(symbol, BookEventKind::Snapshot));
                }
            }
            VenueMessage::BookDelta {
                symbol,
                changes,
                sequence,
                first_sequence,
            } => self.apply_book_delta(symbol, changes, sequence, first_sequence),
            VenueMessage::Trade(trade) => self.events.trades.publish(&trade),
            VenueMessage::OrderUpdate(order) => self.events.creations_updates.publish(&order),
            VenueMessage::Cancelation(order) => self.events.cancelations.publish(&order),
            VenueMessage::Execution(execution) => self.events.executions.publish(&execution),
            VenueMessage::Ack { id, .. } => debug!(%id, "unsolicited ack"),
            VenueMessage::AuthAck { success, .. } => {
                debug!(success, "auth ack outside handshake")
            }
            VenueMessage::Pong => debug!("in-band heartbeat ack"),
            VenueMessage::Ignored => {}
        }
    }

    fn apply_book_delta(
        &mut self,
        symbol: Symbol,
        changes: Vec<LevelChange>,
        sequence: Option<u64>,
        first_sequence: Option<u64>,
    ) {
        let Some(replica) = self.replica(&symbol) else {
            return;
        };
        let disposition = match (self.reconcilers.get_mut(&symbol), sequence) {
            (Some(reconciler), Some(sequence)) => {
                let disposition = reconciler.classify(sequence, first_sequence);
                if matches!(
                    disposition,
                    DeltaDisposition::Buffered | DeltaDisposition::ResyncRequired
                ) {
                    for change in &changes {
                        if let Some(price) = change.price {
                            reconciler.buffer(SequencedDelta {
                                symbol: symbol.clone(),
                                side: change.side,
                                price,
                                quantity: change.quantity.unwrap_or_default(),
                                sequence,
                                first_sequence,
                            });
                        }
                    }
                }
                disposition
            }
            _ => DeltaDisposition::Apply,
        };
        match disposition {
            DeltaDisposition::Apply => {
                replica.apply_batch(&changes);
                self.events
                    .update
                    .publish(&BookEvent::now(symbol, BookEventKind::Delta));
            }
            DeltaDisposition::ResyncRequired => {
                self.spawn_snapshot_fetch(symbol, Duration::ZERO);
            }
            DeltaDisposition::Buffered | DeltaDisposition::Discard => {}
        }
    }

    /// Pull transport signals until one decodes to a message matching
    /// `matcher`, dispatching everything else on the way.
    async fn await_matching(
        &mut self,
        deadline: Instant,
        matcher: impl Fn(&VenueMessage) -> bool,
    ) -> AwaitOutcome {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return AwaitOutcome::TimedOut;
            }
            match timeout(remaining, self.transport_rx.recv()).await {
                Ok(Some(TransportSignal::Message(raw))) => {
                    if let Some(message) = self.handle_raw(&raw, &matcher) {
                        return AwaitOutcome::Matched(message);
                    }
                }
                Ok(Some(TransportSignal::Close(reason))) => {
                    warn!(?reason, "transport closed mid-handshake");
                    return AwaitOutcome::Closed;
                }
                Ok(Some(TransportSignal::Error(detail))) => {
                    warn!(%detail, "transport error mid-handshake");
                }
                Ok(Some(TransportSignal::Open)) => {}
                Ok(None) => return AwaitOutcome::Closed,
                Err(_) => return AwaitOutcome::TimedOut,
            }
        }
    }
}

/// Build a controller, spawn its run loop, and return the consumer handle
/// plus the task driving the feed.
pub fn start_session(
    venue: Arc<dyn VenueAdapter>,
    config: SessionConfig,
    fatal: FatalHandle,
) -> FeedResult<(FeedHandle, JoinHandle<()>)> {
    let (controller, handle) = SubscriptionController::new(venue, config, fatal)?;
    let task = tokio::spawn(controller.run());
    Ok((handle, task))
}
