//! Venue-agnostic traits used by the rest of the framework.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tidemark_core::{
    BookOrder, DepthSnapshot, ExecutionEvent, LevelChange, OrderEvent, Symbol, TradeEvent,
};

mod events;
mod fatal;

pub use events::{EventChannel, FeedEvents, ListenerId};
pub use fatal::{fatal_channel, FatalError, FatalHandle, FatalKind, FatalMonitor};

/// Convenience alias for feed results.
pub type FeedResult<T> = Result<T, FeedError>;

/// Common error type returned across the feed stack.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Represents transport-level failures (network, timeouts, etc.).
    #[error("transport error: {0}")]
    Transport(String),
    /// Returned when authentication fails or credentials are missing.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Returned when the request parameters are invalid for the target venue.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Wraps serialization or parsing errors.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Venue responded with a business error (e.g., rejected subscription).
    #[error("venue error: {0}")]
    Venue(String),
    /// An unrecoverable condition that must reach process-level supervision.
    #[error("fatal: {0}")]
    Fatal(FatalError),
    /// A catch-all branch for other issues.
    #[error("unexpected error: {0}")]
    Other(String),
}

impl FeedError {
    /// Helper used by adapters when mapping any error type into a feed error.
    pub fn from_display(err: impl std::fmt::Display, kind: FeedErrorKind) -> Self {
        match kind {
            FeedErrorKind::Transport => Self::Transport(err.to_string()),
            FeedErrorKind::Authentication => Self::Authentication(err.to_string()),
            FeedErrorKind::InvalidRequest => Self::InvalidRequest(err.to_string()),
            FeedErrorKind::Serialization => Self::Serialization(err.to_string()),
            FeedErrorKind::Venue => Self::Venue(err.to_string()),
            FeedErrorKind::Other => Self::Other(err.to_string()),
        }
    }
}

/// Enumerates the broad families of feed errors.
#[derive(Debug, Clone, Copy)]
pub enum FeedErrorKind {
    Transport,
    Authentication,
    InvalidRequest,
    Serialization,
    Venue,
    Other,
}

/// API credentials for venues that gate private streams behind a login.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

/// Represents metadata describing the capabilities of a venue adapter.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VenueInfo {
    pub name: String,
    pub markets: Vec<String>,
    pub supports_testnet: bool,
}

/// Classifies what a subscription delivers, so the controller knows which
/// per-symbol machinery (replica, monitors, reconciler) to stand up.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum SubscriptionKind {
    OrderBook,
    Trades,
    Orders,
    Executions,
    Custom,
}

/// The unit of replay after a reconnect.
///
/// Structural equality is the deduplication key; a controller keeps its
/// subscriptions in first-accepted order and replays all of them.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Subscription {
    pub topic: String,
    pub symbol: Option<Symbol>,
    pub kind: SubscriptionKind,
    pub requires_auth: bool,
}

impl Subscription {
    #[must_use]
    pub fn order_book(topic: impl Into<String>, symbol: impl Into<Symbol>) -> Self {
        Self {
            topic: topic.into(),
            symbol: Some(symbol.into()),
            kind: SubscriptionKind::OrderBook,
            requires_auth: false,
        }
    }

    #[must_use]
    pub fn trades(topic: impl Into<String>, symbol: impl Into<Symbol>) -> Self {
        Self {
            topic: topic.into(),
            symbol: Some(symbol.into()),
            kind: SubscriptionKind::Trades,
            requires_auth: false,
        }
    }

    #[must_use]
    pub fn private(topic: impl Into<String>, kind: SubscriptionKind) -> Self {
        Self {
            topic: topic.into(),
            symbol: None,
            kind,
            requires_auth: true,
        }
    }
}

/// How a venue establishes the initial book state for a subscription.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SnapshotPolicy {
    /// The stream itself delivers a snapshot message before deltas.
    WsManaged,
    /// Snapshots come from a REST endpoint and deltas carry sequence
    /// numbers; the reconciler bridges the two.
    RestSequenced,
}

/// A decoded, venue-normalized message.
#[derive(Clone, Debug)]
pub enum VenueMessage {
    /// Command acknowledgment carrying the correlation id it answers.
    Ack {
        id: String,
        success: bool,
        detail: Option<String>,
    },
    /// Outcome of the login exchange.
    AuthAck {
        success: bool,
        detail: Option<String>,
    },
    /// Stream-delivered full book state.
    BookSnapshot {
        symbol: Symbol,
        bids: Vec<BookOrder>,
        asks: Vec<BookOrder>,
    },
    /// Incremental book changes, optionally sequence-tagged.
    BookDelta {
        symbol: Symbol,
        changes: Vec<LevelChange>,
        /// Sequence number of the last update covered by this message.
        sequence: Option<u64>,
        /// Sequence number of the first update covered, when reported.
        first_sequence: Option<u64>,
    },
    Trade(TradeEvent),
    OrderUpdate(OrderEvent),
    Cancelation(OrderEvent),
    Execution(ExecutionEvent),
    /// In-band heartbeat reply.
    Pong,
    /// Recognized but irrelevant to the sync layer.
    Ignored,
}

/// Per-venue protocol behavior, selected once at construction time.
pub trait VenueAdapter: Send + Sync {
    /// Registry/driver name of the venue.
    fn name(&self) -> &'static str;

    /// Returns optional metadata describing the venue.
    fn info(&self) -> Option<VenueInfo> {
        None
    }

    /// Produce the next correlation id for an outbound command.
    fn next_correlation_id(&self) -> String;

    /// Wire payload subscribing to `subscription`, tagged with `id`.
    fn subscribe_command(&self, id: &str, subscription: &Subscription) -> String;

    /// Wire payload for the login exchange, or `None` for public venues.
    fn login_command(&self, credentials: &Credentials) -> Option<String>;

    /// Application-level heartbeat payload, for venues that ping in-band.
    fn heartbeat_command(&self) -> Option<String> {
        None
    }

    /// How book state is bootstrapped on this venue.
    fn snapshot_policy(&self) -> SnapshotPolicy {
        SnapshotPolicy::WsManaged
    }

    /// Relative REST path serving the depth snapshot for `symbol`.
    fn snapshot_path(&self, _symbol: &str) -> Option<String> {
        None
    }

    /// Decode one raw frame into zero or more normalized messages.
    fn decode(&self, raw: &str) -> FeedResult<Vec<VenueMessage>>;
}

/// Provides point-in-time depth snapshots from out-of-band sources.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self, symbol: &str) -> FeedResult<DepthSnapshot>;
}

/// Factory building a venue adapter from its freeform configuration block.
pub type VenueFactory = fn(&serde_json::Value) -> FeedResult<Arc<dyn VenueAdapter>>;

fn registry() -> &'static RwLock<HashMap<&'static str, VenueFactory>> {
    static REGISTRY: OnceLock<RwLock<HashMap<&'static str, VenueFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a venue factory under its driver name.
pub fn register_venue_factory(name: &'static str, factory: VenueFactory) {
    if let Ok(mut map) = registry().write() {
        map.insert(name, factory);
    }
}

/// Look up a previously registered venue factory.
pub fn get_venue_factory(name: &str) -> Option<VenueFactory> {
    registry().read().ok().and_then(|map| map.get(name).copied())
}

/// Driver names currently registered.
pub fn registered_venues() -> Vec<&'static str> {
    registry()
        .read()
        .map(|map| map.keys().copied().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_equality_is_structural() {
        let first = Subscription::order_book("orderbook.50.BTCUSDT", "BTCUSDT");
        let second = Subscription::order_book("orderbook.50.BTCUSDT", "BTCUSDT");
        let third = Subscription::trades("publicTrade.BTCUSDT", "BTCUSDT");
        assert_eq!(first, second);
        assert_ne!(first, third);
    }

    #[test]
    fn venue_registry_round_trip() {
        fn factory(_params: &serde_json::Value) -> FeedResult<Arc<dyn VenueAdapter>> {
            Err(FeedError::Other("unbuildable test venue".into()))
        }
        register_venue_factory("test-venue", factory);
        assert!(get_venue_factory("test-venue").is_some());
        assert!(registered_venues().contains(&"test-venue"));
        assert!(get_venue_factory("missing").is_none());
    }
}
