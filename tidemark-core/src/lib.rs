//! Fundamental data types shared across the entire workspace.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

mod book;

pub use book::{BookLadder, BookOrder, LevelChange};

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Quantity = Decimal;
/// Alias used for human-readable market symbols (e.g., `BTCUSDT`).
pub type Symbol = String;

/// Identifier assigned to resting orders or price levels (venue provided).
pub type OrderId = String;

/// The side of an order, trade, or book ladder.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Side {
    /// Buy the instrument (bid side of the book).
    Buy,
    /// Sell the instrument (ask side of the book).
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

/// Point-in-time full replacement for both sides of a book, tagged with the
/// venue sequence number it was generated at.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DepthSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<(Price, Quantity)>,
    pub asks: Vec<(Price, Quantity)>,
}

impl DepthSnapshot {
    /// Render one side of the snapshot as price-keyed book orders.
    #[must_use]
    pub fn side_orders(&self, side: Side) -> Vec<BookOrder> {
        let levels = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        levels
            .iter()
            .map(|&(price, quantity)| BookOrder::price_keyed(price, quantity))
            .collect()
    }
}

/// Incremental book change carrying a venue sequence number, retained by the
/// reconciler while a replica is synchronizing.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SequencedDelta {
    pub symbol: Symbol,
    pub side: Side,
    pub price: Price,
    /// Absolute resting quantity; zero removes the level.
    pub quantity: Quantity,
    /// Sequence number of the last update covered by this delta.
    pub sequence: u64,
    /// Sequence number of the first update covered, when the venue reports a
    /// range. Used for gap detection once synchronized.
    #[serde(default)]
    pub first_sequence: Option<u64>,
}

/// High-level order status maintained inside the framework.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderStatus {
    PendingNew,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

/// Normalized order lifecycle record published on the `creations-updates` and
/// `cancelations` channels.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrderEvent {
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Option<Side>,
    pub price: Option<Price>,
    pub quantity: Option<Quantity>,
    pub filled_quantity: Option<Quantity>,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
}

/// Normalized fill record published on the `executions` channel.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ExecutionEvent {
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub fill_price: Price,
    pub fill_quantity: Quantity,
    pub fee: Option<Price>,
    pub timestamp: DateTime<Utc>,
}

/// Normalized public trade record published on the `trades` channel.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TradeEvent {
    pub symbol: Symbol,
    pub price: Price,
    pub size: Quantity,
    pub side: Side,
    pub exchange_timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// What happened to a book replica, published on the `update` channel.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum BookEventKind {
    /// A full snapshot replaced the replica contents.
    Snapshot,
    /// One or more incremental changes were applied.
    Delta,
    /// The replica was cleared following transport closure.
    Cleared,
}

/// Replica change notification; consumers read the replica itself for state.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BookEvent {
    pub symbol: Symbol,
    pub kind: BookEventKind,
    pub timestamp: DateTime<Utc>,
}

impl BookEvent {
    #[must_use]
    pub fn now(symbol: impl Into<Symbol>, kind: BookEventKind) -> Self {
        Self {
            symbol: symbol.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}
