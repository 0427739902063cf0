//! Two-sided order book ladder backed by sorted vectors.
//!
//! Mutation is O(n) by design: venues cap practical book depth, and a linear
//! scan keeps both ladders ordered without a separate sort step.

use std::fmt::Write;

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::{OrderId, Price, Quantity, Side};

/// A resting order or price level inside a ladder.
///
/// The identifier is venue-defined: either the canonical rendering of the
/// price (price-indexed books) or an exchange order/price-level id.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BookOrder {
    pub id: OrderId,
    pub price: Price,
    pub quantity: Quantity,
}

impl BookOrder {
    #[must_use]
    pub fn new(id: impl Into<OrderId>, price: Price, quantity: Quantity) -> Self {
        Self {
            id: id.into(),
            price,
            quantity,
        }
    }

    /// Build an order whose identifier is the normalized price itself.
    #[must_use]
    pub fn price_keyed(price: Price, quantity: Quantity) -> Self {
        Self {
            id: price.normalize().to_string(),
            price,
            quantity,
        }
    }
}

/// A single normalized change against one side of a ladder.
///
/// `id` selects id-indexed addressing; otherwise the change is price-indexed.
/// An absent or zero quantity removes the addressed entry.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LevelChange {
    pub side: Side,
    pub id: Option<OrderId>,
    pub price: Option<Price>,
    pub quantity: Option<Quantity>,
}

impl LevelChange {
    /// Price-indexed change.
    #[must_use]
    pub fn at_price(side: Side, price: Price, quantity: Option<Quantity>) -> Self {
        Self {
            side,
            id: None,
            price: Some(price),
            quantity,
        }
    }

    /// Id-indexed change.
    #[must_use]
    pub fn by_id(
        side: Side,
        id: impl Into<OrderId>,
        price: Option<Price>,
        quantity: Option<Quantity>,
    ) -> Self {
        Self {
            side,
            id: Some(id.into()),
            price,
            quantity,
        }
    }
}

/// In-memory two-sided ladder: asks ascending by price, bids descending.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct BookLadder {
    asks: Vec<BookOrder>,
    bids: Vec<BookOrder>,
}

impl BookLadder {
    /// Create an empty ladder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn side_entries(&self, side: Side) -> &Vec<BookOrder> {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    fn side_entries_mut(&mut self, side: Side) -> &mut Vec<BookOrder> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    /// First index whose entry sits at or past `price` in the side ordering.
    fn scan(entries: &[BookOrder], side: Side, price: Price) -> Option<usize> {
        entries.iter().position(|order| match side {
            Side::Sell => order.price >= price,
            Side::Buy => order.price <= price,
        })
    }

    /// Side-aware price-indexed update.
    ///
    /// An exact price match is overwritten (or deleted when `quantity` is
    /// absent or zero); otherwise the entry is inserted before the first
    /// entry past it, or appended past the worst level. Deletions aimed at a
    /// price that is not present are ignored.
    pub fn update_by_price(&mut self, side: Side, price: Price, quantity: Option<Quantity>) {
        let live = quantity.filter(|qty| !qty.is_zero());
        let entries = self.side_entries_mut(side);
        match Self::scan(entries, side, price) {
            Some(index) if entries[index].price == price => match live {
                Some(qty) => entries[index].quantity = qty,
                None => {
                    entries.remove(index);
                }
            },
            Some(index) => {
                if let Some(qty) = live {
                    entries.insert(index, BookOrder::price_keyed(price, qty));
                }
            }
            None => {
                if let Some(qty) = live {
                    entries.push(BookOrder::price_keyed(price, qty));
                }
            }
        }
    }

    /// Remove the unique entry with a matching id, searching both sides.
    pub fn delete_by_id(&mut self, id: &str) -> bool {
        for entries in [&mut self.asks, &mut self.bids] {
            if let Some(index) = entries.iter().position(|order| order.id == id) {
                entries.remove(index);
                return true;
            }
        }
        false
    }

    /// Overwrite price and/or quantity of the entry with a matching id.
    ///
    /// A price overwrite repositions the entry to keep the side ordered.
    pub fn update_by_id(
        &mut self,
        id: &str,
        price: Option<Price>,
        quantity: Option<Quantity>,
    ) -> bool {
        let Some(side) = self.locate_side(id) else {
            return false;
        };
        let entries = self.side_entries_mut(side);
        let index = match entries.iter().position(|order| order.id == id) {
            Some(index) => index,
            None => return false,
        };
        if let Some(qty) = quantity {
            entries[index].quantity = qty;
        }
        if let Some(new_price) = price {
            if entries[index].price != new_price {
                let mut order = entries.remove(index);
                order.price = new_price;
                self.insert_order(side, order);
            }
        }
        true
    }

    fn locate_side(&self, id: &str) -> Option<Side> {
        if self.asks.iter().any(|order| order.id == id) {
            Some(Side::Sell)
        } else if self.bids.iter().any(|order| order.id == id) {
            Some(Side::Buy)
        } else {
            None
        }
    }

    /// Insert an order at its sorted position on the given side.
    pub fn insert_order(&mut self, side: Side, order: BookOrder) {
        let entries = self.side_entries_mut(side);
        match Self::scan(entries, side, order.price) {
            Some(index) => entries.insert(index, order),
            None => entries.push(order),
        }
    }

    /// Atomically replace one side with the provided ordered sequence.
    pub fn insert_snapshot(&mut self, side: Side, orders: Vec<BookOrder>) {
        *self.side_entries_mut(side) = orders;
    }

    /// Apply a normalized change, dispatching on its addressing mode.
    pub fn apply(&mut self, change: &LevelChange) {
        match (&change.id, change.price) {
            (Some(id), _) => {
                let live = change.quantity.filter(|qty| !qty.is_zero());
                match live {
                    None => {
                        self.delete_by_id(id);
                    }
                    Some(qty) => {
                        if !self.update_by_id(id, change.price, Some(qty)) {
                            if let Some(price) = change.price {
                                self.insert_order(
                                    change.side,
                                    BookOrder::new(id.clone(), price, qty),
                                );
                            }
                        }
                    }
                }
            }
            (None, Some(price)) => self.update_by_price(change.side, price, change.quantity),
            (None, None) => {}
        }
    }

    /// Drop every entry on both sides.
    pub fn clear(&mut self) {
        self.asks.clear();
        self.bids.clear();
    }

    #[must_use]
    pub fn best_ask(&self) -> Option<&BookOrder> {
        self.asks.first()
    }

    #[must_use]
    pub fn best_bid(&self) -> Option<&BookOrder> {
        self.bids.first()
    }

    /// Top `depth` entries of one side, best first.
    #[must_use]
    pub fn top(&self, side: Side, depth: usize) -> &[BookOrder] {
        let entries = self.side_entries(side);
        &entries[..depth.min(entries.len())]
    }

    #[must_use]
    pub fn depth(&self, side: Side) -> usize {
        self.side_entries(side).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.asks.is_empty() && self.bids.is_empty()
    }

    /// Best ask at or below best bid: the ladder is corrupt.
    #[must_use]
    pub fn is_crossed(&self) -> bool {
        match (self.best_ask(), self.best_bid()) {
            (Some(ask), Some(bid)) => ask.price <= bid.price,
            _ => false,
        }
    }

    /// CRC32 over the normalized top-`depth` levels of both sides.
    ///
    /// Used by the frozen-book check and the distribution payload: two
    /// ladders with identical top levels produce identical fingerprints.
    #[must_use]
    pub fn fingerprint(&self, depth: usize) -> u32 {
        if depth == 0 {
            return 0;
        }
        let mut buffer = String::new();
        let mut first = true;
        for order in self.top(Side::Buy, depth).iter() {
            if !first {
                buffer.push(':');
            }
            first = false;
            write!(
                buffer,
                "{}:{}",
                order.price.normalize(),
                order.quantity.normalize()
            )
            .ok();
        }
        for order in self.top(Side::Sell, depth).iter() {
            if !first {
                buffer.push(':');
            }
            first = false;
            write!(
                buffer,
                "{}:{}",
                order.price.normalize(),
                order.quantity.normalize()
            )
            .ok();
        }
        let mut hasher = Hasher::new();
        hasher.update(buffer.as_bytes());
        hasher.finalize()
    }

    /// Owned copies of the top `depth` levels as `(price, quantity)` pairs.
    #[must_use]
    pub fn levels(&self, side: Side, depth: usize) -> Vec<(Price, Quantity)> {
        self.top(side, depth)
            .iter()
            .map(|order| (order.price, order.quantity))
            .collect()
    }
}
