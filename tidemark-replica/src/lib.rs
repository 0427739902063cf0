//! Symbol-scoped order book replicas with background consistency checks and
//! snapshot/delta sequence reconciliation.

mod monitor;
mod reconciler;
mod snapshot;

pub use monitor::{ConsistencyMonitor, MonitorConfig};
pub use reconciler::{DeltaDisposition, SequenceReconciler, SnapshotDecision, SyncState};
pub use snapshot::RestSnapshotClient;

use std::sync::{PoisonError, RwLock};

use tidemark_core::{BookLadder, BookOrder, LevelChange, Price, Quantity, Side, Symbol};

/// The local replica of one venue book plus venue-scoped freeform state.
///
/// Mutation happens from the owning controller task; the monitors and the
/// distribution bridge only read, so a plain `RwLock` with short critical
/// sections is enough.
pub struct BookReplica {
    symbol: Symbol,
    ladder: RwLock<BookLadder>,
    auxiliary: RwLock<serde_json::Value>,
}

impl BookReplica {
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            ladder: RwLock::new(BookLadder::new()),
            auxiliary: RwLock::new(serde_json::Value::Null),
        }
    }

    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    fn read_ladder(&self) -> std::sync::RwLockReadGuard<'_, BookLadder> {
        self.ladder.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_ladder(&self) -> std::sync::RwLockWriteGuard<'_, BookLadder> {
        self.ladder.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one normalized change.
    pub fn apply(&self, change: &LevelChange) {
        self.write_ladder().apply(change);
    }

    /// Apply a batch of changes under one lock acquisition.
    pub fn apply_batch(&self, changes: &[LevelChange]) {
        let mut ladder = self.write_ladder();
        for change in changes {
            ladder.apply(change);
        }
    }

    /// Atomically replace both sides.
    pub fn insert_snapshot(&self, bids: Vec<BookOrder>, asks: Vec<BookOrder>) {
        let mut ladder = self.write_ladder();
        ladder.insert_snapshot(Side::Buy, bids);
        ladder.insert_snapshot(Side::Sell, asks);
    }

    /// Atomically replace one side.
    pub fn insert_side_snapshot(&self, side: Side, orders: Vec<BookOrder>) {
        self.write_ladder().insert_snapshot(side, orders);
    }

    /// Drop all entries; the replica stays alive and is rebuilt on resubscribe.
    pub fn clear(&self) {
        self.write_ladder().clear();
    }

    #[must_use]
    pub fn best_bid(&self) -> Option<BookOrder> {
        self.read_ladder().best_bid().cloned()
    }

    #[must_use]
    pub fn best_ask(&self) -> Option<BookOrder> {
        self.read_ladder().best_ask().cloned()
    }

    /// Owned copies of the top `depth` levels, bids then asks.
    #[must_use]
    pub fn top_levels(&self, depth: usize) -> (Vec<(Price, Quantity)>, Vec<(Price, Quantity)>) {
        let ladder = self.read_ladder();
        (ladder.levels(Side::Buy, depth), ladder.levels(Side::Sell, depth))
    }

    #[must_use]
    pub fn depth(&self, side: Side) -> usize {
        self.read_ladder().depth(side)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_ladder().is_empty()
    }

    #[must_use]
    pub fn is_crossed(&self) -> bool {
        self.read_ladder().is_crossed()
    }

    /// CRC32 fingerprint of the top `depth` levels of both sides.
    #[must_use]
    pub fn fingerprint(&self, depth: usize) -> u32 {
        self.read_ladder().fingerprint(depth)
    }

    /// Overwrite the venue-scoped freeform state.
    pub fn set_auxiliary(&self, value: serde_json::Value) {
        *self
            .auxiliary
            .write()
            .unwrap_or_else(PoisonError::into_inner) = value;
    }

    #[must_use]
    pub fn auxiliary(&self) -> serde_json::Value {
        self.auxiliary
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn dec(value: i64) -> Decimal {
        Decimal::from(value)
    }

    #[test]
    fn snapshot_then_clear_keeps_replica_usable() {
        let replica = BookReplica::new("BTCUSDT");
        replica.insert_snapshot(
            vec![BookOrder::price_keyed(dec(99), dec(1))],
            vec![BookOrder::price_keyed(dec(101), dec(2))],
        );
        assert_eq!(replica.best_bid().map(|o| o.price), Some(dec(99)));
        assert_eq!(replica.best_ask().map(|o| o.price), Some(dec(101)));

        replica.clear();
        assert!(replica.is_empty());

        replica.insert_snapshot(vec![], vec![BookOrder::price_keyed(dec(105), dec(3))]);
        assert_eq!(replica.best_ask().map(|o| o.price), Some(dec(105)));
    }

    #[test]
    fn auxiliary_state_is_venue_scoped_freeform() {
        let replica = BookReplica::new("ETHUSDT");
        assert!(replica.auxiliary().is_null());
        replica.set_auxiliary(serde_json::json!({"cross_seq": 42}));
        assert_eq!(replica.auxiliary()["cross_seq"], 42);
    }
}
