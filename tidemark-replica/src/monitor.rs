//! Periodic replica self-consistency checks.
//!
//! A corrupted or stalled replica is worse than a crashed process, so both
//! checks escalate straight to the fatal channel instead of repairing.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::debug;

use tidemark_feed::{FatalError, FatalHandle, FatalKind};

use crate::BookReplica;

/// Check cadence and staleness depth for one replica.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Cadence of the best-ask/best-bid overlap check.
    pub price_overlap_interval: Duration,
    /// Cadence of the frozen-book check.
    pub frozen_interval: Duration,
    /// How many top levels the frozen check fingerprints.
    pub staleness_depth: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            price_overlap_interval: Duration::from_millis(5_000),
            frozen_interval: Duration::from_millis(30_000),
            staleness_depth: 10,
        }
    }
}

/// Two independent interval tasks watching one replica.
pub struct ConsistencyMonitor {
    overlap_task: JoinHandle<()>,
    frozen_task: JoinHandle<()>,
}

impl ConsistencyMonitor {
    /// Start watching `replica`; checks stop when the monitor is dropped.
    #[must_use]
    pub fn spawn(replica: Arc<BookReplica>, config: MonitorConfig, fatal: FatalHandle) -> Self {
        let overlap_replica = replica.clone();
        let overlap_fatal = fatal.clone();
        let overlap_task = tokio::spawn(async move {
            let mut ticks = interval(config.price_overlap_interval);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                if overlap_replica.is_crossed() {
                    overlap_fatal.raise(
                        FatalError::new(FatalKind::CrossedBook, "best ask at or below best bid")
                            .with_venue_detail(overlap_replica.symbol().to_string()),
                    );
                }
            }
        });

        let depth = config.staleness_depth;
        let frozen_task = tokio::spawn(async move {
            let mut ticks = interval(config.frozen_interval);
            ticks.tick().await;
            let mut previous: Option<u32> = None;
            loop {
                ticks.tick().await;
                if replica.is_empty() {
                    // An unsynchronized or cleared book is not a frozen feed.
                    previous = None;
                    continue;
                }
                let current = replica.fingerprint(depth);
                if previous == Some(current) {
                    fatal.raise(
                        FatalError::new(FatalKind::FrozenBook, "top levels stopped changing")
                            .with_venue_detail(replica.symbol().to_string()),
                    );
                } else {
                    debug!(symbol = replica.symbol(), "book fingerprint moved");
                }
                previous = Some(current);
            }
        });

        Self {
            overlap_task,
            frozen_task,
        }
    }
}

impl Drop for ConsistencyMonitor {
    fn drop(&mut self) {
        self.overlap_task.abort();
        self.frozen_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use tidemark_core::BookOrder;
    use tidemark_feed::fatal_channel;
    use tokio::time::{sleep, Duration};

    fn dec(value: i64) -> Decimal {
        Decimal::from(value)
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            price_overlap_interval: Duration::from_millis(20),
            frozen_interval: Duration::from_millis(25),
            staleness_depth: 10,
        }
    }

    #[tokio::test]
    async fn crossed_book_raises_within_one_cycle() {
        let (handle, mut monitor_rx) = fatal_channel();
        let replica = Arc::new(BookReplica::new("BTCUSDT"));
        replica.insert_snapshot(
            vec![BookOrder::price_keyed(dec(101), dec(1))],
            vec![BookOrder::price_keyed(dec(100), dec(1))],
        );
        let _monitor = ConsistencyMonitor::spawn(replica, fast_config(), handle);

        let fatal = tokio::time::timeout(Duration::from_millis(500), monitor_rx.next())
            .await
            .expect("fatal within one check cycle")
            .expect("fatal present");
        assert_eq!(fatal.kind, FatalKind::CrossedBook);
    }

    #[tokio::test]
    async fn static_top_levels_raise_frozen_book() {
        let (handle, mut monitor_rx) = fatal_channel();
        let replica = Arc::new(BookReplica::new("ETHUSDT"));
        replica.insert_snapshot(
            vec![BookOrder::price_keyed(dec(99), dec(1))],
            vec![BookOrder::price_keyed(dec(100), dec(1))],
        );
        let _monitor = ConsistencyMonitor::spawn(replica, fast_config(), handle);

        let fatal = tokio::time::timeout(Duration::from_millis(500), monitor_rx.next())
            .await
            .expect("fatal within two check cycles")
            .expect("fatal present");
        assert_eq!(fatal.kind, FatalKind::FrozenBook);
    }

    #[tokio::test]
    async fn live_book_never_raises() {
        let (handle, mut monitor_rx) = fatal_channel();
        let replica = Arc::new(BookReplica::new("SOLUSDT"));
        replica.insert_snapshot(
            vec![BookOrder::price_keyed(dec(99), dec(1))],
            vec![BookOrder::price_keyed(dec(100), dec(1))],
        );
        let mover = replica.clone();
        let _monitor = ConsistencyMonitor::spawn(replica, fast_config(), handle);

        for step in 0..8 {
            mover.apply(&tidemark_core::LevelChange::at_price(
                tidemark_core::Side::Buy,
                dec(99),
                Some(dec(step + 2)),
            ));
            sleep(Duration::from_millis(15)).await;
        }
        assert!(monitor_rx.try_next().is_none());
    }
}
