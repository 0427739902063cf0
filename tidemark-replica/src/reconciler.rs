//! Bridges an out-of-band snapshot fetch with a concurrently-arriving delta
//! stream, establishing an ordering relationship before anything is applied.
//!
//! The buffered cache is owned by the reconciler instance (one per symbol);
//! cross-symbol interference is impossible by construction.

use tidemark_core::{SequencedDelta, Symbol};
use tracing::debug;

/// Whether the replica can be trusted yet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncState {
    /// Buffering deltas while a snapshot is in flight.
    Synchronizing,
    /// Snapshot applied and buffered deltas replayed; apply directly.
    Synchronized,
}

/// What the caller should do with a delta it just handed over.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeltaDisposition {
    /// Apply against the replica immediately.
    Apply,
    /// Retained in the cache until a snapshot establishes ordering.
    Buffered,
    /// Already covered by applied state; drop it.
    Discard,
    /// A sequence gap was detected; the delta is buffered and the caller
    /// must fetch a fresh snapshot.
    ResyncRequired,
}

/// Verdict on a fetched snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SnapshotDecision {
    /// Apply the snapshot, then replay these deltas in increasing sequence.
    Accept { replay: Vec<SequencedDelta> },
    /// The snapshot predates everything buffered; fetch a fresh one.
    Stale,
}

/// Per-symbol snapshot/delta ordering state machine.
pub struct SequenceReconciler {
    symbol: Symbol,
    state: SyncState,
    cache: Vec<SequencedDelta>,
    last_applied: Option<u64>,
}

impl SequenceReconciler {
    /// A new reconciler starts synchronizing: deltas buffer until a snapshot
    /// is accepted.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            state: SyncState::Synchronizing,
            cache: Vec::new(),
            last_applied: None,
        }
    }

    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        self.state
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.cache.len()
    }

    /// Re-enter the synchronizing state after a detected gap. Buffered
    /// entries are kept; dropping them could widen the gap.
    pub fn begin_resync(&mut self) {
        self.state = SyncState::Synchronizing;
        self.last_applied = None;
    }

    /// Decide what to do with a delta message covering sequence numbers up to
    /// `sequence` (and from `first_sequence`, when the venue reports a range).
    ///
    /// One message may carry many level changes; classification happens once
    /// per message so a shared sequence number is not mistaken for a replay.
    pub fn classify(&mut self, sequence: u64, first_sequence: Option<u64>) -> DeltaDisposition {
        match self.state {
            SyncState::Synchronizing => DeltaDisposition::Buffered,
            SyncState::Synchronized => {
                if let Some(last) = self.last_applied {
                    if sequence <= last {
                        return DeltaDisposition::Discard;
                    }
                    if let Some(first) = first_sequence {
                        if first > last + 1 {
                            debug!(
                                symbol = %self.symbol,
                                expected = last + 1,
                                got = first,
                                "sequence gap detected"
                            );
                            self.begin_resync();
                            return DeltaDisposition::ResyncRequired;
                        }
                    }
                }
                self.last_applied = Some(sequence);
                DeltaDisposition::Apply
            }
        }
    }

    /// Retain one cache entry while synchronizing; never dropped until a
    /// snapshot establishes ordering.
    pub fn buffer(&mut self, delta: SequencedDelta) {
        self.cache.push(delta);
    }

    /// Route one single-level delta: classify, then buffer when required.
    pub fn observe_delta(&mut self, delta: SequencedDelta) -> DeltaDisposition {
        let disposition = self.classify(delta.sequence, delta.first_sequence);
        match disposition {
            DeltaDisposition::Buffered | DeltaDisposition::ResyncRequired => self.buffer(delta),
            DeltaDisposition::Apply | DeltaDisposition::Discard => {}
        }
        disposition
    }

    /// Judge a fetched snapshot against the buffered cache.
    ///
    /// The snapshot is usable only when the cache already holds an entry at
    /// or past its `last_update_id`; otherwise the ordering relationship is
    /// unknown and the snapshot is discarded as stale.
    pub fn accept_snapshot(&mut self, last_update_id: u64) -> SnapshotDecision {
        let covered = self
            .cache
            .iter()
            .any(|delta| delta.sequence >= last_update_id);
        if !covered {
            debug!(
                symbol = %self.symbol,
                last_update_id,
                buffered = self.cache.len(),
                "snapshot stale relative to buffered deltas"
            );
            return SnapshotDecision::Stale;
        }
        let mut replay: Vec<SequencedDelta> = self
            .cache
            .drain(..)
            .filter(|delta| delta.sequence >= last_update_id)
            .collect();
        replay.sort_by_key(|delta| delta.sequence);
        self.last_applied = Some(
            replay
                .last()
                .map(|delta| delta.sequence)
                .unwrap_or(last_update_id),
        );
        self.state = SyncState::Synchronized;
        SnapshotDecision::Accept { replay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use tidemark_core::Side;

    fn delta(sequence: u64) -> SequencedDelta {
        SequencedDelta {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            price: Decimal::from(100),
            quantity: Decimal::ONE,
            sequence,
            first_sequence: None,
        }
    }

    fn ranged_delta(first: u64, last: u64) -> SequencedDelta {
        SequencedDelta {
            first_sequence: Some(first),
            ..delta(last)
        }
    }

    #[test]
    fn stale_snapshot_is_discarded_and_retried() {
        let mut reconciler = SequenceReconciler::new("BTCUSDT");
        for sequence in [50, 60, 70] {
            assert_eq!(
                reconciler.observe_delta(delta(sequence)),
                DeltaDisposition::Buffered
            );
        }
        assert_eq!(reconciler.accept_snapshot(100), SnapshotDecision::Stale);
        assert_eq!(reconciler.state(), SyncState::Synchronizing);
        // Nothing buffered may be dropped while retrying.
        assert_eq!(reconciler.buffered(), 3);
    }

    #[test]
    fn covering_cache_accepts_snapshot_and_replays_in_order() {
        let mut reconciler = SequenceReconciler::new("BTCUSDT");
        for sequence in [120, 90, 100, 110] {
            reconciler.observe_delta(delta(sequence));
        }
        match reconciler.accept_snapshot(100) {
            SnapshotDecision::Accept { replay } => {
                let sequences: Vec<u64> = replay.iter().map(|d| d.sequence).collect();
                assert_eq!(sequences, vec![100, 110, 120]);
            }
            SnapshotDecision::Stale => panic!("snapshot should be accepted"),
        }
        assert_eq!(reconciler.state(), SyncState::Synchronized);
        assert_eq!(reconciler.buffered(), 0);
    }

    #[test]
    fn synchronized_deltas_apply_directly() {
        let mut reconciler = SequenceReconciler::new("BTCUSDT");
        reconciler.observe_delta(delta(100));
        reconciler.accept_snapshot(100);
        assert_eq!(
            reconciler.observe_delta(delta(101)),
            DeltaDisposition::Apply
        );
        assert_eq!(
            reconciler.observe_delta(delta(101)),
            DeltaDisposition::Discard
        );
    }

    #[test]
    fn gap_after_sync_forces_resync_without_dropping_the_delta() {
        let mut reconciler = SequenceReconciler::new("BTCUSDT");
        reconciler.observe_delta(delta(100));
        reconciler.accept_snapshot(100);
        assert_eq!(
            reconciler.observe_delta(ranged_delta(101, 105)),
            DeltaDisposition::Apply
        );
        assert_eq!(
            reconciler.observe_delta(ranged_delta(110, 112)),
            DeltaDisposition::ResyncRequired
        );
        assert_eq!(reconciler.state(), SyncState::Synchronizing);
        assert_eq!(reconciler.buffered(), 1);

        // A fresh snapshot covered by the buffered delta completes resync.
        match reconciler.accept_snapshot(111) {
            SnapshotDecision::Accept { replay } => {
                assert_eq!(replay.len(), 1);
                assert_eq!(replay[0].sequence, 112);
            }
            SnapshotDecision::Stale => panic!("resync snapshot should be accepted"),
        }
    }
}
