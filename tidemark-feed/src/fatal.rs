//! Structured fatal escalation.
//!
//! Conditions that make a replica untrustworthy are not retried: they are
//! raised on a dedicated channel that process-level supervision observes,
//! so the process dies loudly instead of trading on corrupt state.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::error;

/// The unrecoverable condition families.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FatalKind {
    /// More than the allowed transport faults inside one rolling window.
    FaultStorm,
    /// Login exchange went unanswered past the deadline.
    HandshakeTimeout,
    /// Subscribe command went unanswered past the deadline.
    SubscribeTimeout,
    /// Best ask at or below best bid: the replica is corrupt.
    CrossedBook,
    /// Top levels stopped changing despite an apparently live connection.
    FrozenBook,
}

/// Structured unrecoverable error: `{kind, context, venue_detail}`.
#[derive(Clone, Debug, Deserialize, Error, PartialEq, Serialize)]
#[error("{kind:?}: {context}")]
pub struct FatalError {
    pub kind: FatalKind,
    pub context: String,
    pub venue_detail: Option<String>,
}

impl FatalError {
    #[must_use]
    pub fn new(kind: FatalKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
            venue_detail: None,
        }
    }

    #[must_use]
    pub fn with_venue_detail(mut self, detail: impl Into<String>) -> Self {
        self.venue_detail = Some(detail.into());
        self
    }
}

/// Create the fatal signal pair: components raise through the handle, the
/// supervisor owns the monitor.
#[must_use]
pub fn fatal_channel() -> (FatalHandle, FatalMonitor) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FatalHandle { tx }, FatalMonitor { rx })
}

/// Cloneable raising side of the fatal channel.
#[derive(Clone)]
pub struct FatalHandle {
    tx: mpsc::UnboundedSender<FatalError>,
}

impl FatalHandle {
    /// Raise a fatal condition. Never blocks; a missing monitor only logs.
    pub fn raise(&self, fatal: FatalError) {
        error!(kind = ?fatal.kind, context = %fatal.context, "fatal condition raised");
        let _ = self.tx.send(fatal);
    }
}

/// Receiving side, held by whatever supervises the process.
pub struct FatalMonitor {
    rx: mpsc::UnboundedReceiver<FatalError>,
}

impl FatalMonitor {
    /// Wait for the next fatal condition; `None` once every handle is gone.
    pub async fn next(&mut self) -> Option<FatalError> {
        self.rx.recv().await
    }

    /// Non-blocking poll used by tests and tick-driven supervisors.
    pub fn try_next(&mut self) -> Option<FatalError> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn raised_fatals_reach_the_monitor_in_order() {
        let (handle, mut monitor) = fatal_channel();
        handle.raise(FatalError::new(FatalKind::CrossedBook, "BTCUSDT"));
        handle.raise(
            FatalError::new(FatalKind::FrozenBook, "ETHUSDT").with_venue_detail("top 10 static"),
        );

        let first = monitor.next().await.expect("first fatal");
        assert_eq!(first.kind, FatalKind::CrossedBook);
        let second = monitor.next().await.expect("second fatal");
        assert_eq!(second.kind, FatalKind::FrozenBook);
        assert_eq!(second.venue_detail.as_deref(), Some("top 10 static"));
        assert!(monitor.try_next().is_none());
    }
}
