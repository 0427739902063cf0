//! Tidemark aggregate crate that re-exports the main components for
//! downstream users.

pub use tidemark_binance as binance;
pub use tidemark_bridge as bridge;
pub use tidemark_bybit as bybit;
pub use tidemark_config as config;
pub use tidemark_core as core;
pub use tidemark_feed as feed;
pub use tidemark_replica as replica;
pub use tidemark_session as session;
pub use tidemark_transport as transport;

/// Convenience prelude to pull commonly used items into scope.
pub mod prelude {
    pub use tidemark_binance::*;
    pub use tidemark_bridge::*;
    pub use tidemark_bybit::*;
    pub use tidemark_config::*;
    pub use tidemark_core::*;
    pub use tidemark_feed::*;
    pub use tidemark_replica::*;
    pub use tidemark_session::*;
    pub use tidemark_transport::*;
}
