//! Binance-style venue adapter: unauthenticated streams, `SUBSCRIBE` command
//! family, diff-depth events with sequence bounds that require the REST
//! snapshot + reconciler path.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use tidemark_core::{LevelChange, Side, TradeEvent};
use tidemark_feed::{
    register_venue_factory, Credentials, FeedError, FeedResult, SnapshotPolicy, Subscription,
    VenueAdapter, VenueInfo, VenueMessage,
};

pub struct BinanceVenue {
    snapshot_limit: usize,
    counter: AtomicU64,
}

impl BinanceVenue {
    #[must_use]
    pub fn new(snapshot_limit: usize) -> Self {
        Self {
            snapshot_limit: snapshot_limit.max(1),
            counter: AtomicU64::new(1),
        }
    }

    /// Register this adapter in the venue factory registry.
    pub fn register() {
        register_venue_factory("binance", |params| {
            let limit = params
                .get("snapshot_limit")
                .and_then(Value::as_u64)
                .unwrap_or(1000) as usize;
            Ok(std::sync::Arc::new(BinanceVenue::new(limit)))
        });
    }

    #[must_use]
    pub fn order_book_subscription(symbol: &str) -> Subscription {
        Subscription::order_book(format!("{}@depth", symbol.to_lowercase()), symbol)
    }

    #[must_use]
    pub fn trades_subscription(symbol: &str) -> Subscription {
        Subscription::trades(format!("{}@aggTrade", symbol.to_lowercase()), symbol)
    }
}

impl Default for BinanceVenue {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl VenueAdapter for BinanceVenue {
    fn name(&self) -> &'static str {
        "binance"
    }

    fn info(&self) -> Option<VenueInfo> {
        Some(VenueInfo {
            name: "binance-market".into(),
            markets: vec!["usd_perp".into()],
            supports_testnet: true,
        })
    }

    fn next_correlation_id(&self) -> String {
        // Binance acks echo a numeric id; a counter keeps them invertible.
        self.counter.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn subscribe_command(&self, id: &str, subscription: &Subscription) -> String {
        let numeric_id = id.parse::<u64>().unwrap_or(0);
        json!({
            "method": "SUBSCRIBE",
            "params": [subscription.topic],
            "id": numeric_id,
        })
        .to_string()
    }

    fn login_command(&self, _credentials: &Credentials) -> Option<String> {
        None
    }

    fn snapshot_policy(&self) -> SnapshotPolicy {
        SnapshotPolicy::RestSequenced
    }

    fn snapshot_path(&self, symbol: &str) -> Option<String> {
        Some(format!(
            "/depth?symbol={}&limit={}",
            symbol.to_uppercase(),
            self.snapshot_limit
        ))
    }

    fn decode(&self, raw: &str) -> FeedResult<Vec<VenueMessage>> {
        let value: Value =
            serde_json::from_str(raw).map_err(|err| FeedError::Serialization(err.to_string()))?;

        // Command responses: {"result": null, "id": N}
        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            let success = value.get("error").is_none();
            return Ok(vec![VenueMessage::Ack {
                id: id.to_string(),
                success,
                detail: value
                    .get("error")
                    .and_then(|e| e.get("msg"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }]);
        }

        // Combined streams wrap the event: {"stream": "...", "data": {...}}
        let event = value.get("data").unwrap_or(&value);
        match event.get("e").and_then(Value::as_str) {
            Some("depthUpdate") => decode_depth_update(event),
            Some("aggTrade") => decode_agg_trade(event),
            Some(other) => {
                debug!(event = other, "ignoring unsupported Binance event");
                Ok(vec![VenueMessage::Ignored])
            }
            None => Ok(vec![VenueMessage::Ignored]),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DiffDepthEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

fn decode_depth_update(event: &Value) -> FeedResult<Vec<VenueMessage>> {
    let event: DiffDepthEvent = serde_json::from_value(event.clone())
        .map_err(|err| FeedError::Serialization(err.to_string()))?;
    let mut changes = Vec::with_capacity(event.bids.len() + event.asks.len());
    for (side, levels) in [(Side::Buy, &event.bids), (Side::Sell, &event.asks)] {
        for entry in levels {
            let price = Decimal::from_str(&entry[0])
                .map_err(|err| FeedError::Serialization(err.to_string()))?;
            let quantity = Decimal::from_str(&entry[1])
                .map_err(|err| FeedError::Serialization(err.to_string()))?;
            changes.push(LevelChange::at_price(side, price, Some(quantity)));
        }
    }
    Ok(vec![VenueMessage::BookDelta {
        symbol: event.symbol,
        changes,
        sequence: Some(event.final_update_id),
        first_sequence: Some(event.first_update_id),
    }])
}

#[derive(Debug, Deserialize)]
struct AggTradeEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
    #[serde(rename = "T")]
    trade_time: i64,
}

fn decode_agg_trade(event: &Value) -> FeedResult<Vec<VenueMessage>> {
    let event: AggTradeEvent = serde_json::from_value(event.clone())
        .map_err(|err| FeedError::Serialization(err.to_string()))?;
    let price = Decimal::from_str(&event.price)
        .map_err(|err| FeedError::Serialization(err.to_string()))?;
    let size = Decimal::from_str(&event.quantity)
        .map_err(|err| FeedError::Serialization(err.to_string()))?;
    let exchange_timestamp = Utc
        .timestamp_millis_opt(event.trade_time)
        .single()
        .unwrap_or_else(Utc::now);
    Ok(vec![VenueMessage::Trade(TradeEvent {
        symbol: event.symbol,
        price,
        size,
        side: if event.buyer_is_maker {
            Side::Sell
        } else {
            Side::Buy
        },
        exchange_timestamp,
        received_at: Utc::now(),
    })])
}
