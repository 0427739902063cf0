//! Bybit-style venue adapter: `op`/`args` wire commands, HMAC-signed login,
//! WS-managed order book snapshots and deltas.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::debug;
use uuid::Uuid;

use tidemark_core::{
    BookOrder, ExecutionEvent, LevelChange, OrderEvent, OrderStatus, Side, TradeEvent,
};
use tidemark_feed::{
    register_venue_factory, Credentials, FeedError, FeedResult, SnapshotPolicy, Subscription,
    SubscriptionKind, VenueAdapter, VenueInfo, VenueMessage,
};

type HmacSha256 = Hmac<Sha256>;

/// Bybit public channel families.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PublicChannel {
    Linear,
    Inverse,
    Spot,
    Option,
}

impl PublicChannel {
    #[must_use]
    pub fn as_path(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Inverse => "inverse",
            Self::Spot => "spot",
            Self::Option => "option",
        }
    }
}

impl FromStr for PublicChannel {
    type Err = FeedError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "inverse" => Ok(Self::Inverse),
            "spot" => Ok(Self::Spot),
            "option" => Ok(Self::Option),
            other => Err(FeedError::InvalidRequest(format!(
                "unsupported Bybit public channel '{other}'"
            ))),
        }
    }
}

pub struct BybitVenue {
    channel: PublicChannel,
    counter: AtomicU64,
}

impl BybitVenue {
    #[must_use]
    pub fn new(channel: PublicChannel) -> Self {
        Self {
            channel,
            counter: AtomicU64::new(1),
        }
    }

    /// Register this adapter in the venue factory registry.
    pub fn register() {
        register_venue_factory("bybit", |params| {
            let channel = params
                .get("channel")
                .and_then(Value::as_str)
                .map(PublicChannel::from_str)
                .transpose()?
                .unwrap_or(PublicChannel::Linear);
            Ok(std::sync::Arc::new(BybitVenue::new(channel)))
        });
    }

    #[must_use]
    pub fn order_book_subscription(symbol: &str, depth: usize) -> Subscription {
        Subscription::order_book(format!("orderbook.{depth}.{symbol}"), symbol)
    }

    #[must_use]
    pub fn trades_subscription(symbol: &str) -> Subscription {
        Subscription::trades(format!("publicTrade.{symbol}"), symbol)
    }

    #[must_use]
    pub fn orders_subscription() -> Subscription {
        Subscription::private("order", SubscriptionKind::Orders)
    }

    #[must_use]
    pub fn executions_subscription() -> Subscription {
        Subscription::private("execution", SubscriptionKind::Executions)
    }
}

impl VenueAdapter for BybitVenue {
    fn name(&self) -> &'static str {
        "bybit"
    }

    fn info(&self) -> Option<VenueInfo> {
        Some(VenueInfo {
            name: format!("bybit-{}", self.channel.as_path()),
            markets: vec![self.channel.as_path().to_string()],
            supports_testnet: true,
        })
    }

    fn next_correlation_id(&self) -> String {
        let serial = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{serial}", Uuid::new_v4().simple())
    }

    fn subscribe_command(&self, id: &str, subscription: &Subscription) -> String {
        json!({
            "req_id": id,
            "op": "subscribe",
            "args": [subscription.topic],
        })
        .to_string()
    }

    fn login_command(&self, credentials: &Credentials) -> Option<String> {
        let expires = (Utc::now() + chrono::Duration::seconds(10)).timestamp_millis();
        let payload = format!("GET/realtime{expires}");
        let mut mac = HmacSha256::new_from_slice(credentials.api_secret.as_bytes()).ok()?;
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        Some(
            json!({
                "op": "auth",
                "args": [credentials.api_key, expires, signature],
            })
            .to_string(),
        )
    }

    fn heartbeat_command(&self) -> Option<String> {
        Some(json!({"op": "ping"}).to_string())
    }

    fn snapshot_policy(&self) -> SnapshotPolicy {
        SnapshotPolicy::WsManaged
    }

    fn decode(&self, raw: &str) -> FeedResult<Vec<VenueMessage>> {
        let value: Value =
            serde_json::from_str(raw).map_err(|err| FeedError::Serialization(err.to_string()))?;

        if let Some(topic) = value.get("topic").and_then(Value::as_str) {
            if topic.starts_with("orderbook.") {
                return decode_orderbook(&value);
            }
            if topic.starts_with("publicTrade") {
                return decode_trades(&value);
            }
            if topic == "order" {
                return decode_orders(&value);
            }
            if topic == "execution" {
                return decode_executions(&value);
            }
            debug!(topic, "ignoring unsupported Bybit topic");
            return Ok(vec![VenueMessage::Ignored]);
        }

        match value.get("op").and_then(Value::as_str) {
            Some("subscribe") => {
                let success = value
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                let id = value
                    .get("req_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(vec![VenueMessage::Ack {
                    id,
                    success,
                    detail: value
                        .get("ret_msg")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }])
            }
            Some("auth") => Ok(vec![VenueMessage::AuthAck {
                success: value
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                detail: value
                    .get("ret_msg")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }]),
            Some("ping") | Some("pong") => Ok(vec![VenueMessage::Pong]),
            _ => Ok(vec![VenueMessage::Ignored]),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OrderBookData {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
    #[serde(rename = "u")]
    update_id: Option<u64>,
}

fn parse_levels(levels: &[[String; 2]]) -> Vec<(Decimal, Decimal)> {
    levels
        .iter()
        .filter_map(|entry| {
            let price = Decimal::from_str(&entry[0]).ok()?;
            let quantity = Decimal::from_str(&entry[1]).ok()?;
            Some((price, quantity))
        })
        .collect()
}

fn decode_orderbook(value: &Value) -> FeedResult<Vec<VenueMessage>> {
    let data: OrderBookData = serde_json::from_value(value.get("data").cloned().unwrap_or_default())
        .map_err(|err| FeedError::Serialization(err.to_string()))?;
    let bids = parse_levels(&data.bids);
    let asks = parse_levels(&data.asks);
    match value.get("type").and_then(Value::as_str) {
        Some("snapshot") => Ok(vec![VenueMessage::BookSnapshot {
            symbol: data.symbol,
            bids: bids
                .into_iter()
                .map(|(price, quantity)| BookOrder::price_keyed(price, quantity))
                .collect(),
            asks: asks
                .into_iter()
                .map(|(price, quantity)| BookOrder::price_keyed(price, quantity))
                .collect(),
        }]),
        Some("delta") => {
            let mut changes = Vec::new();
            for (price, quantity) in bids {
                changes.push(LevelChange::at_price(Side::Buy, price, Some(quantity)));
            }
            for (price, quantity) in asks {
                changes.push(LevelChange::at_price(Side::Sell, price, Some(quantity)));
            }
            Ok(vec![VenueMessage::BookDelta {
                symbol: data.symbol,
                changes,
                sequence: data.update_id,
                first_sequence: None,
            }])
        }
        _ => Ok(vec![VenueMessage::Ignored]),
    }
}

#[derive(Debug, Deserialize)]
struct TradeEntry {
    #[serde(rename = "T")]
    timestamp: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "v")]
    size: String,
    #[serde(rename = "p")]
    price: String,
}

fn decode_trades(value: &Value) -> FeedResult<Vec<VenueMessage>> {
    let entries: Vec<TradeEntry> =
        serde_json::from_value(value.get("data").cloned().unwrap_or_default())
            .map_err(|err| FeedError::Serialization(err.to_string()))?;
    let mut messages = Vec::new();
    for entry in entries {
        let Some(price) = Decimal::from_str(&entry.price).ok() else {
            continue;
        };
        let Some(size) = Decimal::from_str(&entry.size).ok() else {
            continue;
        };
        let side = match entry.side.as_str() {
            "Buy" => Side::Buy,
            "Sell" => Side::Sell,
            _ => continue,
        };
        let Some(exchange_timestamp) = millis_to_datetime(entry.timestamp) else {
            continue;
        };
        messages.push(VenueMessage::Trade(TradeEvent {
            symbol: entry.symbol,
            price,
            size,
            side,
            exchange_timestamp,
            received_at: Utc::now(),
        }));
    }
    if messages.is_empty() {
        messages.push(VenueMessage::Ignored);
    }
    Ok(messages)
}

#[derive(Debug, Deserialize)]
struct WsOrder {
    #[serde(rename = "orderId")]
    order_id: String,
    symbol: String,
    side: String,
    #[serde(rename = "orderStatus")]
    order_status: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    qty: String,
    #[serde(rename = "cumExecQty", default)]
    cum_exec_qty: String,
    #[serde(rename = "updatedTime", default)]
    updated_time: String,
}

/// Map Bybit order state names onto the framework status.
#[must_use]
pub fn map_order_status(status: &str) -> OrderStatus {
    match status {
        "Created" | "Untriggered" | "Triggered" => OrderStatus::PendingNew,
        "New" => OrderStatus::Accepted,
        "PartiallyFilled" => OrderStatus::PartiallyFilled,
        "Filled" => OrderStatus::Filled,
        "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => OrderStatus::Canceled,
        "Rejected" => OrderStatus::Rejected,
        _ => OrderStatus::PendingNew,
    }
}

fn decode_orders(value: &Value) -> FeedResult<Vec<VenueMessage>> {
    let entries: Vec<WsOrder> =
        serde_json::from_value(value.get("data").cloned().unwrap_or_default())
            .map_err(|err| FeedError::Serialization(err.to_string()))?;
    let mut messages = Vec::new();
    for entry in entries {
        let status = map_order_status(&entry.order_status);
        let event = OrderEvent {
            order_id: entry.order_id,
            symbol: entry.symbol,
            side: match entry.side.as_str() {
                "Buy" => Some(Side::Buy),
                "Sell" => Some(Side::Sell),
                _ => None,
            },
            price: Decimal::from_str(&entry.price).ok(),
            quantity: Decimal::from_str(&entry.qty).ok(),
            filled_quantity: Decimal::from_str(&entry.cum_exec_qty).ok(),
            status,
            timestamp: entry
                .updated_time
                .parse::<i64>()
                .ok()
                .and_then(millis_to_datetime)
                .unwrap_or_else(Utc::now),
        };
        if status == OrderStatus::Canceled {
            messages.push(VenueMessage::Cancelation(event));
        } else {
            messages.push(VenueMessage::OrderUpdate(event));
        }
    }
    if messages.is_empty() {
        messages.push(VenueMessage::Ignored);
    }
    Ok(messages)
}

#[derive(Debug, Deserialize)]
struct WsExecution {
    #[serde(rename = "orderId")]
    order_id: String,
    symbol: String,
    side: String,
    #[serde(rename = "execPrice")]
    exec_price: String,
    #[serde(rename = "execQty")]
    exec_qty: String,
    #[serde(rename = "execFee", default)]
    exec_fee: String,
    #[serde(rename = "execTime", default)]
    exec_time: String,
}

fn decode_executions(value: &Value) -> FeedResult<Vec<VenueMessage>> {
    let entries: Vec<WsExecution> =
        serde_json::from_value(value.get("data").cloned().unwrap_or_default())
            .map_err(|err| FeedError::Serialization(err.to_string()))?;
    let mut messages = Vec::new();
    for entry in entries {
        let side = match entry.side.as_str() {
            "Buy" => Side::Buy,
            "Sell" => Side::Sell,
            other => {
                return Err(FeedError::Serialization(format!(
                    "unhandled execution side: {other}"
                )))
            }
        };
        let fill_price = Decimal::from_str(&entry.exec_price)
            .map_err(|err| FeedError::Serialization(err.to_string()))?;
        let fill_quantity = Decimal::from_str(&entry.exec_qty)
            .map_err(|err| FeedError::Serialization(err.to_string()))?;
        messages.push(VenueMessage::Execution(ExecutionEvent {
            order_id: entry.order_id,
            symbol: entry.symbol,
            side,
            fill_price,
            fill_quantity,
            fee: Decimal::from_str(&entry.exec_fee).ok(),
            timestamp: entry
                .exec_time
                .parse::<i64>()
                .ok()
                .and_then(millis_to_datetime)
                .unwrap_or_else(Utc::now),
        }));
    }
    if messages.is_empty() {
        messages.push(VenueMessage::Ignored);
    }
    Ok(messages)
}

fn millis_to_datetime(value: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(value).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn venue() -> BybitVenue {
        BybitVenue::new(PublicChannel::Linear)
    }

    #[test]
    fn subscribe_command_carries_correlation_id_and_topic() {
        let venue = venue();
        let subscription = BybitVenue::order_book_subscription("BTCUSDT", 50);
        let command = venue.subscribe_command("req-1", &subscription);
        let value: Value = serde_json::from_str(&command).unwrap();
        assert_eq!(value["op"], "subscribe");
        assert_eq!(value["req_id"], "req-1");
        assert_eq!(value["args"][0], "orderbook.50.BTCUSDT");
    }

    #[test]
    fn login_command_is_signed() {
        let venue = venue();
        let command = venue
            .login_command(&Credentials {
                api_key: "key".into(),
                api_secret: "secret".into(),
            })
            .expect("login command");
        let value: Value = serde_json::from_str(&command).unwrap();
        assert_eq!(value["op"], "auth");
        assert_eq!(value["args"][0], "key");
        let signature = value["args"][2].as_str().unwrap();
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn orderbook_snapshot_and_delta_decode() {
        let venue = venue();
        let snapshot = json!({
            "topic": "orderbook.50.BTCUSDT",
            "type": "snapshot",
            "data": {
                "s": "BTCUSDT",
                "b": [["65000", "1.5"]],
                "a": [["65001", "2"]],
                "u": 100
            }
        })
        .to_string();
        let messages = venue.decode(&snapshot).unwrap();
        assert!(matches!(
            &messages[0],
            VenueMessage::BookSnapshot { symbol, bids, asks }
                if symbol == "BTCUSDT" && bids.len() == 1 && asks.len() == 1
        ));

        let delta = json!({
            "topic": "orderbook.50.BTCUSDT",
            "type": "delta",
            "data": {
                "s": "BTCUSDT",
                "b": [["65000", "0"]],
                "a": [],
                "u": 101
            }
        })
        .to_string();
        let messages = venue.decode(&delta).unwrap();
        match &messages[0] {
            VenueMessage::BookDelta {
                changes, sequence, ..
            } => {
                assert_eq!(changes.len(), 1);
                assert_eq!(*sequence, Some(101));
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn subscribe_ack_and_auth_ack_decode() {
        let venue = venue();
        let ack = json!({"op": "subscribe", "success": true, "req_id": "abc"}).to_string();
        assert!(matches!(
            &venue.decode(&ack).unwrap()[0],
            VenueMessage::Ack { id, success: true, .. } if id == "abc"
        ));

        let rejected = json!({"op": "auth", "success": false, "ret_msg": "bad sig"}).to_string();
        assert!(matches!(
            &venue.decode(&rejected).unwrap()[0],
            VenueMessage::AuthAck { success: false, detail: Some(detail) } if detail == "bad sig"
        ));
    }

    #[test]
    fn canceled_orders_route_to_cancelations() {
        let venue = venue();
        let frame = json!({
            "topic": "order",
            "data": [{
                "orderId": "o-1",
                "symbol": "BTCUSDT",
                "side": "Buy",
                "orderStatus": "Cancelled",
                "price": "65000",
                "qty": "1",
                "cumExecQty": "0",
                "updatedTime": "1680000000000"
            }]
        })
        .to_string();
        assert!(matches!(
            &venue.decode(&frame).unwrap()[0],
            VenueMessage::Cancelation(event) if event.status == OrderStatus::Canceled
        ));
    }
}
