//! Venue adapter speaking the plain reference wire protocol understood by
//! [`MockVenueServer`](crate::MockVenueServer).
//!
//! Subscribe command: `{id, op: "subscribe", args: [topic]}`, acknowledged by
//! `{id, type: "subscribed"}`. Login: `{op: "login", args: [key]}`, answered
//! by `{type: "auth", success}`. Book topics are `book.{SYMBOL}`, trades
//! `trades.{SYMBOL}`.

use std::str::FromStr;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use uuid::Uuid;

use tidemark_core::{BookOrder, LevelChange, Side, TradeEvent};
use tidemark_feed::{
    Credentials, FeedError, FeedResult, SnapshotPolicy, Subscription, VenueAdapter, VenueMessage,
};

pub struct ReferenceVenue {
    policy: SnapshotPolicy,
}

impl ReferenceVenue {
    #[must_use]
    pub fn new(policy: SnapshotPolicy) -> Self {
        Self { policy }
    }
}

impl Default for ReferenceVenue {
    fn default() -> Self {
        Self::new(SnapshotPolicy::WsManaged)
    }
}

impl VenueAdapter for ReferenceVenue {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn next_correlation_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    fn subscribe_command(&self, id: &str, subscription: &Subscription) -> String {
        json!({
            "id": id,
            "op": "subscribe",
            "args": [subscription.topic],
        })
        .to_string()
    }

    fn login_command(&self, credentials: &Credentials) -> Option<String> {
        Some(
            json!({
                "op": "login",
                "args": [credentials.api_key],
            })
            .to_string(),
        )
    }

    fn snapshot_policy(&self) -> SnapshotPolicy {
        self.policy
    }

    fn snapshot_path(&self, symbol: &str) -> Option<String> {
        Some(format!("/depth?symbol={symbol}"))
    }

    fn decode(&self, raw: &str) -> FeedResult<Vec<VenueMessage>> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| FeedError::Serialization(err.to_string()))?;

        if let Some(id) = value.get("id").and_then(Value::as_str) {
            if value.get("type").and_then(Value::as_str) == Some("subscribed") {
                let success = value
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                return Ok(vec![VenueMessage::Ack {
                    id: id.to_string(),
                    success,
                    detail: value
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }]);
            }
        }
        if value.get("type").and_then(Value::as_str) == Some("auth") {
            return Ok(vec![VenueMessage::AuthAck {
                success: value
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                detail: value
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }]);
        }
        if value.get("op").and_then(Value::as_str) == Some("pong") {
            return Ok(vec![VenueMessage::Pong]);
        }

        let Some(topic) = value.get("topic").and_then(Value::as_str) else {
            return Ok(vec![VenueMessage::Ignored]);
        };
        if let Some(symbol) = topic.strip_prefix("book.") {
            return decode_book(symbol, &value);
        }
        if let Some(symbol) = topic.strip_prefix("trades.") {
            return decode_trades(symbol, &value);
        }
        Ok(vec![VenueMessage::Ignored])
    }
}

fn levels(value: Option<&Value>) -> Vec<(Decimal, Decimal)> {
    value
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let pair = entry.as_array()?;
                    let price = Decimal::from_str(pair.first()?.as_str()?).ok()?;
                    let quantity = Decimal::from_str(pair.get(1)?.as_str()?).ok()?;
                    Some((price, quantity))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn decode_book(symbol: &str, value: &Value) -> FeedResult<Vec<VenueMessage>> {
    let data = value.get("data").unwrap_or(&Value::Null);
    let bids = levels(data.get("b"));
    let asks = levels(data.get("a"));
    match value.get("type").and_then(Value::as_str) {
        Some("snapshot") => Ok(vec![VenueMessage::BookSnapshot {
            symbol: symbol.to_string(),
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
                symbol: symbol.to_string(),
                changes,
                sequence: value.get("u").and_then(Value::as_u64),
                first_sequence: value.get("U").and_then(Value::as_u64),
            }])
        }
        _ => Ok(vec![VenueMessage::Ignored]),
    }
}

fn decode_trades(symbol: &str, value: &Value) -> FeedResult<Vec<VenueMessage>> {
    let Some(entries) = value.get("data").and_then(Value::as_array) else {
        return Ok(vec![VenueMessage::Ignored]);
    };
    let mut messages = Vec::new();
    for entry in entries {
        let Some(price) = entry
            .get("p")
            .and_then(Value::as_str)
            .and_then(|p| Decimal::from_str(p).ok())
        else {
            continue;
        };
        let Some(size) = entry
            .get("v")
            .and_then(Value::as_str)
            .and_then(|v| Decimal::from_str(v).ok())
        else {
            continue;
        };
        let side = match entry.get("S").and_then(Value::as_str) {
            Some("Buy") => Side::Buy,
            Some("Sell") => Side::Sell,
            _ => continue,
        };
        messages.push(VenueMessage::Trade(TradeEvent {
            symbol: symbol.to_string(),
            price,
            size,
            side,
            exchange_timestamp: Utc::now(),
            received_at: Utc::now(),
        }));
    }
    if messages.is_empty() {
        messages.push(VenueMessage::Ignored);
    }
    Ok(messages)
}
