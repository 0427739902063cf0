//! REST depth snapshot collaborator.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;

use tidemark_core::{DepthSnapshot, Price, Quantity};
use tidemark_feed::{FeedError, FeedResult, SnapshotFetcher, VenueAdapter};

/// Wire shape of the depth endpoint: `{asks: [[p,q]…], bids: …, lastUpdateId}`.
#[derive(Debug, Deserialize)]
struct WireDepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

fn convert_price_levels(levels: &[[String; 2]]) -> Option<Vec<(Price, Quantity)>> {
    let mut out = Vec::with_capacity(levels.len());
    for entry in levels {
        let price = Decimal::from_str(entry.first()?).ok()?;
        let size = Decimal::from_str(entry.get(1)?).ok()?;
        out.push((price, size));
    }
    Some(out)
}

/// Fetches depth snapshots from the venue's REST surface, using the venue
/// adapter for path construction.
pub struct RestSnapshotClient {
    http: Client,
    base_url: String,
    venue: Arc<dyn VenueAdapter>,
}

impl RestSnapshotClient {
    pub fn new(base_url: impl Into<String>, venue: Arc<dyn VenueAdapter>) -> FeedResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| FeedError::Other(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            venue,
        })
    }
}

#[async_trait]
impl SnapshotFetcher for RestSnapshotClient {
    async fn fetch(&self, symbol: &str) -> FeedResult<DepthSnapshot> {
        let path = self.venue.snapshot_path(symbol).ok_or_else(|| {
            FeedError::InvalidRequest(format!(
                "venue '{}' exposes no snapshot endpoint",
                self.venue.name()
            ))
        })?;
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let wire = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| FeedError::Transport(err.to_string()))?
            .error_for_status()
            .map_err(|err| FeedError::Transport(err.to_string()))?
            .json::<WireDepthSnapshot>()
            .await
            .map_err(|err| FeedError::Serialization(err.to_string()))?;

        let bids = convert_price_levels(&wire.bids)
            .ok_or_else(|| FeedError::Serialization("invalid snapshot bids".into()))?;
        let asks = convert_price_levels(&wire.asks)
            .ok_or_else(|| FeedError::Serialization("invalid snapshot asks".into()))?;
        Ok(DepthSnapshot {
            last_update_id: wire.last_update_id,
            bids,
            asks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_snapshot_parses_the_documented_shape() {
        let raw = r#"{
            "lastUpdateId": 160,
            "bids": [["0.0024", "10"], ["0.0022", "5"]],
            "asks": [["0.0026", "100"]]
        }"#;
        let wire: WireDepthSnapshot = serde_json::from_str(raw).expect("snapshot parses");
        assert_eq!(wire.last_update_id, 160);
        let bids = convert_price_levels(&wire.bids).expect("bids convert");
        assert_eq!(bids.len(), 2);
        assert_eq!(bids[0].0, Decimal::from_str("0.0024").unwrap());
        assert_eq!(bids[0].1, Decimal::from(10));
    }

    #[test]
    fn malformed_levels_are_rejected() {
        let levels = vec![["not-a-price".to_string(), "1".to_string()]];
        assert!(convert_price_levels(&levels).is_none());
    }
}
