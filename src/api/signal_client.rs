//! Client for the weekly basket signal feed.

#[cfg(test)]
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use super::types::{BasketsResponse, RawBasketSignal};
use super::SignalFeed;
use crate::models::{AssetClass, BasketSignal, Direction, SignalModel, SignalSnapshot};

const BASKETS_PATH: &str = "/api/cot/baskets/latest";

/// HTTP client for `{APP_BASE_URL}/api/cot/baskets/latest`.
pub struct SignalClient {
    client: Client,
    base_url: String,
}

impl SignalClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SignalFeed for SignalClient {
    async fn latest(&self, asset: &str) -> Result<SignalSnapshot> {
        let url = format!("{}{}", self.base_url, BASKETS_PATH);
        debug!(url = %url, asset = %asset, "Fetching basket signals");

        let response = self
            .client
            .get(&url)
            .query(&[("asset", asset)])
            .header("Cache-Control", "no-store")
            .send()
            .await
            .context("Failed to fetch basket signals")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Signal request failed: {} - {}", status, body);
        }

        let payload: BasketsResponse = response
            .json()
            .await
            .context("Failed to parse basket signals")?;

        let snapshot = snapshot_from_response(payload);
        debug!(
            signals = snapshot.pairs.len(),
            trading_allowed = snapshot.trading_allowed,
            "Fetched basket signals"
        );
        Ok(snapshot)
    }
}

/// Convert a feed payload, dropping rows with an unknown model or direction.
pub(crate) fn snapshot_from_response(payload: BasketsResponse) -> SignalSnapshot {
    let pairs = payload
        .pairs
        .into_iter()
        .filter_map(|raw| match parse_signal(&raw) {
            Some(signal) => Some(signal),
            None => {
                warn!(
                    symbol = %raw.symbol,
                    model = %raw.model,
                    direction = %raw.direction,
                    "Ignoring unreadable signal"
                );
                None
            }
        })
        .collect();

    SignalSnapshot {
        pairs,
        trading_allowed: payload.trading_allowed.unwrap_or(true),
        reason: payload.reason,
    }
}

fn parse_signal(raw: &RawBasketSignal) -> Option<BasketSignal> {
    let symbol = raw.symbol.trim();
    if symbol.is_empty() {
        return None;
    }
    let direction = raw.direction.parse::<Direction>().ok()?;
    let model = raw.model.parse::<SignalModel>().ok()?;
    let asset_class = raw
        .asset_class
        .as_deref()
        .and_then(|a| a.parse::<AssetClass>().ok())
        .unwrap_or(AssetClass::Other);
    Some(BasketSignal::new(
        symbol.to_uppercase(),
        direction,
        model,
        asset_class,
    ))
}

/// Feed returning a fixed snapshot, replaceable between ticks.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct StaticSignalFeed {
    snapshot: Mutex<SignalSnapshot>,
}

#[cfg(test)]
impl StaticSignalFeed {
    pub fn new(snapshot: SignalSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn set(&self, snapshot: SignalSnapshot) {
        match self.snapshot.lock() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

#[cfg(test)]
#[async_trait]
impl SignalFeed for StaticSignalFeed {
    async fn latest(&self, _asset: &str) -> Result<SignalSnapshot> {
        let snapshot = match self.snapshot.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_from_response() {
        let raw = r#"{
            "report_date": "2024-06-04",
            "trading_allowed": true,
            "pairs": [
                {"symbol": "EURUSD", "direction": "LONG", "model": "dealer", "asset_class": "fx"},
                {"symbol": "gbpusd", "direction": "SHORT", "model": "commercial", "asset_class": "fx"},
                {"symbol": "USDJPY", "direction": "LONG", "model": "astrology", "asset_class": "fx"},
                {"symbol": "SPXUSD", "direction": "NEUTRAL", "model": "sentiment", "asset_class": "indices"}
            ]
        }"#;
        let payload: BasketsResponse = serde_json::from_str(raw).unwrap();
        let snapshot = snapshot_from_response(payload);

        assert!(snapshot.trading_allowed);
        assert_eq!(snapshot.pairs.len(), 3);
        assert_eq!(snapshot.pairs[1].symbol, "GBPUSD");
        assert_eq!(snapshot.pairs[1].direction, Direction::Short);
        assert_eq!(snapshot.pairs[2].asset_class, AssetClass::Indices);
    }

    #[test]
    fn test_stale_feed_is_not_tradable() {
        let raw = r#"{"trading_allowed": false, "reason": "no snapshot available", "pairs": []}"#;
        let payload: BasketsResponse = serde_json::from_str(raw).unwrap();
        let snapshot = snapshot_from_response(payload);
        assert!(!snapshot.trading_allowed);
        assert!(snapshot.tradable().is_empty());
        assert_eq!(snapshot.reason.as_deref(), Some("no snapshot available"));
    }

    #[tokio::test]
    async fn test_static_feed_replaces_snapshot() {
        let feed = StaticSignalFeed::default();
        assert!(feed.latest("fx").await.unwrap().pairs.is_empty());

        feed.set(SignalSnapshot::new(vec![BasketSignal::new(
            "EURUSD",
            Direction::Long,
            SignalModel::Dealer,
            AssetClass::Fx,
        )]));
        assert_eq!(feed.latest("fx").await.unwrap().pairs.len(), 1);
    }
}
