//! Wire types for the signal feed and the paper market file.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::models::{InstrumentSpec, Quote};

// ==================== Signal feed ====================

/// Response from `/api/cot/baskets/latest`.
#[derive(Debug, Clone, Deserialize)]
pub struct BasketsResponse {
    #[serde(default)]
    pub pairs: Vec<RawBasketSignal>,
    #[serde(default)]
    pub trading_allowed: Option<bool>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub week_open_utc: Option<String>,
}

/// Signal row as sent by the feed; parsed leniently so one bad row does not drop the set.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBasketSignal {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub direction: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub asset_class: Option<String>,
}

// ==================== Paper market ====================

/// One instrument in a paper market file.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketFileEntry {
    pub spec: InstrumentSpec,
    pub quote: Quote,
}

/// Paper market file: symbol -> spec and quote.
///
/// ```json
/// { "BTCUSDT": { "spec": { "instrument": "BTCUSDT", "precision": 3, ... },
///                "quote": { "bid": 64000.0, "ask": 64001.0 } } }
/// ```
pub type MarketFile = BTreeMap<String, MarketFileEntry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baskets_response_defaults() {
        let raw = r#"{"pairs":[{"symbol":"EURUSD","direction":"LONG","model":"dealer"}]}"#;
        let payload: BasketsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.pairs.len(), 1);
        assert_eq!(payload.pairs[0].asset_class, None);
        assert_eq!(payload.trading_allowed, None);

        let payload: BasketsResponse =
            serde_json::from_str(r#"{"trading_allowed":false,"reason":"stale"}"#).unwrap();
        assert!(payload.pairs.is_empty());
        assert_eq!(payload.trading_allowed, Some(false));
    }

    #[test]
    fn test_market_file_parses() {
        let raw = r#"{
            "EURUSD": {
                "spec": {
                    "instrument": "EUR_USD",
                    "precision": 0,
                    "margin_rate": 0.02,
                    "contract_multiplier": 1.0,
                    "step_size": 1.0,
                    "min_units": 1.0,
                    "usd_per_quote": 1.0
                },
                "quote": { "bid": 1.0999, "ask": 1.1001 }
            }
        }"#;
        let market: MarketFile = serde_json::from_str(raw).unwrap();
        let entry = &market["EURUSD"];
        assert_eq!(entry.spec.instrument, "EUR_USD");
        assert_eq!(entry.spec.margin_rate, Some(0.02));
        assert!((entry.quote.mid().unwrap() - 1.1).abs() < 1e-12);
    }
}
