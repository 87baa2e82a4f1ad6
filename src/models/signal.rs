//! Directional signals produced by the upstream positioning and sentiment models.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Direction of a single model vote (or of a whole basket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl Direction {
    /// +1 for LONG, -1 for SHORT, 0 for NEUTRAL.
    pub fn sign(&self) -> i32 {
        match self {
            Direction::Long => 1,
            Direction::Short => -1,
            Direction::Neutral => 0,
        }
    }

    /// Floating-point sign used when weighting percentage moves.
    pub fn signum(&self) -> f64 {
        self.sign() as f64
    }

    pub fn is_directional(&self) -> bool {
        !matches!(self, Direction::Neutral)
    }

    /// Direction implied by a signed broker quantity.
    pub fn from_units(units: f64) -> Self {
        if units > 0.0 {
            Direction::Long
        } else if units < 0.0 {
            Direction::Short
        } else {
            Direction::Neutral
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
            Direction::Neutral => "NEUTRAL",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "LONG" => Ok(Direction::Long),
            "SHORT" => Ok(Direction::Short),
            "NEUTRAL" => Ok(Direction::Neutral),
            other => Err(anyhow::anyhow!("unknown direction: {}", other)),
        }
    }
}

/// Signal model that produced a vote.
///
/// `Basket` is not an upstream model: it labels the single aggregated leg per
/// symbol that leveraged single-venue accounts trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalModel {
    Antikythera,
    Blended,
    Dealer,
    Commercial,
    Sentiment,
    Basket,
}

impl SignalModel {
    /// Every upstream model, in feed order.
    pub const UNIVERSAL: [SignalModel; 5] = [
        SignalModel::Antikythera,
        SignalModel::Blended,
        SignalModel::Dealer,
        SignalModel::Commercial,
        SignalModel::Sentiment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalModel::Antikythera => "antikythera",
            SignalModel::Blended => "blended",
            SignalModel::Dealer => "dealer",
            SignalModel::Commercial => "commercial",
            SignalModel::Sentiment => "sentiment",
            SignalModel::Basket => "basket",
        }
    }
}

impl fmt::Display for SignalModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalModel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "antikythera" => Ok(SignalModel::Antikythera),
            "blended" => Ok(SignalModel::Blended),
            "dealer" => Ok(SignalModel::Dealer),
            "commercial" => Ok(SignalModel::Commercial),
            "sentiment" => Ok(SignalModel::Sentiment),
            "basket" => Ok(SignalModel::Basket),
            other => Err(anyhow::anyhow!("unknown signal model: {}", other)),
        }
    }
}

/// Asset class a symbol belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Fx,
    Indices,
    Commodities,
    Crypto,
    #[serde(other)]
    Other,
}

impl AssetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Fx => "fx",
            AssetClass::Indices => "indices",
            AssetClass::Commodities => "commodities",
            AssetClass::Crypto => "crypto",
            AssetClass::Other => "other",
        }
    }
}

impl FromStr for AssetClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fx" => Ok(AssetClass::Fx),
            "indices" => Ok(AssetClass::Indices),
            "commodities" => Ok(AssetClass::Commodities),
            "crypto" => Ok(AssetClass::Crypto),
            other => Err(anyhow::anyhow!("unknown asset class: {}", other)),
        }
    }
}

/// Broker-neutral symbol form: uppercase, separators removed, `USDT` quoted as `USD`.
///
/// `EUR_USD`, `eur/usd` and `EURUSD` are the same symbol; so are `BTCUSDT` and `BTCUSD`.
pub fn canonical_symbol(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase();
    match cleaned.strip_suffix("USDT") {
        Some(base) if !base.is_empty() => format!("{}USD", base),
        _ => cleaned,
    }
}

/// One model's opinion on one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasketSignal {
    pub symbol: String,
    pub direction: Direction,
    pub model: SignalModel,
    pub asset_class: AssetClass,
}

impl BasketSignal {
    pub fn new(
        symbol: impl Into<String>,
        direction: Direction,
        model: SignalModel,
        asset_class: AssetClass,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            direction,
            model,
            asset_class,
        }
    }
}

/// Full signal set returned by the feed for one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalSnapshot {
    #[serde(default)]
    pub pairs: Vec<BasketSignal>,

    /// False when upstream data is stale; the engine then treats the set as empty.
    #[serde(default = "default_trading_allowed")]
    pub trading_allowed: bool,

    #[serde(default)]
    pub reason: Option<String>,
}

fn default_trading_allowed() -> bool {
    true
}

impl SignalSnapshot {
    pub fn new(pairs: Vec<BasketSignal>) -> Self {
        Self {
            pairs,
            trading_allowed: true,
            reason: None,
        }
    }

    /// Signals the engine may act on. Empty when trading is not allowed.
    pub fn tradable(&self) -> &[BasketSignal] {
        if self.trading_allowed {
            &self.pairs
        } else {
            &[]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_deserializes_feed_shape() {
        let raw = r#"{"symbol":"EURUSD","direction":"LONG","model":"dealer","asset_class":"fx"}"#;
        let signal: BasketSignal = serde_json::from_str(raw).unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.model, SignalModel::Dealer);
        assert_eq!(signal.asset_class, AssetClass::Fx);
    }

    #[test]
    fn test_untradable_snapshot_is_empty() {
        let snapshot = SignalSnapshot {
            pairs: vec![BasketSignal::new(
                "BTCUSD",
                Direction::Short,
                SignalModel::Sentiment,
                AssetClass::Crypto,
            )],
            trading_allowed: false,
            reason: Some("stale".to_string()),
        };
        assert!(snapshot.tradable().is_empty());
    }

    #[test]
    fn test_canonical_symbol() {
        assert_eq!(canonical_symbol("EUR_USD"), "EURUSD");
        assert_eq!(canonical_symbol(" btcusdt "), "BTCUSD");
        assert_eq!(canonical_symbol("SPX500_USD"), "SPX500USD");
        assert_eq!(canonical_symbol("USDT"), "USDT");
    }

    #[test]
    fn test_direction_from_units() {
        assert_eq!(Direction::from_units(12.0), Direction::Long);
        assert_eq!(Direction::from_units(-0.5), Direction::Short);
        assert_eq!(Direction::from_units(0.0), Direction::Neutral);
    }
}
