//! Planned legs: what the engine intends to hold for a basket.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{canonical_symbol, AssetClass, BasketSignal, Direction, SignalModel};

/// One model's directional vote on one symbol, as the engine intends to trade it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedLeg {
    pub symbol: String,
    pub model: SignalModel,
    pub direction: Direction,
}

impl PlannedLeg {
    pub fn new(symbol: impl Into<String>, model: SignalModel, direction: Direction) -> Self {
        Self {
            symbol: symbol.into(),
            model,
            direction,
        }
    }

    pub fn key(&self) -> LegKey {
        LegKey::new(&self.symbol, self.model, self.direction)
    }
}

/// All planned legs on one symbol plus their signed agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedPair {
    pub symbol: String,
    pub asset_class: AssetClass,
    /// +1 per LONG leg, -1 per SHORT leg.
    pub net: i32,
    pub legs: Vec<PlannedLeg>,
}

/// Identity used to match intended legs against broker positions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LegKey {
    pub symbol: String,
    pub model: SignalModel,
    pub direction: Direction,
}

impl LegKey {
    pub fn new(symbol: &str, model: SignalModel, direction: Direction) -> Self {
        Self {
            symbol: canonical_symbol(symbol),
            model,
            direction,
        }
    }
}

impl fmt::Display for LegKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.symbol, self.model, self.direction)
    }
}

/// Group non-neutral votes of the given models by symbol.
///
/// Symbols whose legs cancel out completely (`net == 0`) are dropped when
/// `drop_netted` is set. Output is sorted by symbol.
pub fn group_signals(
    signals: &[BasketSignal],
    models: &[SignalModel],
    drop_netted: bool,
) -> Vec<PlannedPair> {
    let mut grouped: BTreeMap<(String, &'static str), PlannedPair> = BTreeMap::new();

    for signal in signals {
        if !models.contains(&signal.model) || !signal.direction.is_directional() {
            continue;
        }
        let symbol = canonical_symbol(&signal.symbol);
        let entry = grouped
            .entry((symbol.clone(), signal.asset_class.as_str()))
            .or_insert_with(|| PlannedPair {
                symbol: symbol.clone(),
                asset_class: signal.asset_class,
                net: 0,
                legs: Vec::new(),
            });
        entry
            .legs
            .push(PlannedLeg::new(symbol, signal.model, signal.direction));
        entry.net += signal.direction.sign();
    }

    grouped
        .into_values()
        .filter(|pair| !drop_netted || pair.net != 0)
        .collect()
}
