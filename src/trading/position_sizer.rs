//! Position sizing: turns planned legs into broker order quantities.
//!
//! Two regimes:
//! - Leveraged: one leg per symbol, notional = equity x fraction x leverage,
//!   floored to the contract step.
//! - Margin-constrained: every leg sized 1:1 against equity, then one scale
//!   factor shrinks the basket until its margin fits the available margin
//!   minus the buffer.
//!
//! Quantities are only ever floored.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::config::{BasketDefinition, MarginBasis, SizingRegime};
use crate::models::{
    canonical_symbol, finite_positive, group_signals, AccountSnapshot, AssetClass, BasketSignal,
    ClientTag, Direction, EntrySnapshot, MarketSnapshot, OrderRequest, PlannedLeg, PlannedPair,
    SignalModel,
};

/// Why a sizing call failed as a whole.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SizingError {
    #[error("invalid account equity: {0}")]
    InvalidEquity(f64),

    #[error("invalid margin rate for {symbol}: {rate}")]
    InvalidMarginRate { symbol: String, rate: f64 },

    #[error("contracts too small for {symbol}")]
    QuantityTooSmall { symbol: String },

    #[error("no tradable legs")]
    NoTradableLegs,
}

/// One leg's tradability and unit economics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingRow {
    pub symbol: String,
    pub instrument: String,
    pub model: SignalModel,
    pub direction: Direction,
    /// False when spec, price or FX conversion is missing
    pub available: bool,
    pub price: f64,
    pub notional_per_unit: f64,
    pub margin_rate: f64,
    /// Unsigned quantity after flooring (and scaling, when margin-constrained)
    pub units: f64,
    pub precision: u32,
    pub min_units: f64,
}

impl SizingRow {
    fn unavailable(leg: &PlannedLeg) -> Self {
        Self {
            symbol: leg.symbol.clone(),
            instrument: leg.symbol.clone(),
            model: leg.model,
            direction: leg.direction,
            available: false,
            price: 0.0,
            notional_per_unit: 0.0,
            margin_rate: 0.0,
            units: 0.0,
            precision: 0,
            min_units: 0.0,
        }
    }

    pub fn is_tradable(&self) -> bool {
        self.available && self.units > 0.0
    }

    pub fn notional(&self) -> f64 {
        self.units * self.notional_per_unit
    }

    pub fn signed_units(&self) -> f64 {
        self.units * self.direction.signum()
    }
}

/// Result of one sizing pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingPlan {
    pub rows: Vec<SizingRow>,
    pub equity: f64,
    pub margin_available: Option<f64>,
    pub margin_used: Option<f64>,
    /// Margin the unscaled basket would need
    pub total_margin: f64,
    /// Factor applied to every leg, in (0, 1]
    pub scale: f64,
    /// Legs skipped for missing spec, price or conversion
    pub skipped: usize,
}

impl SizingPlan {
    pub fn tradable(&self) -> impl Iterator<Item = &SizingRow> {
        self.rows.iter().filter(|row| row.is_tradable())
    }

    pub fn tradable_count(&self) -> usize {
        self.tradable().count()
    }

    /// One market order per tradable leg, each with a fresh client tag.
    pub fn orders(&self, tag_prefix: &str) -> Vec<OrderRequest> {
        self.tradable()
            .map(|row| OrderRequest {
                symbol: row.symbol.clone(),
                instrument: row.instrument.clone(),
                model: row.model,
                direction: row.direction,
                units: row.units,
                precision: row.precision,
                client_tag: ClientTag::new(tag_prefix, &row.symbol, row.model).render(),
            })
            .collect()
    }

    /// Entry prices, net notional and net direction per symbol.
    ///
    /// Symbols whose legs cancel out carry no exposure and are left out.
    pub fn entry_snapshot(&self, time: DateTime<Utc>) -> EntrySnapshot {
        let mut net_units: BTreeMap<String, (f64, f64, f64)> = BTreeMap::new();
        for row in self.tradable() {
            let entry = net_units
                .entry(row.symbol.clone())
                .or_insert((0.0, row.price, row.notional_per_unit));
            entry.0 += row.signed_units();
        }

        let mut snapshot = EntrySnapshot {
            time,
            equity: self.equity,
            prices: BTreeMap::new(),
            notional: BTreeMap::new(),
            directions: BTreeMap::new(),
        };
        for (symbol, (units, price, npu)) in net_units {
            let direction = Direction::from_units(units);
            if !direction.is_directional() {
                continue;
            }
            snapshot.prices.insert(symbol.clone(), price);
            snapshot.notional.insert(symbol.clone(), units.abs() * npu);
            snapshot.directions.insert(symbol, direction);
        }
        snapshot
    }
}

/// Sizes baskets under one regime.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    regime: SizingRegime,
}

impl PositionSizer {
    pub fn new(regime: SizingRegime) -> Self {
        Self { regime }
    }

    /// Legs the basket intends to hold for an accepted alignment.
    ///
    /// Leveraged baskets hold one aggregated leg per symbol in the basket
    /// direction; margin-constrained baskets hold every directional vote.
    pub fn plan(
        &self,
        basket: &BasketDefinition,
        signals: &[BasketSignal],
        direction: Direction,
    ) -> Vec<PlannedPair> {
        match &self.regime {
            SizingRegime::Leveraged { .. } => basket
                .symbols
                .iter()
                .map(|symbol| {
                    let symbol = canonical_symbol(symbol);
                    PlannedPair {
                        symbol: symbol.clone(),
                        asset_class: signals
                            .iter()
                            .find(|s| canonical_symbol(&s.symbol) == symbol)
                            .map(|s| s.asset_class)
                            .unwrap_or(AssetClass::Other),
                        net: direction.sign(),
                        legs: vec![PlannedLeg::new(symbol, SignalModel::Basket, direction)],
                    }
                })
                .collect(),
            SizingRegime::MarginConstrained { .. } => {
                let filtered: Vec<BasketSignal> = signals
                    .iter()
                    .filter(|s| {
                        basket.symbols.is_empty()
                            || basket
                                .symbols
                                .iter()
                                .any(|b| canonical_symbol(b) == canonical_symbol(&s.symbol))
                    })
                    .cloned()
                    .collect();
                group_signals(&filtered, &basket.models, false)
            }
        }
    }

    /// Size planned legs against an account and market snapshot. Pure.
    pub fn size(
        &self,
        account: &AccountSnapshot,
        pairs: &[PlannedPair],
        market: &MarketSnapshot,
    ) -> Result<SizingPlan, SizingError> {
        let equity = account
            .valid_equity()
            .ok_or(SizingError::InvalidEquity(account.equity))?;

        let plan = match &self.regime {
            SizingRegime::Leveraged {
                leverage,
                equity_fraction,
            } => self.size_leveraged(account, equity, *leverage, *equity_fraction, pairs, market)?,
            SizingRegime::MarginConstrained {
                margin_buffer,
                margin_basis,
            } => self.size_margin(account, equity, *margin_buffer, *margin_basis, pairs, market)?,
        };

        if plan.tradable_count() == 0 {
            return Err(SizingError::NoTradableLegs);
        }
        Ok(plan)
    }

    fn size_leveraged(
        &self,
        account: &AccountSnapshot,
        equity: f64,
        leverage: f64,
        equity_fraction: Option<f64>,
        pairs: &[PlannedPair],
        market: &MarketSnapshot,
    ) -> Result<SizingPlan, SizingError> {
        let symbol_count = pairs.len().max(1) as f64;
        let fraction = equity_fraction.unwrap_or(1.0 / symbol_count);
        let target_notional = equity * fraction * leverage;

        let mut rows = Vec::new();
        let mut skipped = 0;
        let mut total_margin = 0.0;

        for leg in pairs.iter().flat_map(|pair| pair.legs.iter()) {
            let (Some(spec), Some(price), Some(notional_per_unit)) = (
                market.instrument(&leg.symbol),
                market.mid(&leg.symbol),
                market.notional_per_unit(&leg.symbol),
            ) else {
                skipped += 1;
                rows.push(SizingRow::unavailable(leg));
                continue;
            };

            let step = finite_positive(spec.step_size).unwrap_or(1.0);
            let units = floor_to_step(target_notional / notional_per_unit, step);
            if units <= 0.0 {
                return Err(SizingError::QuantityTooSmall {
                    symbol: leg.symbol.clone(),
                });
            }
            total_margin += units * notional_per_unit / leverage;

            rows.push(SizingRow {
                symbol: leg.symbol.clone(),
                instrument: spec.instrument.clone(),
                model: leg.model,
                direction: leg.direction,
                available: true,
                price,
                notional_per_unit,
                margin_rate: 1.0 / leverage,
                units,
                precision: spec.precision,
                min_units: finite_positive(spec.min_units).unwrap_or(step),
            });
        }

        Ok(SizingPlan {
            rows,
            equity,
            margin_available: account.margin_available,
            margin_used: account.margin_used,
            total_margin,
            scale: 1.0,
            skipped,
        })
    }

    fn size_margin(
        &self,
        account: &AccountSnapshot,
        equity: f64,
        margin_buffer: f64,
        margin_basis: MarginBasis,
        pairs: &[PlannedPair],
        market: &MarketSnapshot,
    ) -> Result<SizingPlan, SizingError> {
        let mut rows = Vec::new();
        let mut skipped = 0;

        for leg in pairs.iter().flat_map(|pair| pair.legs.iter()) {
            let (Some(spec), Some(price), Some(notional_per_unit)) = (
                market.instrument(&leg.symbol),
                market.mid(&leg.symbol),
                market.notional_per_unit(&leg.symbol),
            ) else {
                skipped += 1;
                rows.push(SizingRow::unavailable(leg));
                continue;
            };
            let Some(margin_rate) = spec.margin_rate else {
                skipped += 1;
                rows.push(SizingRow::unavailable(leg));
                continue;
            };
            if !margin_rate.is_finite() || margin_rate <= 0.0 {
                return Err(SizingError::InvalidMarginRate {
                    symbol: leg.symbol.clone(),
                    rate: margin_rate,
                });
            }

            let units = floor_to_precision(equity / notional_per_unit, spec.precision);
            let min_units =
                finite_positive(spec.min_units).unwrap_or_else(|| min_units_for(spec.precision));

            rows.push(SizingRow {
                symbol: leg.symbol.clone(),
                instrument: spec.instrument.clone(),
                model: leg.model,
                direction: leg.direction,
                available: true,
                price,
                notional_per_unit,
                margin_rate,
                units,
                precision: spec.precision,
                min_units,
            });
        }

        let total_margin = required_margin(&rows, margin_basis);
        let budget = account.margin_basis().unwrap_or(equity) * (1.0 - margin_buffer);
        let scale = if total_margin > 0.0 {
            (budget / total_margin).min(1.0)
        } else {
            1.0
        };

        for row in rows.iter_mut().filter(|row| row.available) {
            let scaled = floor_to_precision(row.units * scale, row.precision);
            row.units = if scaled < row.min_units { 0.0 } else { scaled };
        }

        Ok(SizingPlan {
            rows,
            equity,
            margin_available: account.margin_available,
            margin_used: account.margin_used,
            total_margin,
            scale,
            skipped,
        })
    }
}

/// Margin needed by the available rows. Net basis charges `|net units|` per symbol.
fn required_margin(rows: &[SizingRow], basis: MarginBasis) -> f64 {
    let available = rows.iter().filter(|row| row.available);
    match basis {
        MarginBasis::Gross => available
            .map(|row| row.units.abs() * row.notional_per_unit * row.margin_rate)
            .sum(),
        MarginBasis::Net => {
            let mut per_symbol: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
            for row in available {
                let entry = per_symbol
                    .entry(row.symbol.as_str())
                    .or_insert((0.0, row.notional_per_unit * row.margin_rate));
                entry.0 += row.signed_units();
            }
            per_symbol
                .values()
                .map(|(net_units, margin_per_unit)| net_units.abs() * margin_per_unit)
                .sum()
        }
    }
}

/// Largest scale `Decimal` can carry.
const MAX_SCALE: u32 = 28;

/// Exact decimal view of a float; `None` for non-finite or out-of-range input.
fn to_decimal(value: f64) -> Option<Decimal> {
    Decimal::try_from(value).ok()
}

/// Largest multiple of `step` not above `value`. Non-positive input gives 0.
pub fn floor_to_step(value: f64, step: f64) -> f64 {
    let (Some(value), Some(step)) = (to_decimal(value), to_decimal(step)) else {
        return 0.0;
    };
    if value <= Decimal::ZERO || step <= Decimal::ZERO {
        return 0.0;
    }
    value
        .checked_div(step)
        .and_then(|count| count.floor().checked_mul(step))
        .and_then(|units| units.to_f64())
        .unwrap_or(0.0)
}

/// Truncate to `precision` decimal places.
pub fn floor_to_precision(value: f64, precision: u32) -> f64 {
    match to_decimal(value) {
        Some(value) if value > Decimal::ZERO => value
            .round_dp_with_strategy(precision.min(MAX_SCALE), RoundingStrategy::ToZero)
            .to_f64()
            .unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Smallest quantity expressible at a precision: 1 for 0 places, 10^-p otherwise.
pub fn min_units_for(precision: u32) -> f64 {
    Decimal::new(1, precision.min(MAX_SCALE))
        .to_f64()
        .unwrap_or(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InstrumentSpec, Quote};
    use crate::trading::config::AlignmentMode;
    use rust_decimal_macros::dec;

    fn account(equity: f64, margin_available: Option<f64>) -> AccountSnapshot {
        AccountSnapshot {
            equity,
            margin_available,
            margin_used: Some(0.0),
            currency: "USD".to_string(),
        }
    }

    fn pair(symbol: &str, legs: &[(SignalModel, Direction)]) -> PlannedPair {
        PlannedPair {
            symbol: symbol.to_string(),
            asset_class: AssetClass::Fx,
            net: legs.iter().map(|(_, d)| d.sign()).sum(),
            legs: legs
                .iter()
                .map(|(m, d)| PlannedLeg::new(symbol, *m, *d))
                .collect(),
        }
    }

    fn perp_market() -> MarketSnapshot {
        let mut market = MarketSnapshot::default();
        let btc = InstrumentSpec {
            instrument: "BTCUSDT".to_string(),
            precision: 3,
            margin_rate: None,
            contract_multiplier: 0.001,
            step_size: 1.0,
            min_units: 1.0,
            usd_per_quote: Some(1.0),
        };
        market.insert("BTCUSDT", btc, Quote::last(50_000.0));
        let eth = InstrumentSpec {
            instrument: "ETHUSDT".to_string(),
            contract_multiplier: 0.01,
            ..market.instrument("BTCUSDT").unwrap().clone()
        };
        market.insert("ETHUSDT", eth, Quote::last(2_500.0));
        market
    }

    fn leveraged() -> PositionSizer {
        PositionSizer::new(SizingRegime::Leveraged {
            leverage: 10.0,
            equity_fraction: None,
        })
    }

    fn fx_market() -> MarketSnapshot {
        let mut market = MarketSnapshot::default();
        market.insert("EURUSD", InstrumentSpec::unit("EUR_USD", 0, 0.05), Quote::new(0.999, 1.001));
        market.insert("GBPUSD", InstrumentSpec::unit("GBP_USD", 0, 0.05), Quote::new(1.249, 1.251));
        market
    }

    fn margin(buffer: f64, basis: MarginBasis) -> PositionSizer {
        PositionSizer::new(SizingRegime::MarginConstrained {
            margin_buffer: buffer,
            margin_basis: basis,
        })
    }

    #[test]
    fn test_leveraged_notional_split_across_symbols() {
        let pairs = vec![
            pair("BTCUSD", &[(SignalModel::Basket, Direction::Long)]),
            pair("ETHUSD", &[(SignalModel::Basket, Direction::Long)]),
        ];
        let plan = leveraged()
            .size(&account(10_000.0, None), &pairs, &perp_market())
            .unwrap();

        // 10k equity x 10 / 2 symbols = 50k per symbol; 50k / 50k / 0.001 = 1000 contracts.
        let btc = &plan.rows[0];
        assert_eq!(btc.units, 1000.0);
        assert!((btc.units * 0.001 - 1.0).abs() < 1e-12);
        assert!((btc.notional() - 50_000.0).abs() < 1e-6);
        let eth = &plan.rows[1];
        assert!((eth.notional() - 50_000.0).abs() < 1e-6);
        assert_eq!(plan.scale, 1.0);
    }

    #[test]
    fn test_leveraged_rejects_zero_contracts() {
        let pairs = vec![pair("BTCUSD", &[(SignalModel::Basket, Direction::Short)])];
        let err = leveraged()
            .size(&account(1.0, None), &pairs, &perp_market())
            .unwrap_err();
        assert_eq!(
            err,
            SizingError::QuantityTooSmall {
                symbol: "BTCUSD".to_string()
            }
        );
    }

    #[test]
    fn test_leveraged_bad_quote_marks_leg_unavailable() {
        let pairs = vec![
            pair("BTCUSD", &[(SignalModel::Basket, Direction::Long)]),
            pair("ETHUSD", &[(SignalModel::Basket, Direction::Long)]),
        ];
        let mut market = perp_market();
        let eth = market.instrument("ETHUSDT").unwrap().clone();
        market.insert("ETHUSDT", eth, Quote::new(0.0, 0.0));

        let plan = leveraged()
            .size(&account(10_000.0, None), &pairs, &market)
            .unwrap();
        assert_eq!(plan.skipped, 1);
        assert!(plan.rows[0].available);
        assert_eq!(plan.rows[0].units, 1000.0);
        assert!(!plan.rows[1].available);
        assert_eq!(plan.tradable_count(), 1);

        let mut market = perp_market();
        for symbol in ["BTCUSDT", "ETHUSDT"] {
            let spec = market.instrument(symbol).unwrap().clone();
            market.insert(symbol, spec, Quote::last(-1.0));
        }
        let err = leveraged()
            .size(&account(10_000.0, None), &pairs, &market)
            .unwrap_err();
        assert_eq!(err, SizingError::NoTradableLegs);
    }

    #[test]
    fn test_invalid_equity_fails_whole_call() {
        let pairs = vec![pair("BTCUSD", &[(SignalModel::Basket, Direction::Long)])];
        for equity in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            let err = leveraged()
                .size(&account(equity, None), &pairs, &perp_market())
                .unwrap_err();
            assert!(matches!(err, SizingError::InvalidEquity(_)));
        }
    }

    #[test]
    fn test_margin_scale_respects_buffer() {
        let pairs = vec![
            pair("EURUSD", &[(SignalModel::Dealer, Direction::Long), (SignalModel::Sentiment, Direction::Long)]),
            pair("GBPUSD", &[(SignalModel::Dealer, Direction::Short)]),
        ];
        let sizer = margin(0.1, MarginBasis::Gross);
        let acct = account(10_000.0, Some(400.0));
        let plan = sizer.size(&acct, &pairs, &fx_market()).unwrap();

        assert!(plan.scale < 1.0);
        assert!(plan.scale * plan.total_margin <= 400.0 * 0.9 + 1e-6);

        let used: f64 = plan
            .tradable()
            .map(|row| row.units * row.notional_per_unit * row.margin_rate)
            .sum();
        assert!(used <= 400.0 * 0.9 + 1e-6);
    }

    #[test]
    fn test_margin_never_rounds_up() {
        let pairs = vec![pair("GBPUSD", &[(SignalModel::Dealer, Direction::Long)])];
        let mut market = MarketSnapshot::default();
        market.insert("GBPUSD", InstrumentSpec::unit("GBP_USD", 2, 0.05), Quote::new(1.2345, 1.2347));
        for equity in [999.99, 1234.567, 10_000.0, 77.7] {
            let plan = margin(0.0, MarginBasis::Gross)
                .size(&account(equity, None), &pairs, &market)
                .unwrap();
            let row = &plan.rows[0];
            let raw = equity / row.notional_per_unit;
            assert!(row.units <= raw + 1e-9, "{} > {}", row.units, raw);
            assert!(raw - row.units < 0.01 + 1e-9);
        }
    }

    #[test]
    fn test_net_basis_hedged_symbol_needs_no_margin() {
        let pairs = vec![pair(
            "EURUSD",
            &[(SignalModel::Dealer, Direction::Long), (SignalModel::Commercial, Direction::Short)],
        )];
        let plan = margin(0.1, MarginBasis::Net)
            .size(&account(10_000.0, Some(100.0)), &pairs, &fx_market())
            .unwrap();
        assert_eq!(plan.total_margin, 0.0);
        assert_eq!(plan.scale, 1.0);
        assert_eq!(plan.tradable_count(), 2);
        assert!(plan.entry_snapshot(Utc::now()).notional.is_empty());

        let gross = margin(0.1, MarginBasis::Gross)
            .size(&account(10_000.0, Some(100.0)), &pairs, &fx_market())
            .unwrap();
        assert!(gross.total_margin > 0.0);
        assert!(gross.scale < 1.0);
    }

    #[test]
    fn test_missing_spec_marks_leg_unavailable() {
        let pairs = vec![
            pair("EURUSD", &[(SignalModel::Dealer, Direction::Long)]),
            pair("NZDUSD", &[(SignalModel::Dealer, Direction::Long)]),
        ];
        let plan = margin(0.1, MarginBasis::Gross)
            .size(&account(10_000.0, None), &pairs, &fx_market())
            .unwrap();
        assert_eq!(plan.skipped, 1);
        assert!(!plan.rows[1].available);
        assert_eq!(plan.tradable_count(), 1);
    }

    #[test]
    fn test_no_tradable_legs_is_an_error() {
        let pairs = vec![pair("NZDUSD", &[(SignalModel::Dealer, Direction::Long)])];
        let err = margin(0.1, MarginBasis::Gross)
            .size(&account(10_000.0, None), &pairs, &fx_market())
            .unwrap_err();
        assert_eq!(err, SizingError::NoTradableLegs);
    }

    #[test]
    fn test_invalid_margin_rate_fails_whole_call() {
        let pairs = vec![pair("EURUSD", &[(SignalModel::Dealer, Direction::Long)])];
        let mut market = fx_market();
        market.insert("EURUSD", InstrumentSpec::unit("EUR_USD", 0, 0.0), Quote::new(1.0, 1.0));
        let err = margin(0.1, MarginBasis::Gross)
            .size(&account(10_000.0, None), &pairs, &market)
            .unwrap_err();
        assert!(matches!(err, SizingError::InvalidMarginRate { .. }));
    }

    #[test]
    fn test_scaled_leg_below_minimum_is_dropped() {
        let pairs = vec![
            pair("EURUSD", &[(SignalModel::Dealer, Direction::Long)]),
            pair("GBPUSD", &[(SignalModel::Dealer, Direction::Long)]),
        ];
        let mut market = fx_market();
        let mut big = InstrumentSpec::unit("GBP_USD", 0, 0.05);
        big.min_units = 5_000.0;
        market.insert("GBPUSD", big, Quote::new(1.249, 1.251));

        let plan = margin(0.1, MarginBasis::Gross)
            .size(&account(10_000.0, Some(500.0)), &pairs, &market)
            .unwrap();
        assert!(plan.rows[0].units > 0.0);
        assert_eq!(plan.rows[1].units, 0.0);
        assert!(plan.rows[1].available);
    }

    #[test]
    fn test_floor_helpers() {
        assert!((floor_to_step(0.3, 0.1) - 0.3).abs() < 1e-12);
        assert_eq!(floor_to_step(7.9, 2.0), 6.0);
        assert_eq!(floor_to_step(-1.0, 1.0), 0.0);
        assert!((floor_to_precision(1234.5678, 2) - 1234.56).abs() < 1e-9);
        assert_eq!(floor_to_precision(1234.5678, 0), 1234.0);
        assert_eq!(floor_to_precision(f64::NAN, 2), 0.0);
        assert_eq!(min_units_for(0), 1.0);
        assert!((min_units_for(3) - 0.001).abs() < 1e-15);
    }

    #[test]
    fn test_flooring_is_exact_on_decimal_boundaries() {
        assert_eq!(to_decimal(0.3), Some(dec!(0.3)));
        assert_eq!(to_decimal(f64::INFINITY), None);

        // Quotients that land a hair under the boundary in binary floating point
        assert!((floor_to_step(0.7, 0.1) - 0.7).abs() < 1e-12);
        assert!((floor_to_step(1.15, 0.05) - 1.15).abs() < 1e-12);
        assert!((floor_to_precision(0.29, 2) - 0.29).abs() < 1e-12);
        assert!((floor_to_precision(4.35, 2) - 4.35).abs() < 1e-12);

        for (value, step) in [(0.0999, 0.01), (12.3449, 0.005), (99.99, 0.1), (1e-4, 0.001)] {
            let floored = floor_to_step(value, step);
            assert!(floored <= value, "{} rounded up to {}", value, floored);
            assert!(value - floored < step);
        }
        assert_eq!(floor_to_step(1e-4, 0.001), 0.0);
    }

    #[test]
    fn test_plan_by_regime() {
        let basket = BasketDefinition {
            symbols: vec!["BTCUSDT".to_string()],
            models: vec![SignalModel::Dealer],
            asset: "crypto".to_string(),
            alignment: AlignmentMode::Unanimous,
        };
        let signals = vec![BasketSignal::new("BTCUSD", Direction::Long, SignalModel::Dealer, AssetClass::Crypto)];
        let pairs = leveraged().plan(&basket, &signals, Direction::Long);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].legs[0].model, SignalModel::Basket);
        assert_eq!(pairs[0].asset_class, AssetClass::Crypto);

        let pairs = margin(0.1, MarginBasis::Net).plan(&basket, &signals, Direction::Long);
        assert_eq!(pairs[0].legs[0].model, SignalModel::Dealer);
    }

    #[test]
    fn test_orders_carry_parseable_tags() {
        let pairs = vec![pair("EURUSD", &[(SignalModel::Dealer, Direction::Short)])];
        let plan = margin(0.1, MarginBasis::Gross)
            .size(&account(10_000.0, None), &pairs, &fx_market())
            .unwrap();
        let orders = plan.orders("uni");
        assert_eq!(orders.len(), 1);
        let tag = ClientTag::parse(&orders[0].client_tag, "uni").unwrap();
        assert_eq!(tag.symbol, "EURUSD");
        assert_eq!(tag.model, SignalModel::Dealer);
        assert_eq!(orders[0].instrument, "EUR_USD");
    }
}
