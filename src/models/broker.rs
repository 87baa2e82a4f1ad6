//! Broker-neutral views of account, instrument, quote and position data.
//!
//! Broker clients parse their wire payloads into these types at the boundary;
//! the trading core never sees raw JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{canonical_symbol, Direction, SignalModel};

/// Account balances as reported by a broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    /// Equity / NAV in account currency
    pub equity: f64,
    pub margin_available: Option<f64>,
    pub margin_used: Option<f64>,
    pub currency: String,
}

impl AccountSnapshot {
    /// Equity if it is finite and positive.
    pub fn valid_equity(&self) -> Option<f64> {
        finite_positive(self.equity)
    }

    /// Margin the sizer may spend: reported available margin, or equity when absent.
    pub fn margin_basis(&self) -> Option<f64> {
        self.margin_available
            .and_then(finite_positive)
            .or_else(|| self.valid_equity())
    }
}

/// Tradability and unit economics of one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    /// Broker instrument identifier (e.g. `EUR_USD`, `BTCUSDT`)
    pub instrument: String,

    /// Decimal places allowed in the order quantity
    pub precision: u32,

    /// Fraction of notional required as margin
    pub margin_rate: Option<f64>,

    /// Base-asset quantity represented by one order unit (contract size)
    pub contract_multiplier: f64,

    /// Smallest quantity increment; orders are floored to a multiple of it
    pub step_size: f64,

    /// Smallest tradable quantity
    pub min_units: f64,

    /// USD value of one unit of quote currency; `None` when no conversion exists
    pub usd_per_quote: Option<f64>,
}

impl InstrumentSpec {
    /// Spec for a plain unit-precision instrument quoted in USD.
    pub fn unit(instrument: impl Into<String>, precision: u32, margin_rate: f64) -> Self {
        let step = 10f64.powi(-(precision as i32));
        Self {
            instrument: instrument.into(),
            precision,
            margin_rate: Some(margin_rate),
            contract_multiplier: 1.0,
            step_size: step,
            min_units: step,
            usd_per_quote: Some(1.0),
        }
    }
}

/// Bid/ask snapshot; the engine uses the mid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
}

impl Quote {
    pub fn new(bid: f64, ask: f64) -> Self {
        Self { bid, ask }
    }

    /// Quote for a venue that only reports a last price.
    pub fn last(price: f64) -> Self {
        Self {
            bid: price,
            ask: price,
        }
    }

    /// Mid price, if both sides are finite and positive.
    pub fn mid(&self) -> Option<f64> {
        let bid = finite_positive(self.bid)?;
        let ask = finite_positive(self.ask)?;
        finite_positive((bid + ask) / 2.0)
    }
}

/// Instrument specs and quotes for a set of symbols, keyed by canonical symbol.
///
/// A symbol missing from either map is unavailable for this tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub instruments: HashMap<String, InstrumentSpec>,
    pub quotes: HashMap<String, Quote>,
}

impl MarketSnapshot {
    pub fn insert(&mut self, symbol: &str, spec: InstrumentSpec, quote: Quote) {
        let key = canonical_symbol(symbol);
        self.instruments.insert(key.clone(), spec);
        self.quotes.insert(key, quote);
    }

    pub fn instrument(&self, symbol: &str) -> Option<&InstrumentSpec> {
        self.instruments.get(&canonical_symbol(symbol))
    }

    pub fn mid(&self, symbol: &str) -> Option<f64> {
        self.quotes.get(&canonical_symbol(symbol)).and_then(Quote::mid)
    }

    /// USD value of one order unit, when spec, price and FX conversion are all known.
    pub fn notional_per_unit(&self, symbol: &str) -> Option<f64> {
        let spec = self.instrument(symbol)?;
        let mid = self.mid(symbol)?;
        let usd_per_quote = spec.usd_per_quote.and_then(finite_positive)?;
        finite_positive(mid * usd_per_quote * spec.contract_multiplier)
    }
}

/// A broker-reported open position (or trade, on ticket-based venues).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPositionLeg {
    pub id: String,
    pub instrument: String,
    /// Signed quantity: positive long, negative short
    pub units: f64,
    pub unrealized_pnl: f64,
    /// Free-text tag written by the engine at entry
    pub tag: Option<String>,
}

impl OpenPositionLeg {
    pub fn direction(&self) -> Direction {
        Direction::from_units(self.units)
    }

    pub fn abs_units(&self) -> f64 {
        self.units.abs()
    }

    pub fn is_open(&self) -> bool {
        self.units.is_finite() && self.units != 0.0
    }
}

/// A market order the engine asks a broker to place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub instrument: String,
    pub model: SignalModel,
    pub direction: Direction,
    /// Unsigned quantity, already floored to the instrument precision
    pub units: f64,
    pub precision: u32,
    pub client_tag: String,
}

impl OrderRequest {
    /// Quantity formatted to the instrument precision.
    pub fn units_string(&self) -> String {
        format!("{:.*}", self.precision as usize, self.units)
    }

    /// Signed quantity (positive buys, negative sells).
    pub fn signed_units(&self) -> f64 {
        match self.direction {
            Direction::Short => -self.units.abs(),
            _ => self.units.abs(),
        }
    }
}

/// Broker acknowledgement of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: Option<String>,
    pub fill_price: Option<f64>,
}

pub(crate) fn finite_positive(value: f64) -> Option<f64> {
    if value.is_finite() && value > 0.0 {
        Some(value)
    } else {
        None
    }
}
