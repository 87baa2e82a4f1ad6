//! Simulated broker. Fills market orders at mid and marks positions to market.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use super::types::MarketFile;
use super::Broker;
use crate::db::{PaperAccountRecord, PaperLedger, PaperPositionRecord};
use crate::models::{
    canonical_symbol, AccountSnapshot, InstrumentSpec, MarketSnapshot, OpenPositionLeg, OrderAck,
    OrderRequest, Quote,
};

#[derive(Debug, Clone)]
struct PaperPosition {
    symbol: String,
    entry_price: f64,
    leg: OpenPositionLeg,
}

impl PaperPosition {
    fn record(&self) -> PaperPositionRecord {
        PaperPositionRecord {
            id: self.leg.id.clone(),
            symbol: self.symbol.clone(),
            instrument: self.leg.instrument.clone(),
            units: self.leg.units,
            entry_price: self.entry_price,
            tag: self.leg.tag.clone(),
        }
    }
}

impl From<PaperPositionRecord> for PaperPosition {
    fn from(record: PaperPositionRecord) -> Self {
        Self {
            symbol: record.symbol,
            entry_price: record.entry_price,
            leg: OpenPositionLeg {
                id: record.id,
                instrument: record.instrument,
                units: record.units,
                unrealized_pnl: 0.0,
                tag: record.tag,
            },
        }
    }
}

#[derive(Debug, Default)]
struct PaperBook {
    balance: f64,
    markets: HashMap<String, (InstrumentSpec, Quote)>,
    positions: Vec<PaperPosition>,
    next_id: u64,
    failing: bool,
}

impl PaperBook {
    fn value_per_unit(&self, symbol: &str, price: f64) -> f64 {
        self.markets
            .get(symbol)
            .map(|(spec, _)| price * spec.contract_multiplier * spec.usd_per_quote.unwrap_or(1.0))
            .unwrap_or(price)
    }

    fn unrealized(&self, position: &PaperPosition) -> f64 {
        let Some(mid) = self
            .markets
            .get(&position.symbol)
            .and_then(|(_, quote)| quote.mid())
        else {
            return 0.0;
        };
        let move_per_unit = self.value_per_unit(&position.symbol, mid)
            - self.value_per_unit(&position.symbol, position.entry_price);
        position.leg.units * move_per_unit
    }

    fn record(&self) -> PaperAccountRecord {
        PaperAccountRecord {
            balance: self.balance,
            next_id: i64::try_from(self.next_id).unwrap_or(i64::MAX),
            positions: self.positions.iter().map(PaperPosition::record).collect(),
        }
    }

    fn restore(&mut self, record: PaperAccountRecord) {
        self.balance = record.balance;
        self.next_id = u64::try_from(record.next_id).unwrap_or(0);
        self.positions = record.positions.into_iter().map(PaperPosition::from).collect();
    }

    fn check(&self) -> Result<()> {
        if self.failing {
            anyhow::bail!("Paper broker unavailable");
        }
        Ok(())
    }
}

/// Simulated venue for paper accounts and tests.
///
/// With a market file attached, specs and quotes are re-read from it on every
/// `market` call, so an external process can keep prices current. With a
/// ledger attached, cash and positions are loaded before and saved after every
/// call, so separate CLI runs see the same book.
#[derive(Default)]
pub struct PaperBroker {
    book: Mutex<PaperBook>,
    market_file: Option<PathBuf>,
    ledger: Option<(Arc<dyn PaperLedger>, String)>,
    /// Held across load, change and save against the ledger
    io: tokio::sync::Mutex<()>,
}

impl PaperBroker {
    pub fn new(balance: f64) -> Self {
        Self {
            book: Mutex::new(PaperBook {
                balance,
                ..PaperBook::default()
            }),
            ..Self::default()
        }
    }

    /// Keep the book for `bot_id` in `ledger`. A bot without a stored book
    /// starts from the opening balance.
    pub fn with_ledger(mut self, ledger: Arc<dyn PaperLedger>, bot_id: impl Into<String>) -> Self {
        self.ledger = Some((ledger, bot_id.into()));
        self
    }

    async fn load(&self) -> Result<()> {
        let Some((ledger, bot_id)) = &self.ledger else {
            return Ok(());
        };
        let stored = ledger
            .load_paper_account(bot_id)
            .await
            .with_context(|| format!("Failed to load paper account {}", bot_id))?;
        if let Some(record) = stored {
            self.book().restore(record);
        }
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let Some((ledger, bot_id)) = &self.ledger else {
            return Ok(());
        };
        let record = self.book().record();
        ledger
            .save_paper_account(bot_id, &record)
            .await
            .with_context(|| format!("Failed to save paper account {}", bot_id))
    }

    /// Load instrument specs and quotes from a JSON market file on every `market` call.
    pub fn with_market_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.market_file = Some(path.into());
        self
    }

    async fn reload_market_file(&self) -> Result<()> {
        let Some(path) = &self.market_file else {
            return Ok(());
        };
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read market file {}", path.display()))?;
        let market: MarketFile = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse market file {}", path.display()))?;

        let mut book = self.book();
        for (symbol, entry) in market {
            book.markets
                .insert(canonical_symbol(&symbol), (entry.spec, entry.quote));
        }
        Ok(())
    }

    fn book(&self) -> MutexGuard<'_, PaperBook> {
        match self.book.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register or replace an instrument and its quote.
    #[cfg(test)]
    pub fn set_market(&self, symbol: &str, spec: InstrumentSpec, quote: Quote) {
        self.book()
            .markets
            .insert(canonical_symbol(symbol), (spec, quote));
    }

    /// Move the price of a registered instrument.
    #[cfg(test)]
    pub fn set_quote(&self, symbol: &str, quote: Quote) {
        if let Some(entry) = self.book().markets.get_mut(&canonical_symbol(symbol)) {
            entry.1 = quote;
        }
    }

    /// Set the cash balance; equity is balance plus open profit.
    #[cfg(test)]
    pub fn set_equity(&self, balance: f64) {
        self.book().balance = balance;
    }

    /// Make every call fail until cleared.
    #[cfg(test)]
    pub fn set_failing(&self, failing: bool) {
        self.book().failing = failing;
    }

    /// Insert a position directly, as if opened outside the engine.
    #[cfg(test)]
    pub fn seed_position(&self, instrument: &str, units: f64, price: f64, tag: Option<&str>) {
        let mut book = self.book();
        book.next_id += 1;
        let id = book.next_id.to_string();
        book.positions.push(PaperPosition {
            symbol: canonical_symbol(instrument),
            entry_price: price,
            leg: OpenPositionLeg {
                id,
                instrument: instrument.to_string(),
                units,
                unrealized_pnl: 0.0,
                tag: tag.map(str::to_string),
            },
        });
    }

    /// Open positions, marked to market.
    pub fn positions(&self) -> Vec<OpenPositionLeg> {
        let book = self.book();
        book.positions
            .iter()
            .map(|p| OpenPositionLeg {
                unrealized_pnl: book.unrealized(p),
                ..p.leg.clone()
            })
            .collect()
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn account(&self) -> Result<AccountSnapshot> {
        let _io = self.io.lock().await;
        self.book().check()?;
        self.load().await?;
        self.reload_market_file().await?;

        let book = self.book();
        let open_pnl: f64 = book.positions.iter().map(|p| book.unrealized(p)).sum();
        let margin_used: f64 = book
            .positions
            .iter()
            .filter_map(|p| {
                let (spec, quote) = book.markets.get(&p.symbol)?;
                let rate = spec.margin_rate?;
                let mid = quote.mid()?;
                Some(p.leg.units.abs() * book.value_per_unit(&p.symbol, mid) * rate)
            })
            .sum();
        let equity = book.balance + open_pnl;

        Ok(AccountSnapshot {
            equity,
            margin_available: Some(equity - margin_used),
            margin_used: Some(margin_used),
            currency: "USD".to_string(),
        })
    }

    async fn market(&self, symbols: &[String]) -> Result<MarketSnapshot> {
        self.book().check()?;
        self.reload_market_file().await?;

        let book = self.book();
        let mut market = MarketSnapshot::default();
        for symbol in symbols {
            if let Some((spec, quote)) = book.markets.get(&canonical_symbol(symbol)) {
                market.insert(symbol, spec.clone(), *quote);
            }
        }
        Ok(market)
    }

    async fn open_positions(&self) -> Result<Vec<OpenPositionLeg>> {
        let _io = self.io.lock().await;
        self.book().check()?;
        self.load().await?;
        self.reload_market_file().await?;
        Ok(self.positions())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        let _io = self.io.lock().await;
        self.book().check()?;
        self.load().await?;

        let ack = self.fill(order)?;
        self.save().await?;
        Ok(ack)
    }

    async fn close_position(&self, position: &OpenPositionLeg) -> Result<()> {
        let _io = self.io.lock().await;
        self.book().check()?;
        self.load().await?;

        self.settle(position)?;
        self.save().await
    }
}

impl PaperBroker {
    fn fill(&self, order: &OrderRequest) -> Result<OrderAck> {
        let mut book = self.book();
        let symbol = canonical_symbol(&order.symbol);
        let price = book
            .markets
            .get(&symbol)
            .and_then(|(_, quote)| quote.mid())
            .with_context(|| format!("No paper price for {}", order.instrument))?;

        book.next_id += 1;
        let id = book.next_id.to_string();
        book.positions.push(PaperPosition {
            symbol,
            entry_price: price,
            leg: OpenPositionLeg {
                id: id.clone(),
                instrument: order.instrument.clone(),
                units: order.signed_units(),
                unrealized_pnl: 0.0,
                tag: Some(order.client_tag.clone()),
            },
        });
        debug!(
            instrument = %order.instrument,
            units = order.signed_units(),
            price,
            "Paper order filled"
        );

        Ok(OrderAck {
            order_id: Some(id),
            fill_price: Some(price),
        })
    }

    fn settle(&self, position: &OpenPositionLeg) -> Result<()> {
        let mut book = self.book();
        let index = book
            .positions
            .iter()
            .position(|p| p.leg.id == position.id)
            .with_context(|| format!("No paper position {}", position.id))?;
        let closed = book.positions.remove(index);
        let realized = book.unrealized(&closed);
        book.balance += realized;
        debug!(id = %closed.leg.id, realized, "Paper position closed");
        Ok(())
    }
}
