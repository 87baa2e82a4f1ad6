//! Read-only drift report: what should be open now versus what the broker holds.
//!
//! The intended leg set is recomputed from live signals and sizing, never from
//! persisted state. Nothing here places, closes or persists anything.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::alignment::{AlignmentResult, SignalAligner};
use super::config::AccountConfig;
use super::position_sizer::{PositionSizer, SizingError, SizingPlan};
use super::state_machine::unmanaged_positions;
use crate::api::{Broker, SignalFeed};
use crate::models::{
    canonical_symbol, Direction, LegKey, ManagedLeg, OpenPositionLeg, SignalModel,
};

pub const DEFAULT_REPORT_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("signal feed failed: {0:#}")]
    Feed(anyhow::Error),

    #[error("broker request failed: {0:#}")]
    Broker(anyhow::Error),

    #[error("sizing failed: {0}")]
    Sizing(#[from] SizingError),
}

/// Band within which an open quantity counts as matching.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Tolerance {
    pub pct: f64,
    pub min_units: f64,
}

impl Tolerance {
    /// `max(min_units, expected x pct)`
    pub fn band(&self, expected_units: f64) -> f64 {
        self.min_units.max(expected_units.abs() * self.pct)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    /// Cap on each listed diff section
    pub limit: usize,
    /// Report positions without a readable tag as extras
    pub include_unmanaged: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_REPORT_LIMIT,
            include_unmanaged: false,
        }
    }
}

/// A leg the engine intends to hold right now.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedLeg {
    pub key: LegKey,
    /// Zero when the leg is unavailable or scaled away
    pub expected_units: f64,
}

impl ExpectedLeg {
    pub fn from_plan(plan: &SizingPlan) -> Vec<Self> {
        plan.rows
            .iter()
            .map(|row| ExpectedLeg {
                key: LegKey::new(&row.symbol, row.model, row.direction),
                expected_units: if row.is_tradable() { row.units } else { 0.0 },
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingLeg {
    pub key: String,
    pub symbol: String,
    pub model: SignalModel,
    pub direction: Direction,
    pub expected_units: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtraLeg {
    pub key: String,
    pub symbol: String,
    /// `None` for unmanaged positions
    pub model: Option<SignalModel>,
    pub direction: Direction,
    pub open_units: f64,
    pub open_trades: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MismatchedLeg {
    pub key: String,
    pub symbol: String,
    pub model: SignalModel,
    pub direction: Direction,
    pub expected_units: f64,
    pub open_units: f64,
    pub diff: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PlannedOpen {
    pub planned: f64,
    pub open: f64,
}

/// Per-symbol exposure summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolRollup {
    pub symbol: String,
    pub gross: PlannedOpen,
    pub net: PlannedOpen,
    pub missing_legs: usize,
}

/// Full, uncapped comparison of intended and open legs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegDiff {
    pub missing: Vec<MissingLeg>,
    pub extra: Vec<ExtraLeg>,
    pub mismatched: Vec<MismatchedLeg>,
    pub symbols: Vec<SymbolRollup>,
    pub unique_open_keys: usize,
}

#[derive(Debug, Default)]
struct OpenGroup {
    abs_units: f64,
    count: usize,
}

#[derive(Debug, Default)]
struct SymbolTotals {
    planned_long: f64,
    planned_short: f64,
    open_long: f64,
    open_short: f64,
    missing_legs: usize,
}

/// Compare intended legs against managed broker positions. Pure.
pub fn diff_legs(expected: &[ExpectedLeg], managed: &[ManagedLeg], tolerance: Tolerance) -> LegDiff {
    let mut open_by_key: BTreeMap<LegKey, OpenGroup> = BTreeMap::new();
    for leg in managed {
        let group = open_by_key.entry(leg.key.clone()).or_default();
        group.abs_units += leg.position.abs_units();
        group.count += 1;
    }

    let expected_keys: BTreeMap<&LegKey, f64> = expected
        .iter()
        .map(|leg| (&leg.key, leg.expected_units))
        .collect();

    let mut diff = LegDiff {
        unique_open_keys: open_by_key.len(),
        ..LegDiff::default()
    };
    let mut totals: BTreeMap<String, SymbolTotals> = BTreeMap::new();

    for leg in expected {
        let row = totals.entry(leg.key.symbol.clone()).or_default();
        match leg.key.direction {
            Direction::Long => row.planned_long += leg.expected_units,
            Direction::Short => row.planned_short += leg.expected_units,
            Direction::Neutral => {}
        }
        if leg.expected_units <= 0.0 {
            continue;
        }

        match open_by_key.get(&leg.key) {
            None => {
                row.missing_legs += 1;
                diff.missing.push(MissingLeg {
                    key: leg.key.to_string(),
                    symbol: leg.key.symbol.clone(),
                    model: leg.key.model,
                    direction: leg.key.direction,
                    expected_units: leg.expected_units,
                });
            }
            Some(open) => {
                let gap = (open.abs_units - leg.expected_units).abs();
                if gap > tolerance.band(leg.expected_units) {
                    diff.mismatched.push(MismatchedLeg {
                        key: leg.key.to_string(),
                        symbol: leg.key.symbol.clone(),
                        model: leg.key.model,
                        direction: leg.key.direction,
                        expected_units: leg.expected_units,
                        open_units: open.abs_units,
                        diff: gap,
                    });
                }
            }
        }
    }

    for (key, open) in &open_by_key {
        let row = totals.entry(key.symbol.clone()).or_default();
        match key.direction {
            Direction::Long => row.open_long += open.abs_units,
            Direction::Short => row.open_short += open.abs_units,
            Direction::Neutral => {}
        }
        if !expected_keys.contains_key(key) {
            diff.extra.push(ExtraLeg {
                key: key.to_string(),
                symbol: key.symbol.clone(),
                model: Some(key.model),
                direction: key.direction,
                open_units: open.abs_units,
                open_trades: open.count,
            });
        }
    }

    diff.symbols = totals
        .into_iter()
        .map(|(symbol, row)| SymbolRollup {
            symbol,
            gross: PlannedOpen {
                planned: row.planned_long + row.planned_short,
                open: row.open_long + row.open_short,
            },
            net: PlannedOpen {
                planned: row.planned_long - row.planned_short,
                open: row.open_long - row.open_short,
            },
            missing_legs: row.missing_legs,
        })
        .collect();
    diff
}

// ==================== Report ====================

#[derive(Debug, Clone, Serialize)]
pub struct ReportConfig {
    pub margin_buffer: Option<f64>,
    pub tolerance: Tolerance,
}

#[derive(Debug, Clone, Serialize)]
pub struct SizingSummary {
    pub nav: f64,
    pub margin_available: Option<f64>,
    pub margin_used: Option<f64>,
    pub scale: f64,
    pub total_margin: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedSummary {
    pub legs: usize,
    pub tradable_legs: usize,
    pub symbols: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenSummary {
    pub managed_positions: usize,
    pub unique_leg_keys: usize,
    pub unmanaged_positions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiffSection {
    pub missing_count: usize,
    pub extra_count: usize,
    pub mismatched_count: usize,
    pub missing: Vec<MissingLeg>,
    pub extra: Vec<ExtraLeg>,
    pub mismatched: Vec<MismatchedLeg>,
}

/// Point-in-time reconcile payload.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub ok: bool,
    pub bot_id: String,
    pub fetched_at: DateTime<Utc>,
    pub alignment: AlignmentResult,
    pub config: ReportConfig,
    pub sizing: SizingSummary,
    pub planned: PlannedSummary,
    pub open: OpenSummary,
    pub diff: DiffSection,
    pub symbols: Vec<SymbolRollup>,
}

/// Recomputes the intended basket and diffs it against the broker.
pub struct Reconciler {
    config: AccountConfig,
    broker: Arc<dyn Broker>,
    feed: Arc<dyn SignalFeed>,
    aligner: SignalAligner,
    sizer: PositionSizer,
}

impl Reconciler {
    pub fn new(config: AccountConfig, broker: Arc<dyn Broker>, feed: Arc<dyn SignalFeed>) -> Self {
        let aligner = SignalAligner::new(&config.basket);
        let sizer = PositionSizer::new(config.sizing.clone());
        Self {
            config,
            broker,
            feed,
            aligner,
            sizer,
        }
    }

    fn tolerance(&self) -> Tolerance {
        Tolerance {
            pct: self.config.reconcile_tolerance_pct,
            min_units: self.config.reconcile_min_units,
        }
    }

    pub async fn reconcile(
        &self,
        options: ReconcileOptions,
    ) -> Result<ReconcileReport, ReconcileError> {
        let (snapshot, account, positions) = tokio::try_join!(
            async {
                self.feed
                    .latest(&self.config.basket.asset)
                    .await
                    .map_err(ReconcileError::Feed)
            },
            async { self.broker.account().await.map_err(ReconcileError::Broker) },
            async {
                self.broker
                    .open_positions()
                    .await
                    .map_err(ReconcileError::Broker)
            },
        )?;

        let signals = snapshot.tradable();
        let alignment = if snapshot.trading_allowed {
            self.aligner.align(signals)
        } else {
            AlignmentResult::rejected(format!(
                "trading not allowed: {}",
                snapshot.reason.as_deref().unwrap_or("stale signals")
            ))
        };

        let plan = match alignment.direction {
            Some(direction) if alignment.ok => {
                let pairs = self.sizer.plan(&self.config.basket, signals, direction);
                let symbols: Vec<String> = pairs.iter().map(|p| p.symbol.clone()).collect();
                let market = self
                    .broker
                    .market(&symbols)
                    .await
                    .map_err(ReconcileError::Broker)?;
                Some(self.sizer.size(&account, &pairs, &market)?)
            }
            _ => None,
        };

        let expected = plan.as_ref().map(ExpectedLeg::from_plan).unwrap_or_default();
        let managed: Vec<ManagedLeg> = positions
            .iter()
            .filter_map(|p| ManagedLeg::from_position(p, &self.config.tag_prefix))
            .collect();
        let unmanaged = unmanaged_positions(&positions, &self.config.tag_prefix);

        let mut diff = diff_legs(&expected, &managed, self.tolerance());
        if options.include_unmanaged {
            diff.extra.extend(unmanaged.iter().map(|p| unmanaged_extra(p)));
        }

        let planned_symbols: BTreeSet<&str> =
            expected.iter().map(|leg| leg.key.symbol.as_str()).collect();
        let sizing = match &plan {
            Some(plan) => SizingSummary {
                nav: plan.equity,
                margin_available: plan.margin_available,
                margin_used: plan.margin_used,
                scale: plan.scale,
                total_margin: plan.total_margin,
            },
            None => SizingSummary {
                nav: account.equity,
                margin_available: account.margin_available,
                margin_used: account.margin_used,
                scale: 1.0,
                total_margin: 0.0,
            },
        };

        let limit = options.limit;
        Ok(ReconcileReport {
            ok: true,
            bot_id: self.config.bot_id.clone(),
            fetched_at: Utc::now(),
            alignment,
            config: ReportConfig {
                margin_buffer: self.config.sizing.margin_buffer(),
                tolerance: self.tolerance(),
            },
            sizing,
            planned: PlannedSummary {
                legs: expected.len(),
                tradable_legs: expected.iter().filter(|l| l.expected_units > 0.0).count(),
                symbols: planned_symbols.len(),
            },
            open: OpenSummary {
                managed_positions: managed.len(),
                unique_leg_keys: diff.unique_open_keys,
                unmanaged_positions: unmanaged.len(),
            },
            diff: DiffSection {
                missing_count: diff.missing.len(),
                extra_count: diff.extra.len(),
                mismatched_count: diff.mismatched.len(),
                missing: diff.missing.into_iter().take(limit).collect(),
                extra: diff.extra.into_iter().take(limit).collect(),
                mismatched: diff.mismatched.into_iter().take(limit).collect(),
            },
            symbols: diff.symbols,
        })
    }
}

fn unmanaged_extra(position: &OpenPositionLeg) -> ExtraLeg {
    let symbol = canonical_symbol(&position.instrument);
    let direction = position.direction();
    ExtraLeg {
        key: format!("{}:unmanaged:{}", symbol, direction),
        symbol,
        model: None,
        direction,
        open_units: position.abs_units(),
        open_trades: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PaperBroker, StaticSignalFeed};
    use crate::models::{AssetClass, BasketSignal, InstrumentSpec, Quote, SignalSnapshot};
    use crate::trading::config::{
        AlignmentMode, BasketDefinition, MarginBasis, SizingRegime, TrailConfig,
    };

    const TOLERANCE: Tolerance = Tolerance {
        pct: 0.01,
        min_units: 1.0,
    };

    fn managed(symbol: &str, model: SignalModel, units: f64, id: &str) -> ManagedLeg {
        let position = OpenPositionLeg {
            id: id.to_string(),
            instrument: symbol.to_string(),
            units,
            unrealized_pnl: 0.0,
            tag: Some(format!("uni-{}-{}-{}", symbol, model, id)),
        };
        ManagedLeg::from_position(&position, "uni").unwrap()
    }

    fn expected(symbol: &str, model: SignalModel, direction: Direction, units: f64) -> ExpectedLeg {
        ExpectedLeg {
            key: LegKey::new(symbol, model, direction),
            expected_units: units,
        }
    }

    #[test]
    fn test_shortfall_beyond_band_is_mismatched() {
        let diff = diff_legs(
            &[expected("EURUSD", SignalModel::Dealer, Direction::Long, 1000.0)],
            &[managed("EURUSD", SignalModel::Dealer, 970.0, "1")],
            TOLERANCE,
        );
        assert!(diff.missing.is_empty());
        assert!(diff.extra.is_empty());
        assert_eq!(diff.mismatched.len(), 1);
        let leg = &diff.mismatched[0];
        assert_eq!(leg.key, "EURUSD:dealer:LONG");
        assert_eq!(leg.expected_units, 1000.0);
        assert_eq!(leg.open_units, 970.0);
        assert_eq!(leg.diff, 30.0);
    }

    #[test]
    fn test_within_band_is_not_flagged() {
        let diff = diff_legs(
            &[expected("EURUSD", SignalModel::Dealer, Direction::Long, 1000.0)],
            &[managed("EURUSD", SignalModel::Dealer, 992.0, "1")],
            TOLERANCE,
        );
        assert!(diff.mismatched.is_empty());

        // Small legs fall back to the absolute minimum
        let diff = diff_legs(
            &[expected("EURUSD", SignalModel::Dealer, Direction::Long, 20.0)],
            &[managed("EURUSD", SignalModel::Dealer, 19.0, "1")],
            TOLERANCE,
        );
        assert!(diff.mismatched.is_empty());
    }

    #[test]
    fn test_missing_extra_and_direction_are_part_of_identity() {
        let diff = diff_legs(
            &[
                expected("EURUSD", SignalModel::Dealer, Direction::Long, 1000.0),
                expected("GBPUSD", SignalModel::Commercial, Direction::Short, 500.0),
                expected("USDJPY", SignalModel::Sentiment, Direction::Long, 0.0),
            ],
            &[
                // Opposite direction from the plan
                managed("EURUSD", SignalModel::Dealer, -1000.0, "1"),
                managed("GBPUSD", SignalModel::Commercial, -300.0, "2"),
                managed("GBPUSD", SignalModel::Commercial, -200.0, "3"),
            ],
            TOLERANCE,
        );

        assert_eq!(diff.missing.len(), 1);
        assert_eq!(diff.missing[0].key, "EURUSD:dealer:LONG");
        assert_eq!(diff.extra.len(), 1);
        assert_eq!(diff.extra[0].key, "EURUSD:dealer:SHORT");
        assert_eq!(diff.extra[0].open_trades, 1);
        // Two GBPUSD trades sum to the expected 500
        assert!(diff.mismatched.is_empty());
        assert_eq!(diff.unique_open_keys, 2);
    }

    #[test]
    fn test_symbol_rollup_gross_and_net() {
        let diff = diff_legs(
            &[
                expected("EURUSD", SignalModel::Dealer, Direction::Long, 1000.0),
                expected("EURUSD", SignalModel::Sentiment, Direction::Short, 400.0),
                expected("AUDUSD", SignalModel::Dealer, Direction::Long, 300.0),
            ],
            &[
                managed("EURUSD", SignalModel::Dealer, 1000.0, "1"),
                managed("NZDUSD", SignalModel::Blended, -50.0, "2"),
            ],
            TOLERANCE,
        );

        let symbols: Vec<&str> = diff.symbols.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(symbols, ["AUDUSD", "EURUSD", "NZDUSD"]);

        let eur = &diff.symbols[1];
        assert_eq!(eur.gross, PlannedOpen { planned: 1400.0, open: 1000.0 });
        assert_eq!(eur.net, PlannedOpen { planned: 600.0, open: 1000.0 });
        assert_eq!(eur.missing_legs, 1);

        let nzd = &diff.symbols[2];
        assert_eq!(nzd.net, PlannedOpen { planned: 0.0, open: -50.0 });
    }

    fn universal_config() -> AccountConfig {
        AccountConfig {
            bot_id: "oanda_universal_bot".to_string(),
            basket: BasketDefinition {
                symbols: Vec::new(),
                models: SignalModel::UNIVERSAL.to_vec(),
                asset: "fx".to_string(),
                alignment: AlignmentMode::Independent,
            },
            sizing: SizingRegime::MarginConstrained {
                margin_buffer: 0.1,
                margin_basis: MarginBasis::Net,
            },
            trail: TrailConfig::default(),
            tag_prefix: "uni".to_string(),
            trading_enabled: true,
            window_hours: 168,
            reconcile_tolerance_pct: 0.01,
            reconcile_min_units: 1.0,
        }
    }

    fn fx_broker() -> Arc<PaperBroker> {
        let broker = Arc::new(PaperBroker::new(10_000.0));
        broker.set_market("EURUSD", InstrumentSpec::unit("EUR_USD", 0, 0.02), Quote::last(1.25));
        broker.set_market("GBPUSD", InstrumentSpec::unit("GBP_USD", 0, 0.02), Quote::last(1.25));
        broker
    }

    fn fx_feed() -> Arc<StaticSignalFeed> {
        Arc::new(StaticSignalFeed::new(SignalSnapshot::new(vec![
            BasketSignal::new("EURUSD", Direction::Long, SignalModel::Dealer, AssetClass::Fx),
            BasketSignal::new("GBPUSD", Direction::Short, SignalModel::Commercial, AssetClass::Fx),
        ])))
    }

    #[tokio::test]
    async fn test_reconcile_against_paper_broker() {
        let broker = fx_broker();
        // 10k equity / 1.25 = 8000 units per leg, margin fits comfortably
        broker.seed_position("EUR_USD", 8000.0, 1.25, Some("uni-EURUSD-dealer-aa"));
        broker.seed_position("USD_JPY", -100.0, 150.0, Some("uni-USDJPY-blended-bb"));
        broker.seed_position("EUR_USD", 10.0, 1.25, Some("manual trade"));

        let reconciler = Reconciler::new(universal_config(), broker.clone(), fx_feed());
        let report = reconciler.reconcile(ReconcileOptions::default()).await.unwrap();

        assert!(report.ok);
        assert!(report.alignment.ok);
        assert_eq!(report.planned.legs, 2);
        assert_eq!(report.planned.tradable_legs, 2);
        assert_eq!(report.planned.symbols, 2);
        assert_eq!(report.sizing.scale, 1.0);
        assert_eq!(report.open.managed_positions, 2);
        assert_eq!(report.open.unmanaged_positions, 1);

        assert_eq!(report.diff.missing_count, 1);
        assert_eq!(report.diff.missing[0].key, "GBPUSD:commercial:SHORT");
        assert_eq!(report.diff.extra_count, 1);
        assert_eq!(report.diff.extra[0].key, "USDJPY:blended:SHORT");
        assert_eq!(report.diff.mismatched_count, 0);

        // Read-only
        assert_eq!(broker.positions().len(), 3);
    }

    #[tokio::test]
    async fn test_include_unmanaged_and_limit() {
        let broker = fx_broker();
        broker.seed_position("EUR_USD", 10.0, 1.25, None);
        broker.seed_position("GBP_USD", -10.0, 1.25, Some("someone-else"));

        let reconciler = Reconciler::new(universal_config(), broker, fx_feed());
        let report = reconciler
            .reconcile(ReconcileOptions {
                limit: 1,
                include_unmanaged: true,
            })
            .await
            .unwrap();

        assert_eq!(report.diff.extra_count, 2);
        assert_eq!(report.diff.extra.len(), 1);
        assert_eq!(report.diff.extra[0].model, None);
        assert_eq!(report.diff.missing_count, 2);
        assert_eq!(report.diff.missing.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_alignment_expects_nothing_open() {
        let broker = fx_broker();
        broker.seed_position("EUR_USD", 8000.0, 1.25, Some("uni-EURUSD-dealer-aa"));
        let feed = Arc::new(StaticSignalFeed::new(SignalSnapshot {
            pairs: Vec::new(),
            trading_allowed: false,
            reason: Some("COT data stale".to_string()),
        }));

        let reconciler = Reconciler::new(universal_config(), broker, feed);
        let report = reconciler.reconcile(ReconcileOptions::default()).await.unwrap();
        assert!(!report.alignment.ok);
        assert_eq!(report.planned.legs, 0);
        assert_eq!(report.diff.extra_count, 1);
        assert_eq!(report.sizing.nav, 10_000.0);
    }

    #[tokio::test]
    async fn test_broker_failure_is_structured() {
        let broker = fx_broker();
        broker.set_failing(true);
        let reconciler = Reconciler::new(universal_config(), broker, fx_feed());
        let err = reconciler
            .reconcile(ReconcileOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Broker(_)));
    }
}
