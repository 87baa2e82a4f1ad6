//! Weekly cycle for one account: reset, wait, enter, trail, close.
//!
//! Each tick reads the persisted state once and writes it once. Errors from
//! external calls abort the tick with the state left as last persisted; the
//! scheduler logs them and tries again on the next tick.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::alignment::SignalAligner;
use super::config::AccountConfig;
use super::position_sizer::PositionSizer;
use super::trailing::{TrailDecision, TrailingStopController};
use super::week::{Clock, WeekWindow};
use crate::api::{Broker, SignalFeed};
use crate::db::StateStore;
use crate::models::{
    AccountSnapshot, AccountState, Direction, EntrySnapshot, ManagedLeg, OpenPositionLeg,
};

/// What a tick did, for logs and the CLI.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Outside the holding window; `closed` positions were flattened.
    OutsideWindow { closed: usize },
    /// Signals did not justify an entry.
    Rejected { reason: String },
    Entered {
        direction: Direction,
        legs: usize,
        dry_run: bool,
    },
    /// Open positions found without local state were taken over.
    Adopted { positions: usize },
    Monitoring {
        unlevered_pct: f64,
        locked_pct: Option<f64>,
    },
    TrailHit {
        unlevered_pct: f64,
        locked_pct: f64,
        closed: usize,
    },
    /// Already exited this week; waiting for the next one.
    ClosedForWeek { closed: usize },
    /// Invalid external data; nothing dependent on it was computed.
    Skipped { reason: String },
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickOutcome::OutsideWindow { closed } => {
                write!(f, "outside trading window ({} closed)", closed)
            }
            TickOutcome::Rejected { reason } => write!(f, "not aligned: {}", reason),
            TickOutcome::Entered {
                direction,
                legs,
                dry_run,
            } => {
                let mode = if *dry_run { " [dry run]" } else { "" };
                write!(f, "entered {} with {} legs{}", direction, legs, mode)
            }
            TickOutcome::Adopted { positions } => {
                write!(f, "adopted {} open positions", positions)
            }
            TickOutcome::Monitoring {
                unlevered_pct,
                locked_pct,
            } => match locked_pct {
                Some(lock) => write!(f, "monitoring {:+.2}% (lock {:.2}%)", unlevered_pct, lock),
                None => write!(f, "monitoring {:+.2}%", unlevered_pct),
            },
            TickOutcome::TrailHit {
                unlevered_pct,
                locked_pct,
                closed,
            } => write!(
                f,
                "trailing stop hit at {:+.2}% (lock {:.2}%, {} closed)",
                unlevered_pct, locked_pct, closed
            ),
            TickOutcome::ClosedForWeek { closed } => {
                write!(f, "closed for the week ({} closed)", closed)
            }
            TickOutcome::Skipped { reason } => write!(f, "skipped: {}", reason),
        }
    }
}

/// Drives one account through its trading week.
pub struct WeeklyStateMachine {
    config: AccountConfig,
    broker: Arc<dyn Broker>,
    feed: Arc<dyn SignalFeed>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    aligner: SignalAligner,
    sizer: PositionSizer,
    trail: TrailingStopController,
}

impl WeeklyStateMachine {
    pub fn new(
        config: AccountConfig,
        broker: Arc<dyn Broker>,
        feed: Arc<dyn SignalFeed>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let aligner = SignalAligner::new(&config.basket);
        let sizer = PositionSizer::new(config.sizing.clone());
        let trail = TrailingStopController::new(config.trail);
        Self {
            config,
            broker,
            feed,
            store,
            clock,
            aligner,
            sizer,
            trail,
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.config.bot_id
    }

    /// Run one tick.
    pub async fn tick(&self) -> Result<TickOutcome> {
        let now = self.clock.now();
        let window = WeekWindow::containing(now, self.config.window_hours)?;
        let mut state = self
            .store
            .read_state(self.bot_id())
            .await?
            .unwrap_or_default();

        let account = match self.broker.account().await {
            Ok(account) => {
                if let Some(equity) = account.valid_equity() {
                    state.current_equity = Some(equity);
                }
                Some(account)
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Failed to fetch current equity");
                None
            }
        };

        let was_entered = state.entered;
        if state.roll_week(&window.week_id) {
            info!(week_id = %window.week_id, "New week detected, state reset");
            self.store
                .record_event(self.bot_id(), "week_reset", &window.week_id)
                .await?;
            if was_entered {
                let closed = self.close_managed().await?;
                if closed > 0 {
                    info!(closed, "Closed positions carried over from the previous week");
                }
            }
        }

        if !window.contains(now) {
            let closed = self.close_managed().await?;
            if closed > 0 {
                info!(closed, "Week closed, positions closed");
                self.store
                    .record_event(self.bot_id(), "week_close", &format!("closed={}", closed))
                    .await?;
            }
            self.store.write_state(self.bot_id(), &state).await?;
            return Ok(TickOutcome::OutsideWindow { closed });
        }

        let outcome = if state.entered {
            self.monitor(&mut state, account.as_ref(), now).await?
        } else if state.trail_hit_at.is_some() {
            let closed = self.close_managed().await?;
            if closed > 0 {
                warn!(closed, "Positions still open after trailing exit; closed again");
            }
            TickOutcome::ClosedForWeek { closed }
        } else {
            let managed = self.managed_positions().await?;
            if managed.is_empty() {
                self.try_enter(&mut state, account, now).await?
            } else {
                self.adopt(&mut state, &managed, account.as_ref(), now).await?
            }
        };

        self.store.write_state(self.bot_id(), &state).await?;
        Ok(outcome)
    }

    /// Positions at the broker carrying this account's tag prefix.
    pub async fn managed_positions(&self) -> Result<Vec<ManagedLeg>> {
        let positions = self
            .broker
            .open_positions()
            .await
            .context("Failed to fetch open positions")?;
        Ok(positions
            .iter()
            .filter_map(|p| ManagedLeg::from_position(p, &self.config.tag_prefix))
            .collect())
    }

    /// Flatten every managed position. Returns how many were closed.
    async fn close_managed(&self) -> Result<usize> {
        let managed = self.managed_positions().await?;
        if managed.is_empty() {
            return Ok(0);
        }
        if !self.config.trading_enabled {
            info!(
                positions = managed.len(),
                "[DRY RUN] Would close managed positions"
            );
            return Ok(0);
        }

        // Attempt every leg so one rejected close does not keep the rest open
        let results = join_all(managed.iter().map(|leg| async move {
            self.broker
                .close_position(&leg.position)
                .await
                .with_context(|| format!("Failed to close {} ({})", leg.key, leg.position.id))?;
            info!(key = %leg.key, units = leg.position.units, "Closed position");
            Ok::<_, anyhow::Error>(())
        }))
        .await;

        let mut failures = results.into_iter().filter_map(Result::err).collect::<Vec<_>>();
        match failures.len() {
            0 => Ok(managed.len()),
            1 => Err(failures.remove(0)),
            n => Err(failures
                .remove(0)
                .context(format!("{} of {} closes failed", n, managed.len()))),
        }
    }

    async fn try_enter(
        &self,
        state: &mut AccountState,
        account: Option<AccountSnapshot>,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        let snapshot = self
            .feed
            .latest(&self.config.basket.asset)
            .await
            .context("Failed to fetch signals")?;
        if !snapshot.trading_allowed {
            let reason = format!(
                "trading not allowed: {}",
                snapshot.reason.as_deref().unwrap_or("stale signals")
            );
            info!(reason = %reason, "Signals not tradable");
            return Ok(TickOutcome::Rejected { reason });
        }

        let signals = snapshot.tradable();
        let alignment = self.aligner.align(signals);
        let (true, Some(direction)) = (alignment.ok, alignment.direction) else {
            let reason = alignment
                .reason
                .unwrap_or_else(|| "No aligned direction".to_string());
            info!(reason = %reason, "Signals not aligned");
            return Ok(TickOutcome::Rejected { reason });
        };

        let pairs = self.sizer.plan(&self.config.basket, signals, direction);
        let symbols: Vec<String> = pairs.iter().map(|p| p.symbol.clone()).collect();
        let account = match account {
            Some(account) => account,
            None => self
                .broker
                .account()
                .await
                .context("Failed to fetch account")?,
        };
        let market = self
            .broker
            .market(&symbols)
            .await
            .context("Failed to fetch market snapshot")?;
        let plan = self
            .sizer
            .size(&account, &pairs, &market)
            .context("Sizing failed")?;
        if plan.skipped > 0 {
            warn!(
                skipped = plan.skipped,
                "Skipped instruments (missing price/spec/FX conversion)"
            );
        }

        let orders = plan.orders(&self.config.tag_prefix);
        let dry_run = !self.config.trading_enabled;
        if dry_run {
            info!(
                orders = orders.len(),
                scale = plan.scale,
                margin = plan.total_margin,
                "[DRY RUN] Would place orders"
            );
        } else {
            for order in &orders {
                self.broker
                    .place_order(order)
                    .await
                    .with_context(|| format!("Failed to place order on {}", order.instrument))?;
                debug!(
                    instrument = %order.instrument,
                    side = %order.direction,
                    units = %order.units_string(),
                    tag = %order.client_tag,
                    "Order placed"
                );
            }
        }

        state.record_entry(direction, plan.entry_snapshot(now));
        info!(
            direction = %direction,
            equity = plan.equity,
            legs = orders.len(),
            scale = plan.scale,
            "Entered positions"
        );
        self.store
            .record_event(
                self.bot_id(),
                "entered",
                &format!("direction={} legs={} dry_run={}", direction, orders.len(), dry_run),
            )
            .await?;

        Ok(TickOutcome::Entered {
            direction,
            legs: orders.len(),
            dry_run,
        })
    }

    /// Mark the account entered from positions that already exist at the broker.
    async fn adopt(
        &self,
        state: &mut AccountState,
        managed: &[ManagedLeg],
        account: Option<&AccountSnapshot>,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        let Some(equity) = account.and_then(AccountSnapshot::valid_equity) else {
            warn!("Open positions without state but equity is invalid; not adopting yet");
            return Ok(TickOutcome::Skipped {
                reason: "invalid equity".to_string(),
            });
        };

        let mut net_units: BTreeMap<String, f64> = BTreeMap::new();
        for leg in managed {
            *net_units.entry(leg.key.symbol.clone()).or_default() += leg.position.units;
        }
        let symbols: Vec<String> = net_units.keys().cloned().collect();
        let market = self
            .broker
            .market(&symbols)
            .await
            .context("Failed to fetch market snapshot")?;

        let mut entry = EntrySnapshot {
            time: now,
            equity,
            prices: BTreeMap::new(),
            notional: BTreeMap::new(),
            directions: BTreeMap::new(),
        };
        let mut signed_notional = 0.0;
        for (symbol, units) in &net_units {
            let direction = Direction::from_units(*units);
            if !direction.is_directional() {
                continue;
            }
            let (Some(price), Some(npu)) = (market.mid(symbol), market.notional_per_unit(symbol))
            else {
                warn!(symbol = %symbol, "No price for open position; not adopting yet");
                return Ok(TickOutcome::Skipped {
                    reason: format!("no price for {}", symbol),
                });
            };
            let notional = units.abs() * npu;
            signed_notional += notional * direction.signum();
            entry.prices.insert(symbol.clone(), price);
            entry.notional.insert(symbol.clone(), notional);
            entry.directions.insert(symbol.clone(), direction);
        }

        let direction = if signed_notional < 0.0 {
            Direction::Short
        } else {
            Direction::Long
        };
        state.adopt_open_positions(direction, entry);
        info!(
            positions = managed.len(),
            direction = %direction,
            "Detected open positions without state; marking entered"
        );
        self.store
            .record_event(
                self.bot_id(),
                "adopted",
                &format!("positions={}", managed.len()),
            )
            .await?;
        Ok(TickOutcome::Adopted {
            positions: managed.len(),
        })
    }

    async fn monitor(
        &self,
        state: &mut AccountState,
        account: Option<&AccountSnapshot>,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        let Some(equity) = account.and_then(AccountSnapshot::valid_equity) else {
            warn!("Invalid equity; skipping trailing update");
            return Ok(TickOutcome::Skipped {
                reason: "invalid equity".to_string(),
            });
        };
        state.observe_equity(equity);

        let Some(entry) = state.entry.clone() else {
            warn!("Entered without an entry snapshot; skipping trailing update");
            return Ok(TickOutcome::Skipped {
                reason: "missing entry snapshot".to_string(),
            });
        };

        if entry.notional.is_empty() {
            debug!("Basket fully hedged; nothing to trail");
            return Ok(TickOutcome::Monitoring {
                unlevered_pct: 0.0,
                locked_pct: state.locked_pct,
            });
        }

        let symbols: Vec<String> = entry.prices.keys().cloned().collect();
        let market = self
            .broker
            .market(&symbols)
            .await
            .context("Failed to fetch market snapshot")?;
        let prices: HashMap<String, f64> = symbols
            .iter()
            .filter_map(|s| market.mid(s).map(|mid| (s.clone(), mid)))
            .collect();

        let basket_direction = state.last_direction.unwrap_or(Direction::Long);
        let Some(unlevered_pct) =
            TrailingStopController::unlevered_pct(&entry, basket_direction, &prices)
        else {
            warn!("Invalid prices; skipping trailing update");
            return Ok(TickOutcome::Skipped {
                reason: "invalid prices".to_string(),
            });
        };

        match self.trail.update(state, unlevered_pct) {
            TrailDecision::Hold => {
                debug!(
                    unlevered_pct,
                    locked_pct = ?state.locked_pct,
                    trailing_active = state.trailing_active,
                    "Trail updated"
                );
                Ok(TickOutcome::Monitoring {
                    unlevered_pct,
                    locked_pct: state.locked_pct,
                })
            }
            TrailDecision::Close {
                unlevered_pct,
                locked_pct,
            } => {
                info!(
                    locked_pct,
                    profit_pct = unlevered_pct,
                    "Trailing stop hit, closing positions"
                );
                let closed = self.close_managed().await?;
                state.record_exit(now);
                self.store
                    .record_event(
                        self.bot_id(),
                        "trail_hit",
                        &format!("pct={:.4} lock={:.4} closed={}", unlevered_pct, locked_pct, closed),
                    )
                    .await?;
                Ok(TickOutcome::TrailHit {
                    unlevered_pct,
                    locked_pct,
                    closed,
                })
            }
        }
    }
}

/// Positions not recognised as managed by `prefix`.
pub fn unmanaged_positions<'a>(
    positions: &'a [OpenPositionLeg],
    prefix: &str,
) -> Vec<&'a OpenPositionLeg> {
    positions
        .iter()
        .filter(|p| p.is_open() && ManagedLeg::from_position(p, prefix).is_none())
        .collect()
}
