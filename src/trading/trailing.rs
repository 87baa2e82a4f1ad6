//! Unlevered profit trail with a one-way lock.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::config::TrailConfig;
use crate::models::{finite_positive, AccountState, Direction, EntrySnapshot};

/// What the monitoring tick should do after a trail update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TrailDecision {
    Hold,
    Close { unlevered_pct: f64, locked_pct: f64 },
}

#[derive(Debug, Clone)]
pub struct TrailingStopController {
    config: TrailConfig,
}

impl TrailingStopController {
    pub fn new(config: TrailConfig) -> Self {
        Self { config }
    }

    /// Notional-weighted percent move of the entry legs, signed by direction.
    ///
    /// Returns `None` when any entry symbol lacks a valid current price or the
    /// entry has no notional; the caller skips the trail update in that case.
    pub fn unlevered_pct(
        entry: &EntrySnapshot,
        basket_direction: Direction,
        prices: &HashMap<String, f64>,
    ) -> Option<f64> {
        let total = finite_positive(entry.total_notional())?;
        let mut weighted = 0.0;
        for (symbol, entry_price) in &entry.prices {
            let entry_price = finite_positive(*entry_price)?;
            let current = prices.get(symbol).copied().and_then(finite_positive)?;
            let direction = entry.direction_for(symbol, basket_direction).signum();
            let pct = (current - entry_price) / entry_price * 100.0 * direction;
            let weight = entry.notional.get(symbol).copied().unwrap_or(0.0);
            weighted += pct * (weight / total);
        }
        weighted.is_finite().then_some(weighted)
    }

    /// Advance the trail with this tick's unlevered move.
    pub fn update(&self, state: &mut AccountState, unlevered_pct: f64) -> TrailDecision {
        let TrailConfig {
            start_pct,
            offset_pct,
        } = self.config;
        state.last_unlevered_pct = Some(unlevered_pct);

        if unlevered_pct > 0.0 && state.peak_unlevered_pct.map_or(true, |peak| unlevered_pct > peak) {
            state.peak_unlevered_pct = Some(unlevered_pct);
        }

        if unlevered_pct >= start_pct {
            state.trailing_active = true;
            let peak = state.peak_unlevered_pct.unwrap_or(unlevered_pct);
            let candidate = (start_pct - offset_pct).max(peak - offset_pct);
            if state.locked_pct.map_or(true, |locked| candidate > locked) {
                state.locked_pct = Some(candidate);
            }
        }

        match state.locked_pct {
            Some(locked_pct) if state.trailing_active && unlevered_pct <= locked_pct => {
                TrailDecision::Close {
                    unlevered_pct,
                    locked_pct,
                }
            }
            _ => TrailDecision::Hold,
        }
    }
}
