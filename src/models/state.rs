//! Per-account weekly state, persisted between ticks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Direction;

/// Entry snapshot captured when the basket is opened.
///
/// Grouping these together means `entered == true` can only be represented with
/// every entry field present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub time: DateTime<Utc>,
    pub equity: f64,
    /// Mid price per symbol at entry.
    pub prices: BTreeMap<String, f64>,
    /// USD notional per symbol at entry.
    pub notional: BTreeMap<String, f64>,
    /// Net direction per symbol; symbols absent here follow the basket direction.
    #[serde(default)]
    pub directions: BTreeMap<String, Direction>,
}

impl EntrySnapshot {
    pub fn total_notional(&self) -> f64 {
        self.notional.values().sum()
    }

    pub fn direction_for(&self, symbol: &str, basket: Direction) -> Direction {
        self.directions.get(symbol).copied().unwrap_or(basket)
    }
}

/// Weekly state machine record for one bot/account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub week_id: Option<String>,
    pub entered: bool,

    /// Present whenever `entered` is true. Positions adopted after a restart get
    /// a snapshot rebuilt from the broker's view at adoption time.
    #[serde(default)]
    pub entry: Option<EntrySnapshot>,

    #[serde(default)]
    pub peak_equity: Option<f64>,
    #[serde(default)]
    pub peak_unlevered_pct: Option<f64>,
    #[serde(default)]
    pub trailing_active: bool,
    #[serde(default)]
    pub locked_pct: Option<f64>,
    #[serde(default)]
    pub trail_hit_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_direction: Option<Direction>,

    /// Latest equity observed, for operator display.
    #[serde(default)]
    pub current_equity: Option<f64>,
    /// Latest unlevered move observed while entered.
    #[serde(default)]
    pub last_unlevered_pct: Option<f64>,
}

impl AccountState {
    /// Reset every per-week field when `week_id` differs. Returns true if a reset happened.
    ///
    /// Idempotent: calling it twice with the same week id leaves the state unchanged.
    pub fn roll_week(&mut self, week_id: &str) -> bool {
        if self.week_id.as_deref() == Some(week_id) {
            return false;
        }
        let current_equity = self.current_equity;
        *self = AccountState {
            week_id: Some(week_id.to_string()),
            current_equity,
            ..Default::default()
        };
        true
    }

    /// Record a fresh entry and clear any trailing progress.
    pub fn record_entry(&mut self, direction: Direction, entry: EntrySnapshot) {
        self.entered = true;
        self.peak_equity = Some(entry.equity);
        self.peak_unlevered_pct = Some(0.0);
        self.trailing_active = false;
        self.locked_pct = None;
        self.last_direction = Some(direction);
        self.last_unlevered_pct = None;
        self.entry = Some(entry);
    }

    /// Mark the account as entered because positions already exist at the broker.
    ///
    /// Unlike [`record_entry`](Self::record_entry) this keeps any trailing
    /// progress already recorded this week.
    pub fn adopt_open_positions(&mut self, direction: Direction, entry: EntrySnapshot) {
        self.entered = true;
        self.last_direction = Some(direction);
        if self.peak_equity.is_none() {
            self.peak_equity = Some(entry.equity);
        }
        if self.entry.is_none() {
            self.entry = Some(entry);
        }
    }

    /// `entered` implies a complete entry snapshot.
    pub fn is_consistent(&self) -> bool {
        !self.entered || self.entry.is_some()
    }

    /// Record a forced close. Trailing fields stay for the rest of the week for display.
    pub fn record_exit(&mut self, at: DateTime<Utc>) {
        self.entered = false;
        self.trail_hit_at = Some(at);
    }

    /// Track the highest equity seen since entry.
    pub fn observe_equity(&mut self, equity: f64) {
        self.current_equity = Some(equity);
        if self.entered && self.peak_equity.map_or(true, |peak| equity > peak) {
            self.peak_equity = Some(equity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> EntrySnapshot {
        EntrySnapshot {
            time: Utc::now(),
            equity: 1000.0,
            prices: BTreeMap::from([("BTCUSDT".to_string(), 50_000.0)]),
            notional: BTreeMap::from([("BTCUSDT".to_string(), 5_000.0)]),
            directions: BTreeMap::new(),
        }
    }

    #[test]
    fn test_roll_week_resets_and_is_idempotent() {
        let mut state = AccountState::default();
        assert!(state.roll_week("2024-06-02T23:00:00Z"));
        state.record_entry(Direction::Long, entry());
        state.trailing_active = true;
        state.locked_pct = Some(12.0);

        assert!(!state.roll_week("2024-06-02T23:00:00Z"));
        assert!(state.entered);

        assert!(state.roll_week("2024-06-09T23:00:00Z"));
        let once = state.clone();
        assert!(!state.roll_week("2024-06-09T23:00:00Z"));
        assert_eq!(state, once);
        assert!(!state.entered);
        assert!(state.entry.is_none());
        assert!(!state.trailing_active);
        assert!(state.locked_pct.is_none());
        assert!(state.last_direction.is_none());
    }

    #[test]
    fn test_record_entry_sets_peaks() {
        let mut state = AccountState::default();
        state.record_entry(Direction::Short, entry());
        assert!(state.entered);
        assert_eq!(state.peak_equity, Some(1000.0));
        assert_eq!(state.peak_unlevered_pct, Some(0.0));
        assert_eq!(state.last_direction, Some(Direction::Short));
        assert_eq!(state.entry.as_ref().map(|e| e.total_notional()), Some(5_000.0));
        assert!(state.is_consistent());
    }

    #[test]
    fn test_adopt_keeps_existing_entry() {
        let mut state = AccountState::default();
        state.record_entry(Direction::Long, entry());
        state.record_exit(Utc::now());
        state.locked_pct = Some(4.0);

        let mut later = entry();
        later.equity = 1200.0;
        state.adopt_open_positions(Direction::Long, later);
        assert!(state.entered);
        assert_eq!(state.entry.as_ref().map(|e| e.equity), Some(1000.0));
        assert_eq!(state.locked_pct, Some(4.0));
        assert!(state.is_consistent());
    }

    #[test]
    fn test_state_json_roundtrip_tolerates_missing_fields() {
        let raw = r#"{"week_id":"w","entered":false}"#;
        let state: AccountState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.week_id.as_deref(), Some("w"));
        assert!(!state.trailing_active);
    }
}
