//! Engine and per-account configuration.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::SignalModel;

/// Settings shared by every account the process runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between scheduled ticks
    pub tick_seconds: u64,

    /// Base URL of the signal feed
    pub app_base_url: String,

    /// SQLite URL for persisted account state
    pub database_url: String,

    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,

    /// Upper bound on one whole tick; defaults to four tick periods
    pub tick_timeout_secs: Option<u64>,

    /// Starting cash for paper accounts
    pub paper_balance: f64,

    /// JSON file with instrument specs and quotes for paper accounts
    pub market_file: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 30,
            app_base_url: String::new(),
            database_url: "sqlite:./basketbot.db?mode=rwc".to_string(),
            request_timeout_secs: 15,
            tick_timeout_secs: None,
            paper_balance: 10_000.0,
            market_file: None,
        }
    }
}

impl EngineConfig {
    /// Build from environment variables:
    /// - BOT_TICK_SECONDS (defaults to 30)
    /// - APP_BASE_URL
    /// - BOT_REQUEST_TIMEOUT_SECS (defaults to 15)
    /// - BOT_TICK_TIMEOUT_SECS
    /// - PAPER_BALANCE (defaults to 10000)
    /// - PAPER_MARKET_FILE
    pub fn from_env(database_url: &str) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            tick_seconds: env_parse("BOT_TICK_SECONDS", defaults.tick_seconds)?,
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_default()
                .trim()
                .to_string(),
            database_url: database_url.to_string(),
            request_timeout_secs: env_parse(
                "BOT_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            )?,
            tick_timeout_secs: env_opt("BOT_TICK_TIMEOUT_SECS")?,
            paper_balance: env_parse("PAPER_BALANCE", defaults.paper_balance)?,
            market_file: std::env::var("PAPER_MARKET_FILE")
                .ok()
                .map(|path| path.trim().to_string())
                .filter(|path| !path.is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_seconds == 0 {
            bail!("BOT_TICK_SECONDS must be positive");
        }
        if self.request_timeout_secs == 0 {
            bail!("BOT_REQUEST_TIMEOUT_SECS must be positive");
        }
        if !self.paper_balance.is_finite() || self.paper_balance <= 0.0 {
            bail!("PAPER_BALANCE must be a positive number");
        }
        Ok(())
    }

    /// Signal feed base URL, failing when it was never configured.
    pub fn require_app_base_url(&self) -> Result<&str> {
        if self.app_base_url.is_empty() {
            bail!("APP_BASE_URL is not configured");
        }
        Ok(&self.app_base_url)
    }

    /// Paper market file, failing when it was never configured.
    pub fn require_market_file(&self) -> Result<&str> {
        match self.market_file.as_deref() {
            Some(path) => Ok(path),
            None => bail!("PAPER_MARKET_FILE is not configured"),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_secs(
            self.tick_timeout_secs
                .unwrap_or_else(|| self.tick_seconds.saturating_mul(4)),
        )
    }
}

/// How signals must agree before the basket is entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentMode {
    /// Every required model on every symbol votes the same direction.
    Unanimous,
    /// Each directional vote is its own leg; hedged symbols are allowed.
    Independent,
}

/// The symbols and models one account trades as a weekly unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasketDefinition {
    /// Traded symbols; empty means every symbol the feed returns
    pub symbols: Vec<String>,

    /// Models whose votes count
    pub models: Vec<SignalModel>,

    /// `asset` query parameter sent to the signal feed
    pub asset: String,

    pub alignment: AlignmentMode,
}

/// Which legs consume margin when scaling a multi-leg basket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginBasis {
    /// Every leg carries its own margin.
    Gross,
    /// Opposing legs on one symbol offset each other; margin follows `|net|`.
    Net,
}

/// Sizing regime for an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "regime", rename_all = "snake_case")]
pub enum SizingRegime {
    /// One aggregated leg per symbol on a leveraged venue.
    Leveraged {
        leverage: f64,
        /// Share of equity per symbol; `None` splits equity evenly across symbols
        equity_fraction: Option<f64>,
    },
    /// Many legs sized 1:1 against equity, scaled down to fit available margin.
    MarginConstrained {
        margin_buffer: f64,
        margin_basis: MarginBasis,
    },
}

impl SizingRegime {
    pub fn margin_buffer(&self) -> Option<f64> {
        match self {
            SizingRegime::MarginConstrained { margin_buffer, .. } => Some(*margin_buffer),
            SizingRegime::Leveraged { .. } => None,
        }
    }
}

/// Trailing lock thresholds, in unlevered percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailConfig {
    pub start_pct: f64,
    pub offset_pct: f64,
}

impl Default for TrailConfig {
    fn default() -> Self {
        Self {
            start_pct: 20.0,  // Arm the lock at +20%
            offset_pct: 10.0, // Lock 10 points below the peak
        }
    }
}

/// Everything one bot instance needs besides its broker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Key for persisted state and log lines
    pub bot_id: String,

    pub basket: BasketDefinition,

    pub sizing: SizingRegime,

    pub trail: TrailConfig,

    /// First segment of every client tag this account writes
    pub tag_prefix: String,

    /// When false, orders are logged instead of sent
    pub trading_enabled: bool,

    /// Hours after the weekly open during which the basket may be held
    pub window_hours: u32,

    /// Relative tolerance before a leg counts as mismatched (0.01 = 1%)
    pub reconcile_tolerance_pct: f64,

    /// Absolute tolerance floor, in units
    pub reconcile_min_units: f64,
}

impl AccountConfig {
    /// Leveraged BTC/ETH perpetuals basket:
    /// - BITGET_LEVERAGE (defaults to 10)
    /// - BITGET_TRAIL_START_PCT / BITGET_TRAIL_OFFSET_PCT (20 / 10)
    /// - BITGET_TRADING_ENABLED (defaults to true)
    pub fn bitget_perp_bot() -> Result<Self> {
        let config = Self {
            bot_id: "bitget_perp_bot".to_string(),
            basket: BasketDefinition {
                symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
                models: vec![
                    SignalModel::Antikythera,
                    SignalModel::Dealer,
                    SignalModel::Commercial,
                    SignalModel::Sentiment,
                ],
                asset: "crypto".to_string(),
                alignment: AlignmentMode::Unanimous,
            },
            sizing: SizingRegime::Leveraged {
                leverage: env_parse("BITGET_LEVERAGE", 10.0)?,
                equity_fraction: None,
            },
            trail: TrailConfig {
                start_pct: env_parse("BITGET_TRAIL_START_PCT", 20.0)?,
                offset_pct: env_parse("BITGET_TRAIL_OFFSET_PCT", 10.0)?,
            },
            tag_prefix: "bg".to_string(),
            trading_enabled: env_parse("BITGET_TRADING_ENABLED", true)?,
            window_hours: env_parse("BITGET_WINDOW_HOURS", WEEK_HOURS)?,
            reconcile_tolerance_pct: env_parse("BITGET_RECONCILE_TOLERANCE_PCT", 0.01)?,
            // Contracts trade in thousandths of a coin
            reconcile_min_units: env_parse("BITGET_RECONCILE_MIN_UNITS", 0.001)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Every model, every symbol, hedged legs netted on one FX account:
    /// - OANDA_MARGIN_BUFFER (defaults to 0.1, clamped to [0, 0.5])
    /// - OANDA_TRAIL_START_PCT / OANDA_TRAIL_OFFSET_PCT (20 / 10)
    /// - OANDA_TRADING_ENABLED (defaults to false)
    pub fn oanda_universal_bot() -> Result<Self> {
        let buffer: f64 = env_parse("OANDA_MARGIN_BUFFER", 0.1)?;
        let config = Self {
            bot_id: "oanda_universal_bot".to_string(),
            basket: BasketDefinition {
                symbols: Vec::new(),
                models: SignalModel::UNIVERSAL.to_vec(),
                asset: "all".to_string(),
                alignment: AlignmentMode::Independent,
            },
            sizing: SizingRegime::MarginConstrained {
                margin_buffer: clamp_margin_buffer(buffer),
                margin_basis: env_parse("OANDA_MARGIN_BASIS", MarginBasis::Net)?,
            },
            trail: TrailConfig {
                start_pct: env_parse("OANDA_TRAIL_START_PCT", 20.0)?,
                offset_pct: env_parse("OANDA_TRAIL_OFFSET_PCT", 10.0)?,
            },
            tag_prefix: "uni".to_string(),
            trading_enabled: env_parse("OANDA_TRADING_ENABLED", false)?,
            window_hours: env_parse("OANDA_WINDOW_HOURS", WEEK_HOURS)?,
            reconcile_tolerance_pct: env_parse("OANDA_RECONCILE_TOLERANCE_PCT", 0.01)?,
            reconcile_min_units: env_parse("OANDA_RECONCILE_MIN_UNITS", 1.0)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Crypto basket under its own tag prefix, always placing paper orders.
    pub fn paper_basket_bot() -> Result<Self> {
        let mut config = Self::bitget_perp_bot()?;
        config.bot_id = "paper_basket_bot".to_string();
        config.tag_prefix = "pp".to_string();
        config.trading_enabled = true;
        Ok(config)
    }

    /// Look up a preset by bot id.
    pub fn preset(bot_id: &str) -> Result<Self> {
        match bot_id.trim() {
            "bitget_perp_bot" => Self::bitget_perp_bot(),
            "oanda_universal_bot" => Self::oanda_universal_bot(),
            "paper_basket_bot" => Self::paper_basket_bot(),
            other => bail!("unknown account: {}", other),
        }
    }

    /// Accounts named in BOT_ACCOUNTS (comma-separated), or both basket presets.
    pub fn configured() -> Result<Vec<Self>> {
        let raw = std::env::var("BOT_ACCOUNTS")
            .unwrap_or_else(|_| "bitget_perp_bot,oanda_universal_bot".to_string());
        raw.split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(Self::preset)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.bot_id.trim().is_empty() {
            bail!("bot_id must not be empty");
        }
        if self.tag_prefix.is_empty() || self.tag_prefix.contains('-') {
            bail!("{}: tag prefix must be non-empty and contain no '-'", self.bot_id);
        }
        if self.basket.models.is_empty() {
            bail!("{}: basket has no models", self.bot_id);
        }
        if !self.trail.start_pct.is_finite() || !self.trail.offset_pct.is_finite() {
            bail!("{}: trail parameters must be finite", self.bot_id);
        }
        if self.trail.offset_pct < 0.0 {
            bail!("{}: trail offset must not be negative", self.bot_id);
        }
        if self.window_hours == 0 || self.window_hours > WEEK_HOURS {
            bail!("{}: window_hours must be within 1..={}", self.bot_id, WEEK_HOURS);
        }
        if !self.reconcile_tolerance_pct.is_finite() || self.reconcile_tolerance_pct < 0.0 {
            bail!("{}: reconcile tolerance must be a non-negative number", self.bot_id);
        }
        if !self.reconcile_min_units.is_finite() || self.reconcile_min_units < 0.0 {
            bail!("{}: reconcile min units must be a non-negative number", self.bot_id);
        }
        match &self.sizing {
            SizingRegime::Leveraged {
                leverage,
                equity_fraction,
            } => {
                if !leverage.is_finite() || *leverage <= 0.0 {
                    bail!("{}: leverage must be positive", self.bot_id);
                }
                if let Some(fraction) = equity_fraction {
                    if !fraction.is_finite() || *fraction <= 0.0 || *fraction > 1.0 {
                        bail!("{}: equity fraction must be within (0, 1]", self.bot_id);
                    }
                }
                if self.basket.symbols.is_empty() {
                    bail!("{}: leveraged baskets need an explicit symbol list", self.bot_id);
                }
            }
            SizingRegime::MarginConstrained { margin_buffer, .. } => {
                if !(0.0..=MAX_MARGIN_BUFFER).contains(margin_buffer) {
                    bail!("{}: margin buffer must be within [0, 0.5]", self.bot_id);
                }
            }
        }
        Ok(())
    }
}

impl FromStr for MarginBasis {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gross" => Ok(MarginBasis::Gross),
            "net" => Ok(MarginBasis::Net),
            other => bail!("unknown margin basis: {}", other),
        }
    }
}

const WEEK_HOURS: u32 = 7 * 24;
const MAX_MARGIN_BUFFER: f64 = 0.5;

/// Clamp to [0, 0.5]; non-finite input falls back to the 10% default.
pub fn clamp_margin_buffer(raw: f64) -> f64 {
    if raw.is_finite() {
        raw.clamp(0.0, MAX_MARGIN_BUFFER)
    } else {
        0.1
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(env_opt(key)?.unwrap_or(default))
}

fn env_opt<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid {}", key)),
        _ => Ok(None),
    }
}
