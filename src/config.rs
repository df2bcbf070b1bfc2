//! Configuration loaded from environment variables.
//!
//! Risk parameters are strict: a missing or malformed risk key aborts startup
//! rather than falling back to a default. Operational knobs (intervals,
//! timeouts, watchlist) have safe defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    Paper,
    Live,
}

impl FromStr for TradingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "paper" => Ok(TradingMode::Paper),
            "live" => Ok(TradingMode::Live),
            other => Err(format!("unknown trading mode {other:?}, expected paper or live")),
        }
    }
}

/// Capital preservation parameters. All required, all validated.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Fraction of balance risked per trade (distance to virtual SL).
    pub max_risk_per_trade: Decimal,
    /// Hard cap on position notional as a fraction of balance.
    pub max_position_fraction: Decimal,
    pub max_open_positions: usize,
    /// Negative fraction, e.g. -0.02 for a 2% virtual stop.
    pub virtual_sl_pct: Decimal,
    /// Positive fraction, e.g. 0.04 for a 4% profit target.
    pub virtual_tp_pct: Decimal,
    /// Negative fraction, strictly below the virtual stop.
    pub catastrophe_sl_pct: Decimal,
    pub max_trade_duration: Duration,
    /// Minimum AI confidence (0..=100) to act on a signal.
    pub min_confidence: u8,
    /// Max fractional price move since signal publish before chasing.
    pub max_price_move_pct: Decimal,
    pub max_signal_age: Duration,
    pub rsi_overbought: f64,
}

/// Macro guard parameters.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Lowercased danger keywords matched as substrings against headlines.
    pub danger_keywords: Vec<String>,
    pub defensive_window: Duration,
}

/// Loop scheduling and exit-policy knobs.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub decision_interval: StdDuration,
    pub monitor_interval: StdDuration,
    pub reconcile_interval: StdDuration,
    /// When both fire in the same tick, take profit before time decay.
    pub tp_before_decay: bool,
}

/// Per-call execution limits.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub call_timeout: StdDuration,
    pub fill_confirm_attempts: u32,
    /// How long an unfilled PENDING_ENTRY may linger before reconciliation
    /// cancels it.
    pub entry_fill_grace: Duration,
}

/// Exchange and signal-provider endpoints.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
    pub exchange_url: String,
    pub signal_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: TradingMode,
    pub watchlist: Vec<String>,
    /// JSON state file holding positions, processed signals and system state.
    pub state_path: PathBuf,
    pub risk: RiskConfig,
    pub guard: GuardConfig,
    pub loops: LoopConfig,
    pub execution: ExecutionConfig,
    pub exchange: ExchangeConfig,
}

impl Config {
    /// Load and validate configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mode: TradingMode = require_parsed("TRADING_MODE")?;

        let risk = RiskConfig {
            max_risk_per_trade: require_parsed("MAX_RISK_PER_TRADE")?,
            max_position_fraction: require_parsed("MAX_POSITION_FRACTION")?,
            max_open_positions: require_parsed("MAX_OPEN_POSITIONS")?,
            virtual_sl_pct: require_parsed("VIRTUAL_SL_PCT")?,
            virtual_tp_pct: require_parsed("VIRTUAL_TP_PCT")?,
            catastrophe_sl_pct: require_parsed("CATASTROPHE_SL_PCT")?,
            max_trade_duration: Duration::hours(require_parsed::<i64>("MAX_TRADE_DURATION_HOURS")?),
            min_confidence: require_parsed("MIN_CONFIDENCE")?,
            max_price_move_pct: require_parsed("MAX_PRICE_MOVE_PCT")?,
            max_signal_age: Duration::hours(require_parsed::<i64>("MAX_SIGNAL_AGE_HOURS")?),
            rsi_overbought: require_parsed("RSI_OVERBOUGHT")?,
        };
        validate_risk(&risk)?;

        let guard = GuardConfig {
            danger_keywords: csv(&optional(
                "DANGER_KEYWORDS",
                "fed,cpi,fomc,rate hike,rate cut,inflation,recession,war",
            ))
            .into_iter()
            .map(|k| k.to_lowercase())
            .collect(),
            defensive_window: Duration::hours(optional_parsed("DEFENSIVE_MODE_HOURS", 2i64)?),
        };

        let loops = LoopConfig {
            decision_interval: StdDuration::from_secs(optional_parsed("DECISION_INTERVAL_SECS", 60u64)?),
            monitor_interval: StdDuration::from_secs(optional_parsed("MONITOR_INTERVAL_SECS", 10u64)?),
            reconcile_interval: StdDuration::from_secs(optional_parsed("RECONCILE_INTERVAL_SECS", 300u64)?),
            tp_before_decay: optional_parsed("TP_BEFORE_DECAY", true)?,
        };

        let execution = ExecutionConfig {
            call_timeout: StdDuration::from_secs(optional_parsed("CALL_TIMEOUT_SECS", 10u64)?),
            fill_confirm_attempts: optional_parsed("FILL_CONFIRM_ATTEMPTS", 10u32)?,
            entry_fill_grace: Duration::minutes(optional_parsed("ENTRY_FILL_GRACE_MINUTES", 5i64)?),
        };

        let exchange = ExchangeConfig {
            api_key: optional("EXCHANGE_API_KEY", ""),
            api_secret: optional("EXCHANGE_API_SECRET", ""),
            testnet: optional_parsed("EXCHANGE_TESTNET", true)?,
            exchange_url: optional("EXCHANGE_URL", "http://localhost:8091"),
            signal_url: optional("SIGNAL_URL", "http://localhost:8090"),
        };

        if mode == TradingMode::Live && exchange.api_key.is_empty() {
            return Err(ConfigError::Missing("EXCHANGE_API_KEY"));
        }

        Ok(Self {
            mode,
            watchlist: csv(&optional("WATCHLIST", "BTC/USDT,ETH/USDT,SOL/USDT")),
            state_path: PathBuf::from(optional("STATE_PATH", "fusion-trader-state.json")),
            risk,
            guard,
            loops,
            execution,
            exchange,
        })
    }
}

fn validate_risk(risk: &RiskConfig) -> Result<(), ConfigError> {
    let invalid = |key: &'static str, value: String, reason: &str| ConfigError::Invalid {
        key,
        value,
        reason: reason.to_string(),
    };

    if risk.max_risk_per_trade <= Decimal::ZERO || risk.max_risk_per_trade > Decimal::new(10, 2) {
        return Err(invalid(
            "MAX_RISK_PER_TRADE",
            risk.max_risk_per_trade.to_string(),
            "must be in (0, 0.10]",
        ));
    }
    if risk.max_position_fraction <= Decimal::ZERO || risk.max_position_fraction > Decimal::ONE {
        return Err(invalid(
            "MAX_POSITION_FRACTION",
            risk.max_position_fraction.to_string(),
            "must be in (0, 1]",
        ));
    }
    if risk.max_open_positions == 0 {
        return Err(invalid(
            "MAX_OPEN_POSITIONS",
            "0".to_string(),
            "must be at least 1",
        ));
    }
    if risk.virtual_sl_pct >= Decimal::ZERO {
        return Err(invalid(
            "VIRTUAL_SL_PCT",
            risk.virtual_sl_pct.to_string(),
            "must be negative",
        ));
    }
    if risk.virtual_tp_pct <= Decimal::ZERO {
        return Err(invalid(
            "VIRTUAL_TP_PCT",
            risk.virtual_tp_pct.to_string(),
            "must be positive",
        ));
    }
    if risk.catastrophe_sl_pct >= risk.virtual_sl_pct {
        return Err(invalid(
            "CATASTROPHE_SL_PCT",
            risk.catastrophe_sl_pct.to_string(),
            "must sit strictly below the virtual stop",
        ));
    }
    if risk.min_confidence > 100 {
        return Err(invalid(
            "MIN_CONFIDENCE",
            risk.min_confidence.to_string(),
            "must be 0..=100",
        ));
    }
    if risk.max_trade_duration <= Duration::zero() {
        return Err(invalid(
            "MAX_TRADE_DURATION_HOURS",
            risk.max_trade_duration.num_hours().to_string(),
            "must be at least 1",
        ));
    }
    if !(0.0..=100.0).contains(&risk.rsi_overbought) {
        return Err(invalid(
            "RSI_OVERBOUGHT",
            risk.rsi_overbought.to_string(),
            "must be 0..=100",
        ));
    }
    Ok(())
}

fn require(key: &'static str) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn require_parsed<T>(key: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = require(key)?;
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: raw,
        reason: e.to_string(),
    })
}

fn optional(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_string(),
    }
}

fn optional_parsed<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: v,
            reason: e.to_string(),
        }),
        _ => Ok(default),
    }
}

fn csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
