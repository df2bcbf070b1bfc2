//! Core domain types for the decision gate and position lifecycle engine.
//!
//! These types define the contract between the decision side (macro guard +
//! fusion engine) and the execution side (executor, lifecycle, reconciler).

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Trade side. Only long entries are supported today; the enum exists so the
/// wire format does not change when shorts land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
        }
    }
}

/// Lifecycle status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// Entry order submitted, fill or stop placement not yet confirmed.
    PendingEntry,
    /// Entry filled and catastrophe stop confirmed on the exchange.
    Open,
    /// An exit trigger fired; exit order submitted or about to be.
    ExitInProgress,
    /// Terminal. Exit confirmed, P&L recorded.
    Closed,
    /// Terminal. Entry never filled, no funds committed.
    Cancelled,
}

impl PositionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PositionStatus::Closed | PositionStatus::Cancelled)
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PositionStatus::PendingEntry => "pending_entry",
            PositionStatus::Open => "open",
            PositionStatus::ExitInProgress => "exit_in_progress",
            PositionStatus::Closed => "closed",
            PositionStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Why a position was closed. Exactly one reason per close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    VirtualSl,
    VirtualTp,
    Catastrophe,
    TimeDecay,
    Manual,
    ReconciledExternal,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::VirtualSl => "virtual_sl",
            ExitReason::VirtualTp => "virtual_tp",
            ExitReason::Catastrophe => "catastrophe",
            ExitReason::TimeDecay => "time_decay",
            ExitReason::Manual => "manual",
            ExitReason::ReconciledExternal => "reconciled_external",
        };
        write!(f, "{s}")
    }
}

/// A trade from entry through dual-stop monitoring to close.
///
/// The executor creates positions in `PendingEntry`; the lifecycle engine and
/// reconciler drive them to a terminal state. All writes go through the
/// store's versioned update so concurrent writers cannot clobber each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub entry_order_id: Option<String>,
    /// Bot-enforced stop, unknown to the exchange.
    pub virtual_sl: Decimal,
    /// Bot-enforced profit target, unknown to the exchange.
    pub virtual_tp: Decimal,
    /// Hard stop price enforced by the exchange even while we are down.
    pub catastrophe_sl: Decimal,
    pub stop_order_id: Option<String>,
    pub status: PositionStatus,
    pub exit_price: Option<Decimal>,
    pub exit_order_id: Option<String>,
    pub exit_reason: Option<ExitReason>,
    pub pnl_amount: Option<Decimal>,
    pub pnl_percent: Option<Decimal>,
    /// Id of the signal that triggered the entry, for audit.
    pub signal_id: Option<String>,
    /// AI reasoning captured at decision time, for audit.
    pub reasoning: Option<String>,
    /// Set through the store by the CLI; picked up by the monitoring tick.
    pub manual_close_requested: bool,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency version, bumped by every store update.
    pub version: u64,
}

impl Position {
    /// Create a position in `PendingEntry`, before any order is confirmed.
    #[allow(clippy::too_many_arguments)]
    pub fn new_pending(
        symbol: &str,
        quantity: Decimal,
        entry_price: Decimal,
        virtual_sl: Decimal,
        virtual_tp: Decimal,
        catastrophe_sl: Decimal,
        signal_id: Option<String>,
        reasoning: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side: Side::Buy,
            entry_price,
            quantity,
            entry_order_id: None,
            virtual_sl,
            virtual_tp,
            catastrophe_sl,
            stop_order_id: None,
            status: PositionStatus::PendingEntry,
            exit_price: None,
            exit_order_id: None,
            exit_reason: None,
            pnl_amount: None,
            pnl_percent: None,
            signal_id,
            reasoning,
            manual_close_requested: false,
            opened_at: Utc::now(),
            closed_at: None,
            version: 0,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.opened_at
    }

    pub fn virtual_sl_hit(&self, current_price: Decimal) -> bool {
        match self.side {
            Side::Buy => current_price <= self.virtual_sl,
        }
    }

    pub fn virtual_tp_hit(&self, current_price: Decimal) -> bool {
        match self.side {
            Side::Buy => current_price >= self.virtual_tp,
        }
    }

    /// Realized P&L at a given exit price, as (amount, fraction of notional).
    pub fn pnl(&self, exit_price: Decimal) -> (Decimal, Decimal) {
        let amount = match self.side {
            Side::Buy => (exit_price - self.entry_price) * self.quantity,
        };
        let notional = self.entry_price * self.quantity;
        let percent = if notional.is_zero() {
            Decimal::ZERO
        } else {
            amount / notional
        };
        (amount, percent)
    }

    /// Move to `Closed`, recording exit price, reason and P&L.
    ///
    /// An unknown exit price (externally observed closure with no fill record)
    /// leaves P&L unset rather than guessing.
    pub fn close(&mut self, exit_price: Option<Decimal>, reason: ExitReason, now: DateTime<Utc>) {
        if let Some(price) = exit_price {
            let (amount, percent) = self.pnl(price);
            self.pnl_amount = Some(amount);
            self.pnl_percent = Some(percent);
        }
        self.exit_price = exit_price;
        self.exit_reason = Some(reason);
        self.status = PositionStatus::Closed;
        self.closed_at = Some(now);
    }

    /// Base asset of the symbol, e.g. "BTC" for "BTC/USDT".
    pub fn base_asset(&self) -> &str {
        self.symbol.split('/').next().unwrap_or(&self.symbol)
    }
}

/// Identity hash for a signal: sha256 over normalized `title|source`,
/// truncated to 16 hex chars. Reprocessing the same signal is a no-op keyed
/// on this id.
pub fn signal_id(title: &str, source: &str) -> String {
    let normalized = format!(
        "{}|{}",
        title.trim().to_lowercase(),
        source.trim().to_lowercase()
    );
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(&digest[..8])
}

/// A processed signal, recorded for dedup and audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeenSignal {
    pub id: String,
    pub title: String,
    pub source: String,
    pub processed_at: DateTime<Utc>,
    pub action: Action,
    pub rejection_reason: Option<RejectReason>,
}

/// A danger-keyword hit that drove the macro guard defensive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroEvent {
    pub keyword: String,
    pub headline: String,
    pub source: String,
    pub detected_at: DateTime<Utc>,
    pub defensive_until: DateTime<Utc>,
}

/// A raw headline scanned by the macro guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Headline {
    pub title: String,
    pub source: String,
    /// When the event was detected (publish time), not when we happened to
    /// read it. The defensive window is anchored here.
    pub detected_at: DateTime<Utc>,
}

/// Trend direction relative to the moving average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

/// Technical indicator snapshot for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalSnapshot {
    pub symbol: String,
    pub current_price: Decimal,
    pub rsi: f64,
    pub moving_average: Decimal,
    pub momentum: f64,
}

impl TechnicalSnapshot {
    pub fn trend(&self) -> Trend {
        if self.current_price < self.moving_average {
            Trend::Bearish
        } else if self.current_price > self.moving_average {
            Trend::Bullish
        } else {
            Trend::Neutral
        }
    }
}

/// The news signal that originated a candidate trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsSignal {
    pub id: String,
    pub title: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
    /// Price when the news broke, used for chase prevention.
    pub price_at_publish: Decimal,
}

/// The AI reasoning service's opinion on a candidate trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiOpinion {
    /// 0..=100.
    pub confidence: u8,
    pub reasoning: String,
}

/// Everything the fusion engine needs to gate one candidate trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSnapshot {
    pub news: NewsSignal,
    pub technicals: TechnicalSnapshot,
    pub ai: AiOpinion,
    /// Broader market headlines for the macro guard scan.
    pub headlines: Vec<Headline>,
}

/// Gate outcome for a candidate trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Wait,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Buy => write!(f, "BUY"),
            Action::Wait => write!(f, "WAIT"),
        }
    }
}

/// Machine-readable reason a candidate trade was refused. Persisted on the
/// SeenSignal record so rejections can be audited later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    DefensiveMode,
    Overbought,
    BearishTrend,
    ChasePrevention,
    SignalTooOld,
    LowConfidence,
    NotInWatchlist,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::DefensiveMode => "defensive_mode",
            RejectReason::Overbought => "overbought",
            RejectReason::BearishTrend => "bearish_trend",
            RejectReason::ChasePrevention => "chase_prevention",
            RejectReason::SignalTooOld => "signal_too_old",
            RejectReason::LowConfidence => "low_confidence",
            RejectReason::NotInWatchlist => "not_in_watchlist",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Decision from the fusion engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub action: Action,
    pub confidence: u8,
    pub reasoning: String,
    pub rejection: Option<RejectReason>,
}

impl Verdict {
    pub fn wait(reason: RejectReason, confidence: u8) -> Self {
        Self {
            action: Action::Wait,
            confidence,
            reasoning: reason.as_str().to_string(),
            rejection: Some(reason),
        }
    }

    pub fn buy(confidence: u8, reasoning: String) -> Self {
        Self {
            action: Action::Buy,
            confidence,
            reasoning,
            rejection: None,
        }
    }
}

/// Macro guard output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardVerdict {
    pub defensive: bool,
    pub until: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn signal_id_is_stable_and_normalized() {
        let a = signal_id("Bitcoin ETF approved", "coindesk");
        let b = signal_id("  bitcoin etf approved ", "CoinDesk");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        let c = signal_id("Bitcoin ETF approved", "reuters");
        assert_ne!(a, c);
    }

    #[test]
    fn virtual_targets_for_long() {
        let pos = Position::new_pending(
            "BTC/USDT",
            dec("0.1"),
            dec("50000"),
            dec("49000"),
            dec("52000"),
            dec("45000"),
            None,
            None,
        );

        assert!(pos.virtual_sl_hit(dec("49000")));
        assert!(pos.virtual_sl_hit(dec("48500")));
        assert!(!pos.virtual_sl_hit(dec("49001")));

        assert!(pos.virtual_tp_hit(dec("52000")));
        assert!(!pos.virtual_tp_hit(dec("51999")));
    }

    #[test]
    fn close_records_pnl() {
        let mut pos = Position::new_pending(
            "BTC/USDT",
            dec("0.1"),
            dec("50000"),
            dec("49000"),
            dec("52000"),
            dec("45000"),
            None,
            None,
        );
        pos.status = PositionStatus::Open;
        pos.close(Some(dec("52000")), ExitReason::VirtualTp, Utc::now());

        assert_eq!(pos.status, PositionStatus::Closed);
        assert_eq!(pos.exit_reason, Some(ExitReason::VirtualTp));
        assert_eq!(pos.pnl_amount, Some(dec("200.0")));
        assert_eq!(pos.pnl_percent, Some(dec("0.04")));
    }

    #[test]
    fn close_with_unknown_price_leaves_pnl_unset() {
        let mut pos = Position::new_pending(
            "ETH/USDT",
            dec("1"),
            dec("3000"),
            dec("2940"),
            dec("3120"),
            dec("2700"),
            None,
            None,
        );
        pos.status = PositionStatus::Open;
        pos.close(None, ExitReason::ReconciledExternal, Utc::now());

        assert_eq!(pos.status, PositionStatus::Closed);
        assert!(pos.pnl_amount.is_none());
        assert!(pos.exit_price.is_none());
    }

    #[test]
    fn trend_follows_moving_average() {
        let mut t = TechnicalSnapshot {
            symbol: "BTC/USDT".to_string(),
            current_price: dec("50000"),
            rsi: 55.0,
            moving_average: dec("51000"),
            momentum: 0.0,
        };
        assert_eq!(t.trend(), Trend::Bearish);
        t.moving_average = dec("49000");
        assert_eq!(t.trend(), Trend::Bullish);
    }

    #[test]
    fn base_asset_split() {
        let pos = Position::new_pending(
            "SOL/USDT",
            dec("10"),
            dec("150"),
            dec("147"),
            dec("156"),
            dec("135"),
            None,
            None,
        );
        assert_eq!(pos.base_asset(), "SOL");
    }
}
