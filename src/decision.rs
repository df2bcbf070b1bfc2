//! Fusion decision engine.
//!
//! Pure gate over one candidate trade: hard capital-preservation rules run
//! in a fixed order and any hit vetoes the trade regardless of AI
//! confidence. Confidence is only consulted once every hard rule passes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::RiskConfig;
use crate::types::{RejectReason, SignalSnapshot, Trend, Verdict};

#[derive(Debug, Clone)]
pub struct DecisionConfig {
    pub rsi_overbought: f64,
    pub min_confidence: u8,
    pub max_price_move_pct: Decimal,
    pub max_signal_age: chrono::Duration,
}

impl From<&RiskConfig> for DecisionConfig {
    fn from(risk: &RiskConfig) -> Self {
        Self {
            rsi_overbought: risk.rsi_overbought,
            min_confidence: risk.min_confidence,
            max_price_move_pct: risk.max_price_move_pct,
            max_signal_age: risk.max_signal_age,
        }
    }
}

pub struct FusionEngine {
    config: DecisionConfig,
}

impl FusionEngine {
    pub fn new(config: DecisionConfig) -> Self {
        Self { config }
    }

    /// Gate one candidate trade. Hard rules in order: defensive mode,
    /// overbought RSI, bearish trend, chase prevention, signal age. Only
    /// then does AI confidence decide.
    pub fn decide(&self, snapshot: &SignalSnapshot, defensive: bool, now: DateTime<Utc>) -> Verdict {
        let confidence = snapshot.ai.confidence;

        if defensive {
            return Verdict::wait(RejectReason::DefensiveMode, confidence);
        }

        if snapshot.technicals.rsi >= self.config.rsi_overbought {
            debug!(
                symbol = %snapshot.technicals.symbol,
                rsi = snapshot.technicals.rsi,
                "overbought, vetoing entry"
            );
            return Verdict::wait(RejectReason::Overbought, confidence);
        }

        if snapshot.technicals.trend() == Trend::Bearish {
            return Verdict::wait(RejectReason::BearishTrend, confidence);
        }

        if self.price_moved_too_far(snapshot) {
            return Verdict::wait(RejectReason::ChasePrevention, confidence);
        }

        if now - snapshot.news.published_at > self.config.max_signal_age {
            return Verdict::wait(RejectReason::SignalTooOld, confidence);
        }

        if confidence < self.config.min_confidence {
            return Verdict::wait(RejectReason::LowConfidence, confidence);
        }

        Verdict::buy(confidence, snapshot.ai.reasoning.clone())
    }

    /// Absolute move since the news broke, as a fraction of the publish
    /// price. Entering after a large move means buying someone else's rally.
    fn price_moved_too_far(&self, snapshot: &SignalSnapshot) -> bool {
        let published = snapshot.news.price_at_publish;
        if published.is_zero() {
            return true;
        }
        let moved = ((snapshot.technicals.current_price - published) / published).abs();
        moved > self.config.max_price_move_pct
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, AiOpinion, NewsSignal, TechnicalSnapshot};
    use chrono::Duration;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn engine() -> FusionEngine {
        FusionEngine::new(DecisionConfig {
            rsi_overbought: 70.0,
            min_confidence: 70,
            max_price_move_pct: dec("0.015"),
            max_signal_age: Duration::hours(2),
        })
    }

    fn snapshot(confidence: u8) -> SignalSnapshot {
        let now = Utc::now();
        SignalSnapshot {
            news: NewsSignal {
                id: "abcd1234abcd1234".to_string(),
                title: "Bitcoin ETF approved".to_string(),
                source: "coindesk".to_string(),
                published_at: now - Duration::minutes(10),
                price_at_publish: dec("50000"),
            },
            technicals: TechnicalSnapshot {
                symbol: "BTC/USDT".to_string(),
                current_price: dec("50200"),
                rsi: 55.0,
                moving_average: dec("49500"),
                momentum: 0.8,
            },
            ai: AiOpinion {
                confidence,
                reasoning: "strong catalyst, bullish structure".to_string(),
            },
            headlines: vec![],
        }
    }

    #[test]
    fn clean_signal_with_high_confidence_buys() {
        let verdict = engine().decide(&snapshot(85), false, Utc::now());
        assert_eq!(verdict.action, Action::Buy);
        assert!(verdict.rejection.is_none());
        assert_eq!(verdict.confidence, 85);
    }

    #[test]
    fn defensive_mode_vetoes_everything() {
        let verdict = engine().decide(&snapshot(99), true, Utc::now());
        assert_eq!(verdict.action, Action::Wait);
        assert_eq!(verdict.rejection, Some(RejectReason::DefensiveMode));
    }

    #[test]
    fn overbought_overrides_high_confidence() {
        let mut snap = snapshot(95);
        snap.technicals.rsi = 75.0;
        let verdict = engine().decide(&snap, false, Utc::now());
        assert_eq!(verdict.action, Action::Wait);
        assert_eq!(verdict.rejection, Some(RejectReason::Overbought));
    }

    #[test]
    fn bearish_trend_vetoes() {
        let mut snap = snapshot(90);
        snap.technicals.moving_average = dec("51000");
        let verdict = engine().decide(&snap, false, Utc::now());
        assert_eq!(verdict.rejection, Some(RejectReason::BearishTrend));
    }

    #[test]
    fn chase_prevention_at_two_percent_move() {
        let mut snap = snapshot(90);
        // 2% above publish price with a 1.5% threshold.
        snap.technicals.current_price = dec("51000");
        let verdict = engine().decide(&snap, false, Utc::now());
        assert_eq!(verdict.action, Action::Wait);
        assert_eq!(verdict.rejection, Some(RejectReason::ChasePrevention));
    }

    #[test]
    fn move_within_threshold_is_not_chasing() {
        let mut snap = snapshot(90);
        // 1% move, under the 1.5% threshold.
        snap.technicals.current_price = dec("50500");
        let verdict = engine().decide(&snap, false, Utc::now());
        assert_eq!(verdict.action, Action::Buy);
    }

    #[test]
    fn downward_moves_also_count_as_chasing() {
        let mut snap = snapshot(90);
        snap.technicals.current_price = dec("49000");
        snap.technicals.moving_average = dec("48500");
        let verdict = engine().decide(&snap, false, Utc::now());
        assert_eq!(verdict.rejection, Some(RejectReason::ChasePrevention));
    }

    #[test]
    fn stale_signal_is_rejected() {
        let mut snap = snapshot(90);
        snap.news.published_at = Utc::now() - Duration::hours(3);
        let verdict = engine().decide(&snap, false, Utc::now());
        assert_eq!(verdict.rejection, Some(RejectReason::SignalTooOld));
    }

    #[test]
    fn low_confidence_waits() {
        let verdict = engine().decide(&snapshot(69), false, Utc::now());
        assert_eq!(verdict.action, Action::Wait);
        assert_eq!(verdict.rejection, Some(RejectReason::LowConfidence));
    }

    #[test]
    fn confidence_at_threshold_buys() {
        let verdict = engine().decide(&snapshot(70), false, Utc::now());
        assert_eq!(verdict.action, Action::Buy);
    }
}
