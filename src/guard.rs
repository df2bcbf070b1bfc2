//! Macro guard: keyword scan over market headlines driving defensive mode.
//!
//! While defensive, no new entries are allowed; existing positions keep
//! their normal lifecycle. The window expiry is persisted in system state so
//! it survives a restart.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::config::GuardConfig;
use crate::error::StoreError;
use crate::store::{parse_state_time, PositionStore, STATE_DEFENSIVE_UNTIL};
use crate::types::{GuardVerdict, Headline, MacroEvent};

pub struct MacroGuard {
    keywords: Vec<String>,
    window: Duration,
    store: Arc<dyn PositionStore>,
}

impl MacroGuard {
    pub fn new(config: &GuardConfig, store: Arc<dyn PositionStore>) -> Self {
        Self {
            keywords: config
                .danger_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            window: config.defensive_window,
            store,
        }
    }

    fn match_keyword(&self, title: &str) -> Option<&str> {
        let lowered = title.to_lowercase();
        self.keywords
            .iter()
            .find(|k| lowered.contains(k.as_str()))
            .map(|k| k.as_str())
    }

    /// Scan headlines and extend the defensive window on keyword hits.
    ///
    /// The window is anchored at each headline's detection time, so a stale
    /// headline extends protection less than a fresh one (possibly not at
    /// all). Re-entry only ever pushes the expiry later.
    pub async fn evaluate(
        &self,
        headlines: &[Headline],
        now: DateTime<Utc>,
    ) -> Result<GuardVerdict, StoreError> {
        let mut until = self.persisted_until().await?;

        for headline in headlines {
            let Some(keyword) = self.match_keyword(&headline.title) else {
                continue;
            };

            let candidate = headline.detected_at + self.window;
            let extends = until.map(|u| candidate > u).unwrap_or(candidate > now);

            self.store
                .record_macro_event(MacroEvent {
                    keyword: keyword.to_string(),
                    headline: headline.title.clone(),
                    source: headline.source.clone(),
                    detected_at: headline.detected_at,
                    defensive_until: candidate,
                })
                .await?;

            if extends && candidate > now {
                warn!(
                    keyword,
                    source = %headline.source,
                    until = %candidate,
                    "macro danger detected, defensive mode engaged"
                );
                self.store
                    .set_state(STATE_DEFENSIVE_UNTIL, &candidate.to_rfc3339())
                    .await?;
                until = Some(candidate);
            } else {
                info!(
                    keyword,
                    source = %headline.source,
                    "macro keyword hit inside existing window"
                );
            }
        }

        let defensive = until.map(|u| now < u).unwrap_or(false);
        Ok(GuardVerdict {
            defensive,
            until: until.filter(|u| now < *u),
        })
    }

    /// Whether the persisted defensive window is still in force.
    pub async fn is_defensive(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self
            .persisted_until()
            .await?
            .map(|u| now < u)
            .unwrap_or(false))
    }

    async fn persisted_until(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .store
            .state(STATE_DEFENSIVE_UNTIL)
            .await?
            .as_deref()
            .and_then(parse_state_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn guard(store: Arc<MemoryStore>) -> MacroGuard {
        MacroGuard::new(
            &GuardConfig {
                danger_keywords: vec!["fomc".into(), "rate hike".into(), "war".into()],
                defensive_window: Duration::hours(2),
            },
            store,
        )
    }

    fn headline(title: &str, detected_at: DateTime<Utc>) -> Headline {
        Headline {
            title: title.to_string(),
            source: "reuters".to_string(),
            detected_at,
        }
    }

    #[tokio::test]
    async fn keyword_match_is_case_insensitive_substring() {
        let store = Arc::new(MemoryStore::new());
        let guard = guard(store);
        let now = Utc::now();

        let verdict = guard
            .evaluate(&[headline("FOMC minutes due at 2pm", now)], now)
            .await
            .unwrap();

        assert!(verdict.defensive);
        assert_eq!(verdict.until, Some(now + Duration::hours(2)));
    }

    #[tokio::test]
    async fn clean_headlines_do_not_engage() {
        let store = Arc::new(MemoryStore::new());
        let guard = guard(store);
        let now = Utc::now();

        let verdict = guard
            .evaluate(&[headline("Bitcoin ETF inflows continue", now)], now)
            .await
            .unwrap();

        assert!(!verdict.defensive);
        assert!(verdict.until.is_none());
    }

    #[tokio::test]
    async fn window_anchored_at_detection_time() {
        let store = Arc::new(MemoryStore::new());
        let guard = guard(store);
        let now = Utc::now();

        // Detected 90 minutes ago: only 30 minutes of protection remain.
        let verdict = guard
            .evaluate(
                &[headline("Surprise rate hike announced", now - Duration::minutes(90))],
                now,
            )
            .await
            .unwrap();

        assert!(verdict.defensive);
        assert_eq!(verdict.until, Some(now + Duration::minutes(30)));
    }

    #[tokio::test]
    async fn stale_headline_gives_no_protection() {
        let store = Arc::new(MemoryStore::new());
        let guard = guard(store);
        let now = Utc::now();

        let verdict = guard
            .evaluate(
                &[headline("war escalates", now - Duration::hours(3))],
                now,
            )
            .await
            .unwrap();

        assert!(!verdict.defensive);
    }

    #[tokio::test]
    async fn reentry_extends_never_shortens() {
        let store = Arc::new(MemoryStore::new());
        let guard = guard(store.clone());
        let now = Utc::now();

        guard
            .evaluate(&[headline("FOMC statement released", now)], now)
            .await
            .unwrap();

        // An older headline arriving later must not pull the expiry back.
        let verdict = guard
            .evaluate(
                &[headline("war fears resurface", now - Duration::hours(1))],
                now,
            )
            .await
            .unwrap();
        assert_eq!(verdict.until, Some(now + Duration::hours(2)));

        // A fresher one pushes it out.
        let later = now + Duration::minutes(30);
        let verdict = guard
            .evaluate(&[headline("another rate hike looms", later)], later)
            .await
            .unwrap();
        assert_eq!(verdict.until, Some(later + Duration::hours(2)));
    }

    #[tokio::test]
    async fn defensive_state_survives_guard_restart() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        guard(store.clone())
            .evaluate(&[headline("FOMC decision day", now)], now)
            .await
            .unwrap();

        // Fresh guard instance over the same store.
        let revived = guard(store);
        assert!(revived.is_defensive(now + Duration::hours(1)).await.unwrap());
        assert!(!revived.is_defensive(now + Duration::hours(3)).await.unwrap());
    }
}
