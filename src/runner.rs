//! Orchestration: startup reconciliation, then two independent loops.
//!
//! The fast monitor task runs the lifecycle tick on its own tokio task; the
//! slower opportunity loop (guard, dedup, decide, open) and the periodic
//! reconciler share the main `tokio::select!` loop. The tasks coordinate
//! only through the versioned store, never through in-memory flags.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::{Config, TradingMode};
use crate::decision::{DecisionConfig, FusionEngine};
use crate::error::TradingError;
use crate::exchange::Exchange;
use crate::executor::OrderExecutor;
use crate::guard::MacroGuard;
use crate::lifecycle::LifecycleEngine;
use crate::reconciler::Reconciler;
use crate::signals::SignalProvider;
use crate::store::{
    parse_state_time, PositionStore, STATE_DEFENSIVE_UNTIL, STATE_LAST_HEARTBEAT,
    STATE_LAST_RECONCILE,
};
use crate::types::{
    signal_id, Action, ExitReason, Headline, Position, PositionStatus, RejectReason, SeenSignal,
    Verdict,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct BotRunner {
    config: Config,
    store: Arc<dyn PositionStore>,
    provider: Arc<dyn SignalProvider>,
    guard: MacroGuard,
    engine: FusionEngine,
    executor: Arc<OrderExecutor>,
    lifecycle: Arc<LifecycleEngine>,
    reconciler: Arc<Reconciler>,
}

impl BotRunner {
    pub fn new(
        config: Config,
        store: Arc<dyn PositionStore>,
        exchange: Arc<dyn Exchange>,
        provider: Arc<dyn SignalProvider>,
    ) -> Self {
        let executor = Arc::new(OrderExecutor::new(
            exchange.clone(),
            store.clone(),
            config.risk.clone(),
            config.execution.clone(),
        ));
        let lifecycle = Arc::new(LifecycleEngine::new(
            exchange.clone(),
            store.clone(),
            executor.clone(),
            &config.risk,
            &config.loops,
        ));
        let reconciler = Arc::new(Reconciler::new(
            exchange,
            store.clone(),
            executor.clone(),
            &config.execution,
        ));
        let guard = MacroGuard::new(&config.guard, store.clone());
        let engine = FusionEngine::new(DecisionConfig::from(&config.risk));

        Self {
            config,
            store,
            provider,
            guard,
            engine,
            executor,
            lifecycle,
            reconciler,
        }
    }

    /// Run the bot until the process is stopped.
    pub async fn run(self) -> anyhow::Result<()> {
        match self.config.mode {
            TradingMode::Paper => info!("running in paper trading mode"),
            TradingMode::Live => warn!("running in LIVE trading mode, real funds at risk"),
        }

        // Reconciliation is mandatory before any trading: the exchange may
        // have acted while we were down.
        let report = self.reconciler.reconcile().await?;
        info!(
            checked = report.checked,
            divergences = report.divergences(),
            "startup reconciliation complete"
        );

        // Fast monitor loop on its own task.
        let lifecycle = self.lifecycle.clone();
        let monitor_interval = self.config.loops.monitor_interval;
        tokio::spawn(async move {
            let mut ticker = interval(monitor_interval);
            loop {
                ticker.tick().await;
                if let Err(err) = lifecycle.tick().await {
                    error!(%err, "monitor tick failed");
                }
            }
        });

        let mut decision_ticker = interval(self.config.loops.decision_interval);
        let mut reconcile_ticker = interval(self.config.loops.reconcile_interval);
        let mut heartbeat_ticker = interval(HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                _ = decision_ticker.tick() => {
                    if let Err(err) = self.opportunity_cycle().await {
                        error!(%err, "opportunity cycle failed");
                    }
                }
                _ = reconcile_ticker.tick() => {
                    if let Err(err) = self.reconciler.reconcile().await {
                        error!(%err, "periodic reconciliation failed");
                    }
                }
                _ = heartbeat_ticker.tick() => {
                    if let Err(err) = self
                        .store
                        .set_state(STATE_LAST_HEARTBEAT, &Utc::now().to_rfc3339())
                        .await
                    {
                        error!(%err, "heartbeat write failed");
                    }
                }
            }
        }
    }

    /// One pass of the slow loop: fetch snapshots, scan headlines, gate each
    /// candidate, open positions for approvals.
    async fn opportunity_cycle(&self) -> anyhow::Result<()> {
        let snapshots = self.provider.snapshots().await?;
        if snapshots.is_empty() {
            debug!("no candidate signals this cycle");
            return Ok(());
        }

        let now = Utc::now();
        let headlines: Vec<Headline> = snapshots
            .iter()
            .flat_map(|s| s.headlines.iter().cloned())
            .collect();
        let guard_verdict = self.guard.evaluate(&headlines, now).await?;
        if guard_verdict.defensive {
            info!(until = ?guard_verdict.until, "defensive mode active, no new entries");
        }

        for snapshot in snapshots {
            let sid = signal_id(&snapshot.news.title, &snapshot.news.source);
            if self.store.signal_seen(&sid).await? {
                debug!(signal = %sid, "signal already processed");
                continue;
            }

            let verdict = if !self.config.watchlist.contains(&snapshot.technicals.symbol) {
                Verdict::wait(RejectReason::NotInWatchlist, snapshot.ai.confidence)
            } else {
                self.engine
                    .decide(&snapshot, guard_verdict.defensive, now)
            };

            self.store
                .record_signal(SeenSignal {
                    id: sid.clone(),
                    title: snapshot.news.title.clone(),
                    source: snapshot.news.source.clone(),
                    processed_at: now,
                    action: verdict.action,
                    rejection_reason: verdict.rejection,
                })
                .await?;

            match verdict.action {
                Action::Wait => {
                    info!(
                        signal = %sid,
                        symbol = %snapshot.technicals.symbol,
                        reason = %verdict.rejection.map(|r| r.as_str()).unwrap_or("-"),
                        confidence = verdict.confidence,
                        "signal rejected"
                    );
                }
                Action::Buy => match self.executor.open(&snapshot, &verdict).await {
                    Ok(position) => {
                        info!(
                            signal = %sid,
                            trade_id = %position.id,
                            symbol = %position.symbol,
                            "entry executed"
                        );
                    }
                    Err(TradingError::MaxPositionsExceeded { current, max }) => {
                        warn!(signal = %sid, current, max, "position cap reached, skipping entry");
                    }
                    Err(TradingError::InsufficientSize { quantity, minimum, .. }) => {
                        warn!(signal = %sid, %quantity, %minimum, "position too small, skipping entry");
                    }
                    Err(err) => {
                        error!(signal = %sid, %err, "entry failed");
                    }
                },
            }
        }
        Ok(())
    }

    /// Close every open position at market. Pending entries and in-flight
    /// exits are left to reconciliation.
    pub async fn close_all(&self) -> anyhow::Result<usize> {
        self.reconciler.reconcile().await?;

        let mut closed = 0;
        for position in self.store.active_positions().await? {
            match position.status {
                PositionStatus::Open => {
                    match self.executor.close(position, ExitReason::Manual).await {
                        Ok(p) => {
                            info!(trade_id = %p.id, "position closed manually");
                            closed += 1;
                        }
                        Err(err) => error!(%err, "manual close failed"),
                    }
                }
                other => {
                    warn!(trade_id = %position.id, status = %other, "skipping non-open position");
                }
            }
        }
        Ok(closed)
    }
}

/// Point-in-time operational summary for the status command.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub active_positions: Vec<Position>,
    pub defensive_until: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_reconcile: Option<DateTime<Utc>>,
}

pub async fn gather_status(store: &dyn PositionStore) -> anyhow::Result<StatusSnapshot> {
    let read_time = |raw: Option<String>| raw.as_deref().and_then(parse_state_time);
    Ok(StatusSnapshot {
        active_positions: store.active_positions().await?,
        defensive_until: read_time(store.state(STATE_DEFENSIVE_UNTIL).await?),
        last_heartbeat: read_time(store.state(STATE_LAST_HEARTBEAT).await?),
        last_reconcile: read_time(store.state(STATE_LAST_RECONCILE).await?),
    })
}
