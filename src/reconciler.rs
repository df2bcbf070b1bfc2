//! Reconciliation: exchange truth wins over local state.
//!
//! Runs blocking at startup before any trading loop (the exchange may have
//! acted while we were down) and periodically afterwards. Every divergence
//! between the store and the exchange is resolved toward the exchange and
//! logged as an audit event.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::ExecutionConfig;
use crate::error::{StoreError, TradingError};
use crate::exchange::{Exchange, OrderState};
use crate::executor::OrderExecutor;
use crate::store::{PositionStore, STATE_LAST_RECONCILE};
use crate::types::{ExitReason, Position, PositionStatus};

/// Summary of one reconciliation pass.
#[derive(Debug, Default, Clone)]
pub struct ReconciliationReport {
    pub checked: usize,
    pub in_sync: usize,
    /// Catastrophe stops that filled while we were not watching.
    pub catastrophe_closures: usize,
    /// Positions whose base asset vanished with no stop fill on record.
    pub external_closures: usize,
    /// Stale or unfilled entries cancelled.
    pub cancelled_entries: usize,
    /// Entries that filled while down and were promoted (or liquidated).
    pub resumed_entries: usize,
    /// Orphaned exits re-submitted or finalized.
    pub repaired_exits: usize,
    pub errors: usize,
}

impl ReconciliationReport {
    pub fn divergences(&self) -> usize {
        self.catastrophe_closures
            + self.external_closures
            + self.cancelled_entries
            + self.resumed_entries
            + self.repaired_exits
    }
}

pub struct Reconciler {
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn PositionStore>,
    executor: Arc<OrderExecutor>,
    entry_fill_grace: chrono::Duration,
}

impl Reconciler {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn PositionStore>,
        executor: Arc<OrderExecutor>,
        execution: &ExecutionConfig,
    ) -> Self {
        Self {
            exchange,
            store,
            executor,
            entry_fill_grace: execution.entry_fill_grace,
        }
    }

    /// One full pass over all non-terminal positions.
    pub async fn reconcile(&self) -> Result<ReconciliationReport, StoreError> {
        let positions = self.store.active_positions().await?;
        let mut report = ReconciliationReport {
            checked: positions.len(),
            ..Default::default()
        };

        for position in positions {
            let id = position.id;
            if let Err(err) = self.reconcile_position(position, &mut report).await {
                report.errors += 1;
                error!(trade_id = %id, %err, "reconciliation failed for position");
            }
        }

        self.store
            .set_state(STATE_LAST_RECONCILE, &Utc::now().to_rfc3339())
            .await?;

        if report.divergences() > 0 || report.errors > 0 {
            warn!(
                checked = report.checked,
                catastrophe = report.catastrophe_closures,
                external = report.external_closures,
                cancelled = report.cancelled_entries,
                resumed = report.resumed_entries,
                repaired = report.repaired_exits,
                errors = report.errors,
                "reconciliation found divergences"
            );
        } else {
            info!(checked = report.checked, "reconciliation clean");
        }
        Ok(report)
    }

    async fn reconcile_position(
        &self,
        position: Position,
        report: &mut ReconciliationReport,
    ) -> Result<(), TradingError> {
        match position.status {
            PositionStatus::PendingEntry => self.reconcile_pending_entry(position, report).await,
            PositionStatus::Open => self.reconcile_open(position, report).await,
            PositionStatus::ExitInProgress => self.reconcile_exit(position, report).await,
            _ => Ok(()),
        }
    }

    /// An entry that was in flight when we went down. Either it filled (take
    /// over and protect it), it is still resting within the grace window
    /// (leave it), or it is stale (cancel it).
    async fn reconcile_pending_entry(
        &self,
        mut position: Position,
        report: &mut ReconciliationReport,
    ) -> Result<(), TradingError> {
        // The order id may never have been persisted (crash between
        // submission and the store write). The idempotency token is derived
        // from the position id, so the exchange can still be asked whether
        // the submission landed before assuming no funds were committed.
        let order = match position.entry_order_id.clone() {
            Some(order_id) => {
                self.exchange
                    .order_status(&position.symbol, &order_id)
                    .await?
            }
            None => {
                let token = format!("entry-{}", position.id);
                let found = self
                    .exchange
                    .order_by_client_id(&position.symbol, &token)
                    .await?;
                if let Some(order) = &found {
                    warn!(
                        trade_id = %position.id,
                        order_id = %order.order_id,
                        "recovered unpersisted entry order by token"
                    );
                    position.entry_order_id = Some(order.order_id.clone());
                    position = self.store.update_position(&position).await?;
                }
                found
            }
        };

        match order {
            Some(order) if order.state == OrderState::Filled => {
                warn!(
                    trade_id = %position.id,
                    order_id = %order.order_id,
                    "entry filled while down, resuming protection"
                );
                // finish_entry places the stop and promotes to OPEN, or
                // liquidates if the stop cannot be placed.
                match self.executor.finish_entry(position, &order).await {
                    Ok(_) | Err(TradingError::UnprotectedPosition { .. }) => {
                        report.resumed_entries += 1;
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            Some(order) if order.state == OrderState::Cancelled => {
                warn!(trade_id = %position.id, order_id = %order.order_id, "entry cancelled on exchange");
                position.status = PositionStatus::Cancelled;
                self.store.update_position(&position).await?;
                report.cancelled_entries += 1;
                Ok(())
            }
            Some(order) if position.age(Utc::now()) > self.entry_fill_grace => {
                warn!(trade_id = %position.id, order_id = %order.order_id, "entry unfilled past grace, cancelling");
                if let Err(err) = self
                    .exchange
                    .cancel_order(&position.symbol, &order.order_id)
                    .await
                {
                    warn!(trade_id = %position.id, %err, "cancel of stale entry failed");
                }
                position.status = PositionStatus::Cancelled;
                self.store.update_position(&position).await?;
                report.cancelled_entries += 1;
                Ok(())
            }
            Some(_) => {
                report.in_sync += 1;
                Ok(())
            }
            None => {
                warn!(trade_id = %position.id, "no entry order on the exchange, cancelling");
                position.status = PositionStatus::Cancelled;
                self.store.update_position(&position).await?;
                report.cancelled_entries += 1;
                Ok(())
            }
        }
    }

    async fn reconcile_open(
        &self,
        mut position: Position,
        report: &mut ReconciliationReport,
    ) -> Result<(), TradingError> {
        // Did the catastrophe stop fill while we were down?
        if let Some(stop_id) = position.stop_order_id.clone() {
            if let Some(stop) = self
                .exchange
                .order_status(&position.symbol, &stop_id)
                .await?
            {
                if stop.state == OrderState::Filled {
                    warn!(
                        trade_id = %position.id,
                        symbol = %position.symbol,
                        fill = ?stop.price,
                        "catastrophe stop filled while down, recording close"
                    );
                    position.close(stop.price, ExitReason::Catastrophe, Utc::now());
                    self.store.update_position(&position).await?;
                    report.catastrophe_closures += 1;
                    return Ok(());
                }
            }
        }

        // No stop fill on record: does the exchange still hold the asset?
        let held = self.exchange.position_size(&position.symbol).await?;
        if held < position.quantity {
            warn!(
                trade_id = %position.id,
                symbol = %position.symbol,
                %held,
                expected = %position.quantity,
                "base asset gone without stop fill, closing as external"
            );
            // Cost basis of the external close is unknown; P&L stays unset.
            if let Some(stop_id) = position.stop_order_id.clone() {
                if let Err(err) = self.exchange.cancel_order(&position.symbol, &stop_id).await {
                    warn!(trade_id = %position.id, %err, "orphaned stop cancel failed");
                }
            }
            position.close(None, ExitReason::ReconciledExternal, Utc::now());
            self.store.update_position(&position).await?;
            report.external_closures += 1;
            return Ok(());
        }

        report.in_sync += 1;
        Ok(())
    }

    /// EXIT_IN_PROGRESS rows left behind by a crash: finalize a filled exit,
    /// re-submit a missing one, leave a resting one alone. A filled
    /// catastrophe stop takes precedence over all of those; the asset is
    /// already sold and re-submitting an exit would be rejected forever.
    async fn reconcile_exit(
        &self,
        mut position: Position,
        report: &mut ReconciliationReport,
    ) -> Result<(), TradingError> {
        if let Some(stop_id) = position.stop_order_id.clone() {
            if let Some(stop) = self
                .exchange
                .order_status(&position.symbol, &stop_id)
                .await?
            {
                if stop.state == OrderState::Filled {
                    warn!(
                        trade_id = %position.id,
                        symbol = %position.symbol,
                        fill = ?stop.price,
                        "catastrophe stop filled during exit, recording close"
                    );
                    position.close(stop.price, ExitReason::Catastrophe, Utc::now());
                    self.store.update_position(&position).await?;
                    report.catastrophe_closures += 1;
                    return Ok(());
                }
            }
        }

        let reason = position.exit_reason.unwrap_or(ExitReason::Manual);

        match position.exit_order_id.clone() {
            Some(order_id) => {
                match self
                    .exchange
                    .order_status(&position.symbol, &order_id)
                    .await?
                {
                    Some(order) if order.state == OrderState::Filled => {
                        position.close(order.price, reason, Utc::now());
                        self.store.update_position(&position).await?;
                        report.repaired_exits += 1;
                        info!(trade_id = %position.id, %reason, "orphaned exit finalized");
                        Ok(())
                    }
                    Some(_) => {
                        report.in_sync += 1;
                        Ok(())
                    }
                    None => {
                        warn!(trade_id = %position.id, "exit order unknown, re-submitting");
                        self.executor.close(position, reason).await?;
                        report.repaired_exits += 1;
                        Ok(())
                    }
                }
            }
            None => {
                warn!(trade_id = %position.id, %reason, "exit never submitted, re-submitting");
                self.executor.close(position, reason).await?;
                report.repaired_exits += 1;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::exchange::{OrderSide, PaperExchange};
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn risk() -> RiskConfig {
        RiskConfig {
            max_risk_per_trade: dec("0.02"),
            max_position_fraction: dec("0.30"),
            max_open_positions: 3,
            virtual_sl_pct: dec("-0.02"),
            virtual_tp_pct: dec("0.04"),
            catastrophe_sl_pct: dec("-0.10"),
            max_trade_duration: ChronoDuration::hours(4),
            min_confidence: 70,
            max_price_move_pct: dec("0.015"),
            max_signal_age: ChronoDuration::hours(2),
            rsi_overbought: 70.0,
        }
    }

    fn execution() -> ExecutionConfig {
        ExecutionConfig {
            call_timeout: Duration::from_secs(5),
            fill_confirm_attempts: 3,
            entry_fill_grace: ChronoDuration::minutes(5),
        }
    }

    struct Harness {
        exchange: Arc<PaperExchange>,
        store: Arc<MemoryStore>,
        reconciler: Reconciler,
    }

    fn harness() -> Harness {
        let exchange = Arc::new(PaperExchange::new(dec("100000")));
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(OrderExecutor::new(
            exchange.clone(),
            store.clone(),
            risk(),
            execution(),
        ));
        let reconciler = Reconciler::new(exchange.clone(), store.clone(), executor, &execution());
        Harness {
            exchange,
            store,
            reconciler,
        }
    }

    /// Build an OPEN position backed by real paper-exchange orders, as the
    /// executor would have left it before a crash.
    async fn seed_open_position(h: &Harness, symbol: &str, price: &str) -> Position {
        h.exchange.set_price(symbol, dec(price));
        let entry = h
            .exchange
            .place_market_order(symbol, OrderSide::Buy, dec("0.1"), "seed-entry")
            .await
            .unwrap();
        let entry_price = entry.price.unwrap();
        let stop = h
            .exchange
            .place_stop_order(symbol, dec("0.1"), entry_price * dec("0.90"), "seed-stop")
            .await
            .unwrap();

        let mut position = Position::new_pending(
            symbol,
            dec("0.1"),
            entry_price,
            entry_price * dec("0.98"),
            entry_price * dec("1.04"),
            entry_price * dec("0.90"),
            None,
            None,
        );
        position.entry_order_id = Some(entry.order_id);
        position.stop_order_id = Some(stop.order_id);
        position.status = PositionStatus::Open;
        h.store.insert_position(position, 3).await.unwrap()
    }

    #[tokio::test]
    async fn clean_state_reports_in_sync() {
        let h = harness();
        seed_open_position(&h, "BTC/USDT", "50000").await;

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.in_sync, 1);
        assert_eq!(report.divergences(), 0);
    }

    #[tokio::test]
    async fn stop_filled_while_down_closes_at_exchange_fill_price() {
        let h = harness();
        let position = seed_open_position(&h, "BTC/USDT", "50000").await;
        let stop_id = position.stop_order_id.clone().unwrap();

        // The exchange acts while the bot is "down".
        h.exchange.fill_stop(&stop_id);

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.catastrophe_closures, 1);

        let closed = h.store.position(position.id).await.unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.exit_reason, Some(ExitReason::Catastrophe));
        assert_eq!(closed.exit_price, Some(position.catastrophe_sl));
        assert!(closed.pnl_amount.unwrap() < Decimal::ZERO);
    }

    #[tokio::test]
    async fn vanished_asset_closes_as_external_with_unknown_pnl() {
        let h = harness();
        let position = seed_open_position(&h, "BTC/USDT", "50000").await;

        h.exchange.drain_asset("BTC");

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.external_closures, 1);

        let closed = h.store.position(position.id).await.unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.exit_reason, Some(ExitReason::ReconciledExternal));
        assert!(closed.pnl_amount.is_none());
        assert!(closed.exit_price.is_none());
    }

    #[tokio::test]
    async fn entry_filled_while_down_is_resumed_with_protection() {
        let h = harness();
        h.exchange.set_price("BTC/USDT", dec("50000"));

        let entry = h
            .exchange
            .place_market_order("BTC/USDT", OrderSide::Buy, dec("0.1"), "resume-entry")
            .await
            .unwrap();

        let mut position = Position::new_pending(
            "BTC/USDT",
            dec("0.1"),
            dec("50000"),
            dec("49000"),
            dec("52000"),
            dec("45000"),
            None,
            None,
        );
        position.entry_order_id = Some(entry.order_id);
        let position = h.store.insert_position(position, 3).await.unwrap();

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.resumed_entries, 1);

        let resumed = h.store.position(position.id).await.unwrap();
        assert_eq!(resumed.status, PositionStatus::Open);
        assert!(resumed.stop_order_id.is_some());
    }

    #[tokio::test]
    async fn unpersisted_entry_order_is_recovered_by_token() {
        let h = harness();
        h.exchange.set_price("BTC/USDT", dec("50000"));

        // Crash between submission and persisting the order id: the row has
        // no order id but the exchange accepted (and filled) the buy under
        // the position's idempotency token.
        let position = Position::new_pending(
            "BTC/USDT",
            dec("0.1"),
            dec("50000"),
            dec("49000"),
            dec("52000"),
            dec("45000"),
            None,
            None,
        );
        let token = format!("entry-{}", position.id);
        h.exchange
            .place_market_order("BTC/USDT", OrderSide::Buy, dec("0.1"), &token)
            .await
            .unwrap();
        let position = h.store.insert_position(position, 3).await.unwrap();

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.resumed_entries, 1);
        assert_eq!(report.cancelled_entries, 0);

        // The filled buy is taken over and protected, not abandoned.
        let resumed = h.store.position(position.id).await.unwrap();
        assert_eq!(resumed.status, PositionStatus::Open);
        assert!(resumed.entry_order_id.is_some());
        assert!(resumed.stop_order_id.is_some());
    }

    #[tokio::test]
    async fn entry_with_no_order_is_cancelled() {
        let h = harness();
        h.exchange.set_price("BTC/USDT", dec("50000"));

        let position = Position::new_pending(
            "BTC/USDT",
            dec("0.1"),
            dec("50000"),
            dec("49000"),
            dec("52000"),
            dec("45000"),
            None,
            None,
        );
        let position = h.store.insert_position(position, 3).await.unwrap();

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.cancelled_entries, 1);

        let cancelled = h.store.position(position.id).await.unwrap();
        assert_eq!(cancelled.status, PositionStatus::Cancelled);
    }

    #[tokio::test]
    async fn stale_resting_entry_is_cancelled() {
        let h = harness();
        h.exchange.set_price("BTC/USDT", dec("50000"));

        // A resting (never filled) order: use a stop order as a stand-in for
        // an unfilled entry on the book.
        let resting = h
            .exchange
            .place_stop_order("BTC/USDT", dec("0.1"), dec("1"), "stale-entry")
            .await
            .unwrap();

        let mut position = Position::new_pending(
            "BTC/USDT",
            dec("0.1"),
            dec("50000"),
            dec("49000"),
            dec("52000"),
            dec("45000"),
            None,
            None,
        );
        position.entry_order_id = Some(resting.order_id.clone());
        position.opened_at = Utc::now() - ChronoDuration::minutes(10);
        let position = h.store.insert_position(position, 3).await.unwrap();

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.cancelled_entries, 1);

        let cancelled = h.store.position(position.id).await.unwrap();
        assert_eq!(cancelled.status, PositionStatus::Cancelled);
        let order = h
            .exchange
            .order_status("BTC/USDT", &resting.order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.state, OrderState::Cancelled);
    }

    #[tokio::test]
    async fn stop_filled_during_exit_closes_as_catastrophe() {
        let h = harness();
        let mut position = seed_open_position(&h, "BTC/USDT", "50000").await;
        let stop_id = position.stop_order_id.clone().unwrap();

        // Down after the virtual SL transition but before the exit order;
        // the market gaps through the catastrophe stop in the meantime.
        position.status = PositionStatus::ExitInProgress;
        position.exit_reason = Some(ExitReason::VirtualSl);
        h.store.update_position(&position).await.unwrap();
        h.exchange.fill_stop(&stop_id);

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.catastrophe_closures, 1);
        assert_eq!(report.errors, 0);

        let closed = h.store.position(position.id).await.unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.exit_reason, Some(ExitReason::Catastrophe));
        assert_eq!(closed.exit_price, Some(position.catastrophe_sl));

        // The slot is freed and the next pass has nothing to repair.
        assert_eq!(h.store.active_count().await.unwrap(), 0);
        let next = h.reconciler.reconcile().await.unwrap();
        assert_eq!(next.divergences(), 0);
    }

    #[tokio::test]
    async fn exit_without_order_is_resubmitted() {
        let h = harness();
        let mut position = seed_open_position(&h, "BTC/USDT", "50000").await;

        position.status = PositionStatus::ExitInProgress;
        position.exit_reason = Some(ExitReason::TimeDecay);
        h.store.update_position(&position).await.unwrap();

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.repaired_exits, 1);

        let closed = h.store.position(position.id).await.unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.exit_reason, Some(ExitReason::TimeDecay));
        assert!(closed.exit_order_id.is_some());
    }
}
