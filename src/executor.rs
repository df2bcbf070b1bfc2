//! Order executor: entry and exit sequencing with dual stop protection.
//!
//! Entry flow:
//!   1. size the position from risk distance, capped at a fraction of balance
//!   2. atomically reserve a PENDING_ENTRY slot in the store
//!   3. market buy with an idempotency token, confirm the fill
//!   4. place the catastrophe stop on the exchange
//!   5. promote to OPEN only once both fill and stop are confirmed
//!
//! A position is never left OPEN without stop protection: if the stop cannot
//! be placed after retries, the position is liquidated immediately and closed
//! with a diagnostic note.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::config::{ExecutionConfig, RiskConfig};
use crate::error::{ExchangeError, StoreError, TradingError};
use crate::exchange::{Exchange, OrderRecord, OrderSide, OrderState};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::PositionStore;
use crate::types::{ExitReason, Position, PositionStatus, SignalSnapshot, Verdict};

const FILL_POLL_DELAY: Duration = Duration::from_millis(500);

pub struct OrderExecutor {
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn PositionStore>,
    risk: RiskConfig,
    execution: ExecutionConfig,
    retry: RetryPolicy,
}

impl OrderExecutor {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn PositionStore>,
        risk: RiskConfig,
        execution: ExecutionConfig,
    ) -> Self {
        Self {
            exchange,
            store,
            risk,
            execution,
            retry: RetryPolicy::default(),
        }
    }

    /// Open a position for an approved candidate trade.
    pub async fn open(
        &self,
        snapshot: &SignalSnapshot,
        verdict: &Verdict,
    ) -> Result<Position, TradingError> {
        let symbol = snapshot.technicals.symbol.clone();
        let quote = quote_asset(&symbol).to_string();

        let price = with_retry(&self.retry, "price fetch", ExchangeError::is_transient, || {
            self.exchange.current_price(&symbol)
        })
        .await?;
        let balance = with_retry(&self.retry, "balance fetch", ExchangeError::is_transient, || {
            self.exchange.balance(&quote)
        })
        .await?;

        let virtual_sl = price * (Decimal::ONE + self.risk.virtual_sl_pct);
        let virtual_tp = price * (Decimal::ONE + self.risk.virtual_tp_pct);
        let catastrophe_sl = price * (Decimal::ONE + self.risk.catastrophe_sl_pct);
        let quantity = self.size_position(&symbol, balance, price, virtual_sl)?;

        let position = Position::new_pending(
            &symbol,
            quantity,
            price,
            virtual_sl,
            virtual_tp,
            catastrophe_sl,
            Some(snapshot.news.id.clone()),
            Some(verdict.reasoning.clone()),
        );

        // Cap check and insert are one atomic store step.
        let mut position = self
            .store
            .insert_position(position, self.risk.max_open_positions)
            .await
            .map_err(|e| match e {
                StoreError::CapExceeded { current, max } => {
                    TradingError::MaxPositionsExceeded { current, max }
                }
                other => other.into(),
            })?;

        info!(
            trade_id = %position.id,
            symbol,
            %quantity,
            entry = %price,
            confidence = verdict.confidence,
            "opening position"
        );

        let entry_token = format!("entry-{}", position.id);
        let order = match self
            .exchange
            .place_market_order(&symbol, OrderSide::Buy, quantity, &entry_token)
            .await
        {
            Ok(order) => order,
            Err(err) => {
                // Nothing committed on the exchange: release the slot.
                warn!(trade_id = %position.id, %err, "entry order failed, cancelling");
                position.status = PositionStatus::Cancelled;
                self.store.update_position(&position).await?;
                return Err(err.into());
            }
        };

        position.entry_order_id = Some(order.order_id.clone());
        position = self.store.update_position(&position).await?;

        let fill = if order.state == OrderState::Filled {
            order
        } else {
            match self.confirm_fill(&symbol, &order.order_id).await {
                Ok(fill) => fill,
                Err(err) => {
                    self.unwind_unconfirmed_entry(position).await;
                    return Err(err);
                }
            }
        };

        self.finish_entry(position, &fill).await
    }

    /// Complete an entry whose fill is confirmed: recompute targets from the
    /// actual fill price, place the catastrophe stop, promote to OPEN.
    ///
    /// Also used by reconciliation to resume an entry that filled while the
    /// process was down.
    pub async fn finish_entry(
        &self,
        mut position: Position,
        fill: &OrderRecord,
    ) -> Result<Position, TradingError> {
        let fill_price = fill.price.unwrap_or(position.entry_price);
        position.entry_price = fill_price;
        position.quantity = fill.quantity;
        position.virtual_sl = fill_price * (Decimal::ONE + self.risk.virtual_sl_pct);
        position.virtual_tp = fill_price * (Decimal::ONE + self.risk.virtual_tp_pct);
        position.catastrophe_sl = fill_price * (Decimal::ONE + self.risk.catastrophe_sl_pct);
        position = self.store.update_position(&position).await?;

        let stop_token = format!("stop-{}", position.id);
        let symbol = position.symbol.clone();
        let stop_result = with_retry(
            &self.retry,
            "catastrophe stop placement",
            ExchangeError::is_transient,
            || {
                self.exchange
                    .place_stop_order(&symbol, position.quantity, position.catastrophe_sl, &stop_token)
            },
        )
        .await;

        match stop_result {
            Ok(stop) => {
                position.stop_order_id = Some(stop.order_id.clone());
                position.status = PositionStatus::Open;
                let position = self.store.update_position(&position).await?;
                info!(
                    trade_id = %position.id,
                    stop_order_id = %stop.order_id,
                    catastrophe_sl = %position.catastrophe_sl,
                    virtual_sl = %position.virtual_sl,
                    virtual_tp = %position.virtual_tp,
                    "position open with dual stop protection"
                );
                Ok(position)
            }
            Err(err) => {
                error!(
                    trade_id = %position.id,
                    %err,
                    "catastrophe stop placement failed, liquidating unprotected position"
                );
                let id = position.id;
                let detail = format!("stop placement failed: {err}");
                self.emergency_liquidate(position, &detail).await?;
                Err(TradingError::UnprotectedPosition { id, detail })
            }
        }
    }

    /// Close a position: cancel the live stop, market sell, record the exit.
    pub async fn close(
        &self,
        mut position: Position,
        reason: ExitReason,
    ) -> Result<Position, TradingError> {
        let symbol = position.symbol.clone();
        info!(trade_id = %position.id, symbol, %reason, "closing position");

        if let Some(stop_id) = position.stop_order_id.clone() {
            match self.exchange.cancel_order(&symbol, &stop_id).await {
                Ok(()) => info!(trade_id = %position.id, stop_order_id = %stop_id, "catastrophe stop cancelled"),
                Err(ExchangeError::OrderNotFound(_)) => {}
                Err(err) => warn!(trade_id = %position.id, %err, "failed to cancel catastrophe stop"),
            }
        }

        let exit_token = format!("exit-{}", position.id);
        let quantity = position.quantity;
        let order = with_retry(&self.retry, "exit order", ExchangeError::is_transient, || {
            self.exchange
                .place_market_order(&symbol, OrderSide::Sell, quantity, &exit_token)
        })
        .await?;

        let fill = if order.state == OrderState::Filled {
            order
        } else {
            self.confirm_fill(&symbol, &order.order_id).await?
        };

        position.exit_order_id = Some(fill.order_id.clone());
        position.close(fill.price, reason, Utc::now());
        let position = self.persist_close(position).await?;

        if let (Some(amount), Some(percent)) = (position.pnl_amount, position.pnl_percent) {
            info!(
                trade_id = %position.id,
                %reason,
                exit = %position.exit_price.unwrap_or(Decimal::ZERO),
                pnl = %amount,
                pnl_pct = %(percent * Decimal::ONE_HUNDRED),
                "position closed"
            );
        }
        Ok(position)
    }

    /// Sell out an unprotected position immediately and record it as a
    /// manual close with a diagnostic note. If even the liquidation sell
    /// fails, the position is parked in EXIT_IN_PROGRESS for the reconciler
    /// to retry.
    pub async fn emergency_liquidate(
        &self,
        mut position: Position,
        detail: &str,
    ) -> Result<Position, TradingError> {
        warn!(trade_id = %position.id, detail, "emergency liquidation");

        let note = match position.reasoning.take() {
            Some(existing) => format!("{existing} | emergency liquidation: {detail}"),
            None => format!("emergency liquidation: {detail}"),
        };
        position.reasoning = Some(note);

        let symbol = position.symbol.clone();
        let quantity = position.quantity;
        let token = format!("liq-{}", position.id);
        let sell = with_retry(&self.retry, "liquidation sell", ExchangeError::is_transient, || {
            self.exchange
                .place_market_order(&symbol, OrderSide::Sell, quantity, &token)
        })
        .await;

        match sell {
            Ok(order) => {
                position.exit_order_id = Some(order.order_id.clone());
                position.close(order.price, ExitReason::Manual, Utc::now());
                self.persist_close(position).await
            }
            Err(err) => {
                error!(
                    trade_id = %position.id,
                    %err,
                    "liquidation sell failed, parking for reconciliation"
                );
                position.status = PositionStatus::ExitInProgress;
                position.exit_reason = Some(ExitReason::Manual);
                self.store.update_position(&position).await?;
                Err(err.into())
            }
        }
    }

    /// Entry fill never confirmed: cancel what we can, liquidate anything
    /// that did fill, and make sure the row does not stay PENDING_ENTRY.
    /// Only this order's own state decides whether funds were committed;
    /// symbol-level holdings may belong to other open positions.
    async fn unwind_unconfirmed_entry(&self, mut position: Position) {
        error!(trade_id = %position.id, "entry fill unconfirmed, unwinding");

        let mut fill = None;
        if let Some(order_id) = position.entry_order_id.clone() {
            if let Err(err) = self.exchange.cancel_order(&position.symbol, &order_id).await {
                warn!(trade_id = %position.id, %err, "could not cancel unconfirmed entry");
            }
            match self.exchange.order_status(&position.symbol, &order_id).await {
                Ok(Some(order)) if order.state == OrderState::Filled => fill = Some(order),
                Ok(_) => {}
                Err(err) => {
                    warn!(trade_id = %position.id, %err, "could not re-check unconfirmed entry")
                }
            }
        }

        match fill {
            Some(order) => {
                position.quantity = order.quantity;
                if let Some(price) = order.price {
                    position.entry_price = price;
                }
                let _ = self
                    .emergency_liquidate(position, "entry fill unconfirmed")
                    .await;
            }
            None => {
                position.status = PositionStatus::Cancelled;
                if let Err(err) = self.store.update_position(&position).await {
                    error!(trade_id = %position.id, %err, "failed to cancel unconfirmed entry row");
                }
            }
        }
    }

    /// Poll an order until it fills, with a bounded attempt budget.
    pub async fn confirm_fill(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderRecord, TradingError> {
        for _ in 0..self.execution.fill_confirm_attempts {
            match self.exchange.order_status(symbol, order_id).await {
                Ok(Some(order)) if order.state == OrderState::Filled => return Ok(order),
                Ok(_) => {}
                Err(err) if err.is_transient() => {
                    warn!(order_id, %err, "fill poll failed, will retry")
                }
                Err(err) => return Err(err.into()),
            }
            tokio::time::sleep(FILL_POLL_DELAY).await;
        }
        Err(TradingError::FillUnconfirmed {
            order_id: order_id.to_string(),
            attempts: self.execution.fill_confirm_attempts,
        })
    }

    /// Persist a close through the versioned update. A conflicting write
    /// means another task touched the position first; re-read and either
    /// accept its terminal state or re-apply the close on the fresh copy.
    async fn persist_close(&self, position: Position) -> Result<Position, TradingError> {
        match self.store.update_position(&position).await {
            Ok(stored) => Ok(stored),
            Err(StoreError::VersionConflict { .. }) => {
                let mut fresh = self.store.position(position.id).await?;
                if fresh.status.is_terminal() {
                    return Ok(fresh);
                }
                fresh.exit_order_id = position.exit_order_id.clone();
                fresh.close(
                    position.exit_price,
                    position.exit_reason.unwrap_or(ExitReason::Manual),
                    position.closed_at.unwrap_or_else(Utc::now),
                );
                Ok(self.store.update_position(&fresh).await?)
            }
            Err(StoreError::Terminal(_)) => Ok(self.store.position(position.id).await?),
            Err(err) => Err(err.into()),
        }
    }

    /// Risk-based sizing: quantity such that a move from entry to the
    /// virtual stop loses `max_risk_per_trade` of balance, capped at
    /// `max_position_fraction` of balance, floored to the exchange step.
    fn size_position(
        &self,
        symbol: &str,
        balance: Decimal,
        entry_price: Decimal,
        virtual_sl: Decimal,
    ) -> Result<Decimal, TradingError> {
        let minimum = self.exchange.min_quantity(symbol);
        let risk_per_unit = entry_price - virtual_sl;
        if risk_per_unit <= Decimal::ZERO || entry_price <= Decimal::ZERO {
            return Err(TradingError::InsufficientSize {
                symbol: symbol.to_string(),
                quantity: Decimal::ZERO,
                minimum,
            });
        }

        let risk_amount = balance * self.risk.max_risk_per_trade;
        let mut quantity = risk_amount / risk_per_unit;

        let max_quantity = balance * self.risk.max_position_fraction / entry_price;
        if quantity > max_quantity {
            quantity = max_quantity;
        }

        let step = self.exchange.quantity_step(symbol);
        if step > Decimal::ZERO {
            quantity = (quantity / step).floor() * step;
        }

        if quantity < minimum {
            return Err(TradingError::InsufficientSize {
                symbol: symbol.to_string(),
                quantity,
                minimum,
            });
        }
        Ok(quantity)
    }
}

fn quote_asset(symbol: &str) -> &str {
    symbol.split('/').nth(1).unwrap_or("USDT")
}
