//! Position lifecycle engine: the fast monitoring tick.
//!
//! Each tick walks every non-terminal position and applies exit triggers in
//! precedence order. The exchange's own record of the catastrophe stop is
//! authoritative and checked first; virtual triggers only fire on positions
//! the exchange still shows as protected.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::{LoopConfig, RiskConfig};
use crate::error::{StoreError, TradingError};
use crate::exchange::{Exchange, OrderState};
use crate::executor::OrderExecutor;
use crate::store::PositionStore;
use crate::types::{ExitReason, Position, PositionStatus};

pub struct LifecycleEngine {
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn PositionStore>,
    executor: Arc<OrderExecutor>,
    max_trade_duration: chrono::Duration,
    tp_before_decay: bool,
}

impl LifecycleEngine {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn PositionStore>,
        executor: Arc<OrderExecutor>,
        risk: &RiskConfig,
        loops: &LoopConfig,
    ) -> Self {
        Self {
            exchange,
            store,
            executor,
            max_trade_duration: risk.max_trade_duration,
            tp_before_decay: loops.tp_before_decay,
        }
    }

    /// One monitoring pass. Per-position failures are logged and skipped so
    /// one bad symbol cannot stall the others. Returns the number of
    /// positions examined.
    pub async fn tick(&self) -> Result<usize, StoreError> {
        let positions = self.store.active_positions().await?;
        let checked = positions.len();

        for position in positions {
            let id = position.id;
            if let Err(err) = self.check_position(position).await {
                error!(trade_id = %id, %err, "lifecycle check failed");
            }
        }
        Ok(checked)
    }

    async fn check_position(&self, position: Position) -> Result<(), TradingError> {
        match position.status {
            PositionStatus::Open => self.check_open(position).await,
            PositionStatus::ExitInProgress => self.finish_exit(position).await,
            // Entries in flight belong to the executor or the reconciler.
            _ => Ok(()),
        }
    }

    async fn check_open(&self, position: Position) -> Result<(), TradingError> {
        // The exchange stop is authoritative: if it filled, the position is
        // already closed out there, whatever our local state says.
        if let Some(stop_id) = position.stop_order_id.clone() {
            if let Some(stop) = self
                .exchange
                .order_status(&position.symbol, &stop_id)
                .await?
            {
                if stop.state == OrderState::Filled {
                    return self.record_catastrophe(position, stop.price).await;
                }
            }
        }

        let price = self.exchange.current_price(&position.symbol).await?;
        let now = Utc::now();

        let trigger = if position.virtual_sl_hit(price) {
            Some(ExitReason::VirtualSl)
        } else {
            let tp = position.virtual_tp_hit(price);
            let decayed = position.age(now) > self.max_trade_duration;
            if self.tp_before_decay {
                if tp {
                    Some(ExitReason::VirtualTp)
                } else if decayed {
                    Some(ExitReason::TimeDecay)
                } else {
                    None
                }
            } else if decayed {
                Some(ExitReason::TimeDecay)
            } else if tp {
                Some(ExitReason::VirtualTp)
            } else {
                None
            }
        };

        let trigger = trigger.or(if position.manual_close_requested {
            Some(ExitReason::Manual)
        } else {
            None
        });

        let Some(reason) = trigger else {
            debug!(trade_id = %position.id, %price, "position within bounds");
            return Ok(());
        };

        info!(
            trade_id = %position.id,
            symbol = %position.symbol,
            %price,
            %reason,
            "exit trigger fired"
        );
        self.begin_exit(position, reason).await
    }

    /// OPEN -> EXIT_IN_PROGRESS via compare-and-swap, then submit the exit.
    /// Losing the swap means another task (usually the reconciler) got there
    /// first; the trigger is abandoned and re-evaluated next tick.
    async fn begin_exit(&self, mut position: Position, reason: ExitReason) -> Result<(), TradingError> {
        position.status = PositionStatus::ExitInProgress;
        position.exit_reason = Some(reason);

        let position = match self.store.update_position(&position).await {
            Ok(updated) => updated,
            Err(StoreError::VersionConflict { .. }) | Err(StoreError::Terminal(_)) => {
                warn!(
                    trade_id = %position.id,
                    %reason,
                    "exit trigger lost a write race, deferring"
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        self.executor.close(position, reason).await?;
        Ok(())
    }

    /// Drive an EXIT_IN_PROGRESS position to completion: finalize a filled
    /// exit order, or re-submit if the exit was never placed.
    async fn finish_exit(&self, mut position: Position) -> Result<(), TradingError> {
        // The catastrophe stop may have filled between the state transition
        // and the exit order reaching the exchange. The stop fill is
        // authoritative and supersedes whatever virtual trigger started the
        // exit; a market sell now would be selling an asset already gone.
        if let Some(stop_id) = position.stop_order_id.clone() {
            if let Some(stop) = self
                .exchange
                .order_status(&position.symbol, &stop_id)
                .await?
            {
                if stop.state == OrderState::Filled {
                    return self.record_catastrophe(position, stop.price).await;
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
                        info!(trade_id = %position.id, %reason, "exit finalized");
                        Ok(())
                    }
                    Some(_) => Ok(()), // still working on the exchange
                    None => {
                        warn!(trade_id = %position.id, order_id, "exit order vanished, re-submitting");
                        self.executor.close(position, reason).await?;
                        Ok(())
                    }
                }
            }
            None => {
                // Crash landed between the state transition and the order.
                warn!(trade_id = %position.id, "exit in progress with no order, re-submitting");
                self.executor.close(position, reason).await?;
                Ok(())
            }
        }
    }

    async fn record_catastrophe(
        &self,
        mut position: Position,
        fill_price: Option<rust_decimal::Decimal>,
    ) -> Result<(), TradingError> {
        warn!(
            trade_id = %position.id,
            symbol = %position.symbol,
            fill = ?fill_price,
            "catastrophe stop filled on exchange"
        );
        position.close(fill_price, ExitReason::Catastrophe, Utc::now());
        match self.store.update_position(&position).await {
            Ok(_) => Ok(()),
            Err(StoreError::VersionConflict { .. }) | Err(StoreError::Terminal(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
