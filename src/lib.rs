//! Autonomous trading controller: decision gate and position lifecycle
//! engine with dual stop-loss protection.
//!
//! Signal ingestion, indicators and AI reasoning live behind the
//! `SignalProvider` boundary; this crate decides, executes, monitors and
//! reconciles.

pub mod config;
pub mod decision;
pub mod error;
pub mod exchange;
pub mod executor;
pub mod guard;
pub mod lifecycle;
pub mod reconciler;
pub mod retry;
pub mod runner;
pub mod signals;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use config::{Config, TradingMode};
pub use decision::{DecisionConfig, FusionEngine};
pub use error::{ConfigError, ExchangeError, StoreError, TradingError};
pub use exchange::{BrokerGatewayClient, Exchange, OrderRecord, OrderSide, OrderState, PaperExchange};
pub use executor::OrderExecutor;
pub use guard::MacroGuard;
pub use lifecycle::LifecycleEngine;
pub use reconciler::{ReconciliationReport, Reconciler};
pub use runner::{gather_status, BotRunner, StatusSnapshot};
pub use signals::{SignalProvider, SignalServiceClient};
pub use store::{FileStore, MemoryStore, PositionStore};
pub use types::{
    Action, ExitReason, GuardVerdict, Headline, MacroEvent, Position, PositionStatus, RejectReason,
    SeenSignal, Side, SignalSnapshot, Verdict,
};
