//! Trading controller entry point.
//!
//! Gates candidate trades through hard capital-preservation rules, executes
//! entries with dual stop-loss protection, and reconciles local state
//! against the exchange on every start.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use fusion_trader::config::{Config, TradingMode};
use fusion_trader::exchange::{BrokerGatewayClient, Exchange, PaperExchange};
use fusion_trader::runner::{gather_status, BotRunner};
use fusion_trader::signals::SignalServiceClient;
use fusion_trader::store::FileStore;

#[derive(Parser)]
#[command(name = "fusion-trader", about = "News-driven trading bot with dual stop protection")]
struct Cli {
    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trading loops (default)
    Run,
    /// Print open positions and system state
    Status,
    /// Close every open position at market
    CloseAll {
        /// Confirm the close without prompting
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = Config::from_env()?;

    let exchange: Arc<dyn Exchange> = match config.mode {
        TradingMode::Paper => {
            let paper = PaperExchange::new("10000".parse()?);
            Arc::new(paper)
        }
        TradingMode::Live => Arc::new(BrokerGatewayClient::new(
            &config.exchange.exchange_url,
            &config.exchange.api_key,
            config.execution.call_timeout,
        )?),
    };
    let store = Arc::new(FileStore::open(&config.state_path).await?);
    let provider = Arc::new(SignalServiceClient::new(
        &config.exchange.signal_url,
        config.execution.call_timeout,
    )?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            info!("starting trading controller");
            let runner = BotRunner::new(config, store, exchange, provider);
            runner.run().await
        }
        Command::Status => {
            let status = gather_status(store.as_ref()).await?;
            println!("active positions: {}", status.active_positions.len());
            for p in &status.active_positions {
                println!(
                    "  {} {} {} qty {} entry {} status {}",
                    p.id, p.symbol, p.side, p.quantity, p.entry_price, p.status
                );
            }
            match status.defensive_until {
                Some(until) => println!("defensive until: {until}"),
                None => println!("defensive mode: off"),
            }
            if let Some(hb) = status.last_heartbeat {
                println!("last heartbeat: {hb}");
            }
            if let Some(rec) = status.last_reconcile {
                println!("last reconcile: {rec}");
            }
            Ok(())
        }
        Command::CloseAll { yes } => {
            if !yes {
                anyhow::bail!("refusing to close all positions without --yes");
            }
            let runner = BotRunner::new(config, store, exchange, provider);
            let closed = runner.close_all().await?;
            println!("closed {closed} positions");
            Ok(())
        }
    }
}
