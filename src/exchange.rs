//! Exchange boundary: capability trait, paper simulator, live REST client.
//!
//! The executor, lifecycle engine and reconciler all talk to `dyn Exchange`.
//! Paper mode runs against the in-process simulator; live mode goes through
//! a broker gateway over HTTP.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ExchangeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    StopLoss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Open,
    Filled,
    Cancelled,
}

/// An order as the exchange sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    /// Idempotency token supplied at submission. Resubmitting with the same
    /// token returns the original order.
    pub client_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    /// Fill price once `state == Filled`.
    pub price: Option<Decimal>,
    /// Trigger price for stop orders.
    pub stop_price: Option<Decimal>,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
}

/// Exchange capability used by the execution side.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn current_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Free balance of a currency, e.g. "USDT".
    async fn balance(&self, currency: &str) -> Result<Decimal, ExchangeError>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        client_id: &str,
    ) -> Result<OrderRecord, ExchangeError>;

    /// Sell-side stop placed below market; fills when price trades through
    /// the trigger.
    async fn place_stop_order(
        &self,
        symbol: &str,
        quantity: Decimal,
        stop_price: Decimal,
        client_id: &str,
    ) -> Result<OrderRecord, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;

    /// None when the exchange has no record of the order.
    async fn order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<OrderRecord>, ExchangeError>;

    /// Look up an order by its idempotency token. None when the exchange
    /// never accepted an order with that token, which proves the submission
    /// never happened.
    async fn order_by_client_id(
        &self,
        symbol: &str,
        client_id: &str,
    ) -> Result<Option<OrderRecord>, ExchangeError>;

    /// Free balance of the base asset of a symbol.
    async fn position_size(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    fn min_quantity(&self, symbol: &str) -> Decimal;

    fn quantity_step(&self, symbol: &str) -> Decimal;
}

fn base_asset(symbol: &str) -> &str {
    symbol.split('/').next().unwrap_or(symbol)
}

fn quote_asset(symbol: &str) -> &str {
    symbol.split('/').nth(1).unwrap_or("USDT")
}

// ---------------------------------------------------------------------------
// Paper exchange
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PaperInner {
    prices: HashMap<String, Decimal>,
    balances: HashMap<String, Decimal>,
    orders: HashMap<String, OrderRecord>,
    by_client: HashMap<String, String>,
    fail_stop_orders: bool,
    fail_market_orders: bool,
    seq: u64,
}

/// In-process exchange simulator for paper mode and tests.
///
/// Fill prices carry a small random jitter around the quoted price. Stop
/// orders are triggered by `set_price` crossing the stop, which lets tests
/// replay the exchange acting while the bot is down.
pub struct PaperExchange {
    inner: Mutex<PaperInner>,
    min_qty: Decimal,
    step: Decimal,
}

impl PaperExchange {
    pub fn new(starting_cash: Decimal) -> Self {
        let mut inner = PaperInner::default();
        inner.balances.insert("USDT".to_string(), starting_cash);
        Self {
            inner: Mutex::new(inner),
            min_qty: Decimal::new(1, 4),
            step: Decimal::new(1, 4),
        }
    }

    /// Move the market. Any live stop with a trigger at or above the new
    /// price fills at its trigger price.
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        let mut inner = self.inner.lock().expect("paper exchange lock");
        inner.prices.insert(symbol.to_string(), price);

        let triggered: Vec<String> = inner
            .orders
            .values()
            .filter(|o| {
                o.symbol == symbol
                    && o.order_type == OrderType::StopLoss
                    && o.state == OrderState::Open
                    && o.stop_price.map(|sp| price <= sp).unwrap_or(false)
            })
            .map(|o| o.order_id.clone())
            .collect();

        for order_id in triggered {
            Self::fill_stop_locked(&mut inner, &order_id);
        }
    }

    /// Force-fill a live stop order at its trigger price.
    pub fn fill_stop(&self, order_id: &str) {
        let mut inner = self.inner.lock().expect("paper exchange lock");
        Self::fill_stop_locked(&mut inner, order_id);
    }

    fn fill_stop_locked(inner: &mut PaperInner, order_id: &str) {
        let Some(order) = inner.orders.get(order_id).cloned() else {
            return;
        };
        if order.state != OrderState::Open {
            return;
        }
        let fill_price = order.stop_price.unwrap_or(Decimal::ZERO);
        let proceeds = fill_price * order.quantity;

        let base = base_asset(&order.symbol).to_string();
        let quote = quote_asset(&order.symbol).to_string();
        *inner.balances.entry(base).or_insert(Decimal::ZERO) -= order.quantity;
        *inner.balances.entry(quote).or_insert(Decimal::ZERO) += proceeds;

        let stored = inner.orders.get_mut(order_id).expect("order exists");
        stored.state = OrderState::Filled;
        stored.price = Some(fill_price);
    }

    /// Simulate the base asset vanishing (withdrawn or sold out-of-band).
    pub fn drain_asset(&self, asset: &str) {
        let mut inner = self.inner.lock().expect("paper exchange lock");
        inner.balances.insert(asset.to_string(), Decimal::ZERO);
    }

    pub fn fail_stop_orders(&self, fail: bool) {
        self.inner.lock().expect("paper exchange lock").fail_stop_orders = fail;
    }

    pub fn fail_market_orders(&self, fail: bool) {
        self.inner.lock().expect("paper exchange lock").fail_market_orders = fail;
    }

    fn next_order_id(inner: &mut PaperInner) -> String {
        inner.seq += 1;
        format!("paper-{}", inner.seq)
    }

    /// Fill price jitter of a few basis points, mimicking spread and
    /// slippage on market orders.
    fn jitter(price: Decimal) -> Decimal {
        let bps: i64 = rand::thread_rng().gen_range(-3..=3);
        price * (Decimal::ONE + Decimal::new(bps, 4))
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn current_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let inner = self.inner.lock().expect("paper exchange lock");
        inner
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Protocol(format!("no quote for {symbol}")))
    }

    async fn balance(&self, currency: &str) -> Result<Decimal, ExchangeError> {
        let inner = self.inner.lock().expect("paper exchange lock");
        Ok(inner.balances.get(currency).copied().unwrap_or(Decimal::ZERO))
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        client_id: &str,
    ) -> Result<OrderRecord, ExchangeError> {
        let mut inner = self.inner.lock().expect("paper exchange lock");

        if let Some(existing) = inner.by_client.get(client_id) {
            let order = inner.orders.get(existing).cloned();
            if let Some(order) = order {
                debug!(client_id, order_id = %order.order_id, "duplicate market order suppressed");
                return Ok(order);
            }
        }
        if inner.fail_market_orders {
            return Err(ExchangeError::Rejected("simulated market order failure".into()));
        }

        let quote_price = inner
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Protocol(format!("no quote for {symbol}")))?;
        let fill_price = Self::jitter(quote_price);
        let notional = fill_price * quantity;

        let base = base_asset(symbol).to_string();
        let quote = quote_asset(symbol).to_string();
        match side {
            OrderSide::Buy => {
                let cash = inner.balances.get(&quote).copied().unwrap_or(Decimal::ZERO);
                if cash < notional {
                    return Err(ExchangeError::Rejected(format!(
                        "insufficient {quote}: have {cash}, need {notional}"
                    )));
                }
                *inner.balances.entry(quote).or_insert(Decimal::ZERO) -= notional;
                *inner.balances.entry(base).or_insert(Decimal::ZERO) += quantity;
            }
            OrderSide::Sell => {
                let held = inner.balances.get(&base).copied().unwrap_or(Decimal::ZERO);
                if held < quantity {
                    return Err(ExchangeError::Rejected(format!(
                        "insufficient {base}: have {held}, need {quantity}"
                    )));
                }
                *inner.balances.entry(base).or_insert(Decimal::ZERO) -= quantity;
                *inner.balances.entry(quote).or_insert(Decimal::ZERO) += notional;
            }
        }

        let order_id = Self::next_order_id(&mut inner);
        let order = OrderRecord {
            order_id: order_id.clone(),
            client_id: Some(client_id.to_string()),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: Some(fill_price),
            stop_price: None,
            state: OrderState::Filled,
            created_at: Utc::now(),
        };
        inner.orders.insert(order_id.clone(), order.clone());
        inner.by_client.insert(client_id.to_string(), order_id);
        Ok(order)
    }

    async fn place_stop_order(
        &self,
        symbol: &str,
        quantity: Decimal,
        stop_price: Decimal,
        client_id: &str,
    ) -> Result<OrderRecord, ExchangeError> {
        let mut inner = self.inner.lock().expect("paper exchange lock");

        if let Some(existing) = inner.by_client.get(client_id) {
            if let Some(order) = inner.orders.get(existing).cloned() {
                return Ok(order);
            }
        }
        if inner.fail_stop_orders {
            return Err(ExchangeError::Rejected("simulated stop order failure".into()));
        }

        let order_id = Self::next_order_id(&mut inner);
        let order = OrderRecord {
            order_id: order_id.clone(),
            client_id: Some(client_id.to_string()),
            symbol: symbol.to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::StopLoss,
            quantity,
            price: None,
            stop_price: Some(stop_price),
            state: OrderState::Open,
            created_at: Utc::now(),
        };
        inner.orders.insert(order_id.clone(), order.clone());
        inner.by_client.insert(client_id.to_string(), order_id);
        Ok(order)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let mut inner = self.inner.lock().expect("paper exchange lock");
        let order = inner
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))?;
        if order.state == OrderState::Filled {
            return Err(ExchangeError::Rejected(format!(
                "order {order_id} already filled"
            )));
        }
        order.state = OrderState::Cancelled;
        Ok(())
    }

    async fn order_status(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> Result<Option<OrderRecord>, ExchangeError> {
        let inner = self.inner.lock().expect("paper exchange lock");
        Ok(inner.orders.get(order_id).cloned())
    }

    async fn order_by_client_id(
        &self,
        _symbol: &str,
        client_id: &str,
    ) -> Result<Option<OrderRecord>, ExchangeError> {
        let inner = self.inner.lock().expect("paper exchange lock");
        Ok(inner
            .by_client
            .get(client_id)
            .and_then(|id| inner.orders.get(id))
            .cloned())
    }

    async fn position_size(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let inner = self.inner.lock().expect("paper exchange lock");
        Ok(inner
            .balances
            .get(base_asset(symbol))
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    fn min_quantity(&self, _symbol: &str) -> Decimal {
        self.min_qty
    }

    fn quantity_step(&self, _symbol: &str) -> Decimal {
        self.step
    }
}

// ---------------------------------------------------------------------------
// Live broker gateway client
// ---------------------------------------------------------------------------

/// REST client for the broker gateway used in live mode.
pub struct BrokerGatewayClient {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct OrderRequest<'a> {
    symbol: &'a str,
    side: OrderSide,
    order_type: OrderType,
    quantity: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_price: Option<Decimal>,
    client_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    free: Decimal,
}

#[derive(Debug, Deserialize)]
struct SymbolRules {
    min_quantity: Decimal,
    quantity_step: Decimal,
}

impl BrokerGatewayClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, ExchangeError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ExchangeError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND {
            Err(ExchangeError::OrderNotFound(text))
        } else if status.is_client_error() {
            Err(ExchangeError::Rejected(format!("{status} - {text}")))
        } else {
            Err(ExchangeError::Protocol(format!("{status} - {text}")))
        }
    }

    async fn submit_order(&self, req: OrderRequest<'_>) -> Result<OrderRecord, ExchangeError> {
        let url = format!("{}/v1/orders", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .json(&req)
            .send()
            .await?;
        let order: OrderRecord = Self::check(response).await?.json().await?;
        info!(
            order_id = %order.order_id,
            symbol = %order.symbol,
            side = %order.side,
            "order submitted"
        );
        Ok(order)
    }
}

#[async_trait]
impl Exchange for BrokerGatewayClient {
    async fn current_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let url = format!("{}/v1/price/{}", self.base_url, symbol.replace('/', "-"));
        let response = self.client.get(&url).send().await?;
        let data: PriceResponse = Self::check(response).await?.json().await?;
        Ok(data.price)
    }

    async fn balance(&self, currency: &str) -> Result<Decimal, ExchangeError> {
        let url = format!("{}/v1/balance/{}", self.base_url, currency);
        let response = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .send()
            .await?;
        let data: BalanceResponse = Self::check(response).await?.json().await?;
        Ok(data.free)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        client_id: &str,
    ) -> Result<OrderRecord, ExchangeError> {
        self.submit_order(OrderRequest {
            symbol,
            side,
            order_type: OrderType::Market,
            quantity,
            stop_price: None,
            client_id,
        })
        .await
    }

    async fn place_stop_order(
        &self,
        symbol: &str,
        quantity: Decimal,
        stop_price: Decimal,
        client_id: &str,
    ) -> Result<OrderRecord, ExchangeError> {
        self.submit_order(OrderRequest {
            symbol,
            side: OrderSide::Sell,
            order_type: OrderType::StopLoss,
            quantity,
            stop_price: Some(stop_price),
            client_id,
        })
        .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let url = format!(
            "{}/v1/orders/{}?symbol={}",
            self.base_url,
            order_id,
            symbol.replace('/', "-")
        );
        let response = self
            .client
            .delete(&url)
            .header("x-api-key", &self.api_key)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<OrderRecord>, ExchangeError> {
        let url = format!(
            "{}/v1/orders/{}?symbol={}",
            self.base_url,
            order_id,
            symbol.replace('/', "-")
        );
        let response = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .send()
            .await?;
        match Self::check(response).await {
            Ok(resp) => Ok(Some(resp.json().await?)),
            Err(ExchangeError::OrderNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn order_by_client_id(
        &self,
        symbol: &str,
        client_id: &str,
    ) -> Result<Option<OrderRecord>, ExchangeError> {
        let url = format!(
            "{}/v1/orders/by-client/{}?symbol={}",
            self.base_url,
            client_id,
            symbol.replace('/', "-")
        );
        let response = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .send()
            .await?;
        match Self::check(response).await {
            Ok(resp) => Ok(Some(resp.json().await?)),
            Err(ExchangeError::OrderNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn position_size(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.balance(base_asset(symbol)).await
    }

    fn min_quantity(&self, _symbol: &str) -> Decimal {
        Decimal::new(1, 4)
    }

    fn quantity_step(&self, _symbol: &str) -> Decimal {
        Decimal::new(1, 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn market_buy_moves_balances() {
        let exchange = PaperExchange::new(dec("10000"));
        exchange.set_price("BTC/USDT", dec("50000"));

        let order = exchange
            .place_market_order("BTC/USDT", OrderSide::Buy, dec("0.1"), "token-1")
            .await
            .unwrap();
        assert_eq!(order.state, OrderState::Filled);

        let btc = exchange.balance("BTC").await.unwrap();
        assert_eq!(btc, dec("0.1"));
        let usdt = exchange.balance("USDT").await.unwrap();
        assert!(usdt < dec("10000"));
    }

    #[tokio::test]
    async fn duplicate_client_id_returns_original_order() {
        let exchange = PaperExchange::new(dec("100000"));
        exchange.set_price("BTC/USDT", dec("50000"));

        let first = exchange
            .place_market_order("BTC/USDT", OrderSide::Buy, dec("0.1"), "tok")
            .await
            .unwrap();
        let second = exchange
            .place_market_order("BTC/USDT", OrderSide::Buy, dec("0.1"), "tok")
            .await
            .unwrap();

        assert_eq!(first.order_id, second.order_id);
        assert_eq!(exchange.balance("BTC").await.unwrap(), dec("0.1"));
    }

    #[tokio::test]
    async fn stop_triggers_when_price_crosses() {
        let exchange = PaperExchange::new(dec("10000"));
        exchange.set_price("BTC/USDT", dec("50000"));
        exchange
            .place_market_order("BTC/USDT", OrderSide::Buy, dec("0.1"), "entry")
            .await
            .unwrap();

        let stop = exchange
            .place_stop_order("BTC/USDT", dec("0.1"), dec("45000"), "stop")
            .await
            .unwrap();
        assert_eq!(stop.state, OrderState::Open);

        exchange.set_price("BTC/USDT", dec("44000"));

        let filled = exchange
            .order_status("BTC/USDT", &stop.order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(filled.state, OrderState::Filled);
        assert_eq!(filled.price, Some(dec("45000")));
        assert_eq!(exchange.balance("BTC").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn cancel_of_filled_order_is_rejected() {
        let exchange = PaperExchange::new(dec("10000"));
        exchange.set_price("BTC/USDT", dec("50000"));
        exchange
            .place_market_order("BTC/USDT", OrderSide::Buy, dec("0.1"), "entry")
            .await
            .unwrap();
        let stop = exchange
            .place_stop_order("BTC/USDT", dec("0.1"), dec("45000"), "stop")
            .await
            .unwrap();

        exchange.fill_stop(&stop.order_id);
        let err = exchange
            .cancel_order("BTC/USDT", &stop.order_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected(_)));
    }

    #[tokio::test]
    async fn injected_stop_failure_surfaces_as_rejection() {
        let exchange = PaperExchange::new(dec("10000"));
        exchange.set_price("BTC/USDT", dec("50000"));
        exchange.fail_stop_orders(true);

        let err = exchange
            .place_stop_order("BTC/USDT", dec("0.1"), dec("45000"), "stop")
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected(_)));
    }
}
