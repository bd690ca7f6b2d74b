use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::{Candle, OrderBookLevels, Side};
use crate::Result;

/// Order type on the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "Market",
            OrderType::Limit => "Limit",
        }
    }
}

/// A single order submission. `client_order_id` is mandatory so retries
/// of a mutating call stay idempotent on the exchange side.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub reduce_only: bool,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub client_order_id: String,
}

/// Exchange acknowledgement of an accepted order
#[derive(Debug, Clone)]
pub struct OrderRef {
    pub order_id: String,
    pub client_order_id: String,
}

/// Exchange-reported position, the authority during reconciliation
#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// Signed request execution against the exchange.
///
/// Implementations own retry/backoff for transient failures; callers see
/// the error taxonomy from `crate::error` and decide per policy. The
/// market-data getters back the synchronizer's REST fallback path.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderRef>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()>;

    async fn fetch_positions(&self, symbol: &str) -> Result<Vec<PositionSnapshot>>;

    async fn fetch_balance(&self, asset: &str) -> Result<Decimal>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    /// Amend the active stop of an open position (trailing-stop pushes)
    async fn set_trading_stop(&self, symbol: &str, side: Side, stop_loss: Decimal) -> Result<()>;

    async fn fetch_price(&self, symbol: &str) -> Result<f64>;

    async fn fetch_klines(&self, symbol: &str, interval: &str, limit: usize)
        -> Result<Vec<Candle>>;

    async fn fetch_order_book(&self, symbol: &str, limit: usize) -> Result<OrderBookLevels>;
}
