use chrono::Utc;
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::api::gateway::{ExchangeGateway, OrderRef, OrderRequest, PositionSnapshot};
use crate::error::BotError;
use crate::models::{Candle, OrderBookLevels, Side};
use crate::Result;

const DEFAULT_BASE_URL: &str = "https://api.bybit.com";
const CATEGORY: &str = "linear"; // USDT perpetuals
const RECV_WINDOW: &str = "5000";
const RATE_LIMIT_RPS: u32 = 10;
const MAX_RETRIES: u32 = 3;

type HmacSha256 = Hmac<Sha256>;

// Type alias for the rate limiter to simplify signatures
type BybitRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Signed Bybit v5 REST client.
///
/// Cloneable; all clones share one rate limiter. Transient failures and
/// 429s are retried here with exponential backoff, everything else maps
/// straight into the crate error taxonomy.
#[derive(Clone)]
pub struct BybitClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    rate_limiter: Arc<BybitRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TickerList {
    list: Vec<TickerEntry>,
}

#[derive(Debug, Deserialize)]
struct TickerEntry {
    #[serde(rename = "lastPrice")]
    last_price: String,
}

#[derive(Debug, Deserialize)]
struct KlineResult {
    // Rows newest-first: [startMs, open, high, low, close, volume, turnover]
    list: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct OrderBookResult {
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
    #[serde(rename = "u")]
    update_id: u64,
}

#[derive(Debug, Deserialize)]
struct OrderCreateResult {
    #[serde(rename = "orderId")]
    order_id: String,
    #[serde(rename = "orderLinkId")]
    order_link_id: String,
}

#[derive(Debug, Deserialize)]
struct PositionListResult {
    list: Vec<PositionEntry>,
}

#[derive(Debug, Deserialize)]
struct PositionEntry {
    symbol: String,
    side: String,
    size: String,
    #[serde(rename = "avgPrice")]
    avg_price: String,
    #[serde(rename = "stopLoss", default)]
    stop_loss: String,
    #[serde(rename = "takeProfit", default)]
    take_profit: String,
}

#[derive(Debug, Deserialize)]
struct WalletResult {
    list: Vec<WalletAccount>,
}

#[derive(Debug, Deserialize)]
struct WalletAccount {
    coin: Vec<WalletCoin>,
}

#[derive(Debug, Deserialize)]
struct WalletCoin {
    coin: String,
    #[serde(rename = "walletBalance")]
    wallet_balance: String,
}

impl BybitClient {
    pub fn new(api_key: String, api_secret: String) -> Result<Self> {
        Self::with_base_url(api_key, api_secret, DEFAULT_BASE_URL.to_string())
    }

    /// Base URL override for tests (mockito)
    pub fn with_base_url(api_key: String, api_secret: String, base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| BotError::TransientNetwork(format!("http client: {e}")))?;

        let quota = Quota::per_second(NonZeroU32::new(RATE_LIMIT_RPS).expect("nonzero"));

        Ok(Self {
            client,
            base_url,
            api_key,
            api_secret,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    /// Bybit v5 signature: HMAC-SHA256 over timestamp + key + window + payload
    fn sign(&self, timestamp: &str, payload: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| BotError::Auth(format!("bad api secret: {e}")))?;
        mac.update(timestamp.as_bytes());
        mac.update(self.api_key.as_bytes());
        mac.update(RECV_WINDOW.as_bytes());
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn map_ret_code(code: i64, msg: &str) -> BotError {
        match code {
            10003 | 10004 | 10005 | 33004 => BotError::Auth(format!("{code}: {msg}")),
            10006 | 10018 => BotError::RateLimited {
                retry_after: Duration::from_secs(1),
            },
            10001 | 110001 => BotError::Validation(format!("{code}: {msg}")),
            _ => BotError::ExchangeBusiness(format!("{code}: {msg}")),
        }
    }

    /// Rate-limited request with bounded retry on transient failures.
    ///
    /// `query` is appended to the URL (and signed) for GETs; `body` is the
    /// JSON payload (and signed) for POSTs. Signed endpoints pass
    /// `signed = true`.
    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: Option<&str>,
        body: Option<serde_json::Value>,
        signed: bool,
    ) -> Result<serde_json::Value> {
        let mut url = format!("{}{}", self.base_url, path);
        if let Some(q) = query {
            url.push('?');
            url.push_str(q);
        }
        let body_str = body.as_ref().map(|b| b.to_string()).unwrap_or_default();

        let mut last_err = BotError::TransientNetwork("no attempt made".to_string());
        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            let mut req = self.client.request(method.clone(), &url);
            if signed {
                let timestamp = Utc::now().timestamp_millis().to_string();
                let payload = if body.is_some() {
                    body_str.as_str()
                } else {
                    query.unwrap_or("")
                };
                let signature = self.sign(&timestamp, payload)?;
                req = req
                    .header("X-BAPI-API-KEY", &self.api_key)
                    .header("X-BAPI-TIMESTAMP", timestamp)
                    .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
                    .header("X-BAPI-SIGN", signature);
            }
            if body.is_some() {
                req = req
                    .header("Content-Type", "application/json")
                    .body(body_str.clone());
            }

            let response = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    last_err = BotError::TransientNetwork(e.to_string());
                    let backoff = Duration::from_secs(2u64.pow(attempt));
                    tracing::warn!(
                        path,
                        attempt,
                        "Request failed ({last_err}), backing off {backoff:?}"
                    );
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };

            if response.status().as_u16() == 429 {
                let backoff = Duration::from_secs(2u64.pow(attempt));
                tracing::warn!(path, attempt, "Rate limited (429), backing off {backoff:?}");
                last_err = BotError::RateLimited {
                    retry_after: backoff,
                };
                tokio::time::sleep(backoff).await;
                continue;
            }

            let envelope: Envelope = response.json().await?;
            if envelope.ret_code != 0 {
                let err = Self::map_ret_code(envelope.ret_code, &envelope.ret_msg);
                if err.is_retryable() && attempt < MAX_RETRIES {
                    let backoff = Duration::from_secs(2u64.pow(attempt));
                    tracing::warn!(path, attempt, "Retryable exchange error: {err}");
                    last_err = err;
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                return Err(err);
            }
            return Ok(envelope.result);
        }

        Err(last_err)
    }

    fn parse_decimal(raw: &str, what: &str) -> Result<Decimal> {
        raw.parse()
            .map_err(|_| BotError::Validation(format!("bad {what} from exchange: {raw:?}")))
    }
}

#[async_trait]
impl ExchangeGateway for BybitClient {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderRef> {
        let mut body = serde_json::json!({
            "category": CATEGORY,
            "symbol": request.symbol,
            "side": request.side.as_str(),
            "orderType": request.order_type.as_str(),
            "qty": request.qty.to_string(),
            "reduceOnly": request.reduce_only,
            "orderLinkId": request.client_order_id,
        });
        if let Some(price) = request.price {
            body["price"] = serde_json::json!(price.to_string());
        }
        if let Some(sl) = request.stop_loss {
            body["stopLoss"] = serde_json::json!(sl.to_string());
        }
        if let Some(tp) = request.take_profit {
            body["takeProfit"] = serde_json::json!(tp.to_string());
        }

        let result = self
            .request(
                reqwest::Method::POST,
                "/v5/order/create",
                None,
                Some(body),
                true,
            )
            .await?;
        let created: OrderCreateResult = serde_json::from_value(result)?;
        tracing::info!(
            symbol = %request.symbol,
            side = request.side.as_str(),
            qty = %request.qty,
            order_id = %created.order_id,
            "Order accepted"
        );
        Ok(OrderRef {
            order_id: created.order_id,
            client_order_id: created.order_link_id,
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let body = serde_json::json!({
            "category": CATEGORY,
            "symbol": symbol,
            "orderId": order_id,
        });
        self.request(
            reqwest::Method::POST,
            "/v5/order/cancel",
            None,
            Some(body),
            true,
        )
        .await?;
        Ok(())
    }

    async fn fetch_positions(&self, symbol: &str) -> Result<Vec<PositionSnapshot>> {
        let query = format!("category={CATEGORY}&symbol={symbol}");
        let result = self
            .request(
                reqwest::Method::GET,
                "/v5/position/list",
                Some(&query),
                None,
                true,
            )
            .await?;
        let parsed: PositionListResult = serde_json::from_value(result)?;

        let mut positions = Vec::new();
        for entry in parsed.list {
            let qty = Self::parse_decimal(&entry.size, "position size")?;
            if qty.is_zero() {
                continue;
            }
            let side = match entry.side.as_str() {
                "Buy" => Side::Buy,
                "Sell" => Side::Sell,
                other => {
                    return Err(BotError::Validation(format!(
                        "unknown position side {other:?}"
                    )))
                }
            };
            positions.push(PositionSnapshot {
                symbol: entry.symbol,
                side,
                qty,
                entry_price: Self::parse_decimal(&entry.avg_price, "avg price")?,
                stop_loss: entry.stop_loss.parse().ok(),
                take_profit: entry.take_profit.parse().ok(),
            });
        }
        Ok(positions)
    }

    async fn fetch_balance(&self, asset: &str) -> Result<Decimal> {
        let result = self
            .request(
                reqwest::Method::GET,
                "/v5/account/wallet-balance",
                Some("accountType=UNIFIED"),
                None,
                true,
            )
            .await?;
        let parsed: WalletResult = serde_json::from_value(result)?;
        for account in parsed.list {
            for coin in account.coin {
                if coin.coin == asset {
                    return Self::parse_decimal(&coin.wallet_balance, "wallet balance");
                }
            }
        }
        Err(BotError::StaleData(format!("no balance entry for {asset}")))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let body = serde_json::json!({
            "category": CATEGORY,
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        match self
            .request(
                reqwest::Method::POST,
                "/v5/position/set-leverage",
                None,
                Some(body),
                true,
            )
            .await
        {
            Ok(_) => Ok(()),
            // 110043: leverage already set to this value
            Err(BotError::ExchangeBusiness(msg)) if msg.starts_with("110043") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_trading_stop(&self, symbol: &str, side: Side, stop_loss: Decimal) -> Result<()> {
        let body = serde_json::json!({
            "category": CATEGORY,
            "symbol": symbol,
            "stopLoss": stop_loss.to_string(),
            // one-way mode; hedge mode would need 1 (Buy) / 2 (Sell)
            "positionIdx": 0,
        });
        tracing::debug!(symbol, side = side.as_str(), stop = %stop_loss, "Pushing stop update");
        self.request(
            reqwest::Method::POST,
            "/v5/position/trading-stop",
            None,
            Some(body),
            true,
        )
        .await?;
        Ok(())
    }

    async fn fetch_price(&self, symbol: &str) -> Result<f64> {
        let query = format!("category={CATEGORY}&symbol={symbol}");
        let result = self
            .request(
                reqwest::Method::GET,
                "/v5/market/tickers",
                Some(&query),
                None,
                false,
            )
            .await?;
        let parsed: TickerList = serde_json::from_value(result)?;
        let entry = parsed
            .list
            .first()
            .ok_or_else(|| BotError::StaleData(format!("no ticker for {symbol}")))?;
        entry
            .last_price
            .parse()
            .map_err(|_| BotError::Validation(format!("bad price {:?}", entry.last_price)))
    }

    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let query = format!("category={CATEGORY}&symbol={symbol}&interval={interval}&limit={limit}");
        let result = self
            .request(
                reqwest::Method::GET,
                "/v5/market/kline",
                Some(&query),
                None,
                false,
            )
            .await?;
        let parsed: KlineResult = serde_json::from_value(result)?;

        let mut candles = Vec::with_capacity(parsed.list.len());
        // Bybit returns newest first; we keep series oldest first
        for row in parsed.list.iter().rev() {
            if row.len() < 6 {
                return Err(BotError::Validation(format!("short kline row: {row:?}")));
            }
            let start_ms: i64 = row[0]
                .parse()
                .map_err(|_| BotError::Validation(format!("bad kline start {:?}", row[0])))?;
            let open_time = chrono::DateTime::from_timestamp_millis(start_ms)
                .ok_or_else(|| BotError::Validation(format!("bad kline timestamp {start_ms}")))?;
            let parse = |i: usize| -> Result<f64> {
                row[i]
                    .parse()
                    .map_err(|_| BotError::Validation(format!("bad kline field {:?}", row[i])))
            };
            candles.push(Candle {
                symbol: symbol.to_string(),
                interval: interval.to_string(),
                open_time,
                open: parse(1)?,
                high: parse(2)?,
                low: parse(3)?,
                close: parse(4)?,
                volume: parse(5)?,
            });
        }
        Ok(candles)
    }

    async fn fetch_order_book(&self, symbol: &str, limit: usize) -> Result<OrderBookLevels> {
        let query = format!("category={CATEGORY}&symbol={symbol}&limit={limit}");
        let result = self
            .request(
                reqwest::Method::GET,
                "/v5/market/orderbook",
                Some(&query),
                None,
                false,
            )
            .await?;
        let parsed: OrderBookResult = serde_json::from_value(result)?;

        let convert = |rows: &[[String; 2]], what: &str| -> Result<Vec<(Decimal, Decimal)>> {
            rows.iter()
                .map(|[p, q]| {
                    Ok((
                        Self::parse_decimal(p, what)?,
                        Self::parse_decimal(q, what)?,
                    ))
                })
                .collect()
        };

        Ok(OrderBookLevels {
            symbol: symbol.to_string(),
            bids: convert(&parsed.bids, "bid level")?,
            asks: convert(&parsed.asks, "ask level")?,
            update_id: parsed.update_id,
        })
    }
}
