use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// OHLCV candlestick data for one (symbol, interval) bar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub interval: String, // Bybit interval code: "1", "5", "60", "240", "D"
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Latest streamed trade price with receipt time for staleness checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub symbol: String,
    pub price: f64,
    pub received_at: DateTime<Utc>,
}

impl TickerSnapshot {
    /// Age of the snapshot relative to `now`
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.received_at
    }
}

/// Raw two-sided level list as delivered by the wire (REST snapshot or
/// stream payload), before the book engine applies it
#[derive(Debug, Clone, Default)]
pub struct OrderBookLevels {
    pub symbol: String,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    pub update_id: u64,
}

/// Position side on a perpetual contract
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Bybit wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }
}

/// Externally visible trading verdict
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Verdict {
    Buy,
    Sell,
    Hold,
}

/// Direction vote from a single higher-timeframe trend check
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Trend {
    Up,
    Down,
    Flat,
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClosedBy {
    StopLoss,
    TakeProfit,
    TrailingStop,
    /// The exchange reports the position gone (liquidation, manual close, ...)
    ExchangeClosed,
    Signal,
    Manual,
}

/// Immutable completed-trade summary, written once per closed position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub pnl: Decimal,
    pub closed_by: ClosedBy,
}

impl TradeRecord {
    pub fn is_win(&self) -> bool {
        self.pnl > Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
        assert_eq!(Side::Buy.as_str(), "Buy");
    }

    #[test]
    fn test_ticker_age() {
        let snap = TickerSnapshot {
            symbol: "BTCUSDT".to_string(),
            price: 20000.0,
            received_at: Utc::now() - chrono::Duration::seconds(30),
        };
        assert!(snap.age(Utc::now()).num_seconds() >= 30);
    }

    #[test]
    fn test_trade_record_win() {
        let record = TradeRecord {
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            qty: "0.5".parse().unwrap(),
            entry_price: "20000".parse().unwrap(),
            exit_price: "20100".parse().unwrap(),
            entry_time: Utc::now(),
            exit_time: Utc::now(),
            pnl: "50".parse().unwrap(),
            closed_by: ClosedBy::TakeProfit,
        };
        assert!(record.is_win());
    }
}
