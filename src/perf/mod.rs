use rust_decimal::Decimal;

use crate::models::TradeRecord;

/// Running win/loss and PnL accounting over completed trades
#[derive(Debug, Default)]
pub struct PerformanceTracker {
    trades: Vec<TradeRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceSummary {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub total_pnl: Decimal,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a loaded trade ledger
    pub fn from_records(trades: Vec<TradeRecord>) -> Self {
        Self { trades }
    }

    pub fn record(&mut self, trade: TradeRecord) {
        tracing::info!(
            symbol = %trade.symbol,
            pnl = %trade.pnl,
            closed_by = ?trade.closed_by,
            "Trade recorded"
        );
        self.trades.push(trade);
    }

    pub fn summary(&self) -> PerformanceSummary {
        let wins = self.trades.iter().filter(|t| t.is_win()).count();
        let losses = self.trades.len() - wins;
        let win_rate = if self.trades.is_empty() {
            0.0
        } else {
            wins as f64 / self.trades.len() as f64
        };
        PerformanceSummary {
            total_trades: self.trades.len(),
            wins,
            losses,
            win_rate,
            total_pnl: self.trades.iter().map(|t| t.pnl).sum(),
        }
    }
}
