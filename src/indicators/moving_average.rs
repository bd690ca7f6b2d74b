/// Simple Moving Average over the most recent `period` prices
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Exponential Moving Average, seeded with the SMA of the first `period` prices
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    calculate_ema_series(prices, period)?.last().copied()
}

/// Full EMA series aligned to `prices[period - 1..]`
///
/// Used where crossover detection needs the previous bar as well.
pub fn calculate_ema_series(prices: &[f64], period: usize) -> Option<Vec<f64>> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = prices.iter().take(period).sum::<f64>() / period as f64;
    let mut series = Vec::with_capacity(prices.len() - period + 1);
    series.push(ema);
    for price in &prices[period..] {
        ema = (price - ema) * multiplier + ema;
        series.push(ema);
    }
    Some(series)
}
