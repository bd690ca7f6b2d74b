use crate::models::Candle;

/// Commodity Channel Index over typical prices
///
/// CCI = (TP - SMA(TP)) / (0.015 * mean deviation). Readings beyond
/// roughly ±100 mark overbought/oversold extremes.
pub fn calculate_cci(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }

    let typical: Vec<f64> = candles
        .iter()
        .rev()
        .take(period)
        .map(|c| (c.high + c.low + c.close) / 3.0)
        .collect();

    let sma = typical.iter().sum::<f64>() / period as f64;
    let mean_dev = typical.iter().map(|tp| (tp - sma).abs()).sum::<f64>() / period as f64;
    if mean_dev == 0.0 {
        return Some(0.0);
    }

    Some((typical[0] - sma) / (0.015 * mean_dev))
}
