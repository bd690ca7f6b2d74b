/// Average True Range (ATR)
///
/// Volatility measure used to size stops and targets. True Range is the
/// greatest of high-low, |high - prev close| and |low - prev close|;
/// the average uses Wilder's smoothing.
use crate::models::Candle;

/// Current ATR value, or None if fewer than `period + 1` candles
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let true_ranges: Vec<f64> = candles
        .windows(2)
        .map(|w| {
            let (prev, cur) = (&w[0], &w[1]);
            (cur.high - cur.low)
                .max((cur.high - prev.close).abs())
                .max((cur.low - prev.close).abs())
        })
        .collect();

    // Seed with a simple average, then Wilder-smooth the rest
    let mut atr = true_ranges.iter().take(period).sum::<f64>() / period as f64;
    for tr in &true_ranges[period..] {
        atr = (atr * (period as f64 - 1.0) + tr) / period as f64;
    }

    Some(atr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candles(bars: &[(f64, f64, f64, f64)]) -> Vec<Candle> {
        bars.iter()
            .enumerate()
            .map(|(i, &(open, high, low, close))| Candle {
                symbol: "BTCUSDT".to_string(),
                interval: "5".to_string(),
                open_time: Utc::now() + chrono::Duration::minutes(5 * i as i64),
                open,
                high,
                low,
                close,
                volume: 1000.0,
            })
            .collect()
    }

    #[test]
    fn test_atr_constant_range() {
        let bars = vec![(100.0, 101.0, 99.0, 100.0); 15];
        let atr = calculate_atr(&candles(&bars), 14).unwrap();
        // Every true range is exactly 2.0
        assert!((atr - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_atr_reflects_volatility() {
        let calm = vec![(100.0, 100.5, 99.5, 100.0); 20];
        let wild = vec![(100.0, 110.0, 90.0, 105.0); 20];
        let calm_atr = calculate_atr(&candles(&calm), 14).unwrap();
        let wild_atr = calculate_atr(&candles(&wild), 14).unwrap();
        assert!(wild_atr > calm_atr * 5.0);
    }

    #[test]
    fn test_atr_insufficient_data() {
        let bars = vec![(100.0, 101.0, 99.0, 100.0); 10];
        assert!(calculate_atr(&candles(&bars), 14).is_none());
        assert!(calculate_atr(&[], 14).is_none());
    }
}
