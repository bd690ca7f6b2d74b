/// Relative Strength Index (RSI), Wilder-smoothed
///
/// Values above ~70 are treated as overbought, below ~30 as oversold.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let mut gains = Vec::with_capacity(prices.len() - 1);
    let mut losses = Vec::with_capacity(prices.len() - 1);
    for w in prices.windows(2) {
        let change = w[1] - w[0];
        gains.push(change.max(0.0));
        losses.push((-change).max(0.0));
    }

    // Seed averages over the first `period` changes, then Wilder-smooth
    let mut avg_gain = gains.iter().take(period).sum::<f64>() / period as f64;
    let mut avg_loss = losses.iter().take(period).sum::<f64>() / period as f64;
    for i in period..gains.len() {
        avg_gain = (avg_gain * (period as f64 - 1.0) + gains[i]) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + losses[i]) / period as f64;
    }

    if avg_loss == 0.0 {
        return Some(100.0);
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rsi_in_range() {
        let prices = vec![
            44.0, 44.25, 44.5, 43.75, 44.0, 44.5, 45.0, 45.5, 45.25, 45.5, 46.0, 46.5, 46.25,
            46.0, 46.5,
        ];
        let rsi = calculate_rsi(&prices, 14).unwrap();
        assert!(rsi > 0.0 && rsi < 100.0);
        // Mostly gains, so RSI should sit above the midline
        assert!(rsi > 50.0);
    }

    #[test]
    fn test_rsi_all_gains_saturates() {
        let prices = vec![100.0, 101.0, 102.0, 103.0, 104.0, 105.0];
        assert_eq!(calculate_rsi(&prices, 5), Some(100.0));
    }

    #[test]
    fn test_rsi_downtrend_is_low() {
        let prices: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        let rsi = calculate_rsi(&prices, 14).unwrap();
        assert!(rsi < 10.0);
    }

    #[test]
    fn test_rsi_insufficient_data() {
        assert!(calculate_rsi(&[100.0, 102.0, 101.0], 14).is_none());
    }
}
