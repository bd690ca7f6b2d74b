use crate::indicators::calculate_ema_series;

/// One MACD observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdPoint {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// MACD series (12/26-style fast/slow EMAs with an EMA signal line)
///
/// Returns one point per bar once both EMAs and the signal line have
/// enough history. Crossover detection needs the last two points.
pub fn calculate_macd_series(
    prices: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> Option<Vec<MacdPoint>> {
    if fast_period >= slow_period {
        return None;
    }
    let fast = calculate_ema_series(prices, fast_period)?;
    let slow = calculate_ema_series(prices, slow_period)?;

    // Align: slow[i] corresponds to fast[i + (slow_period - fast_period)]
    let offset = slow_period - fast_period;
    let macd_line: Vec<f64> = slow
        .iter()
        .enumerate()
        .map(|(i, s)| fast[i + offset] - s)
        .collect();

    let signal = calculate_ema_series(&macd_line, signal_period)?;
    let line_offset = macd_line.len() - signal.len();

    Some(
        signal
            .iter()
            .enumerate()
            .map(|(i, &sig)| {
                let line = macd_line[i + line_offset];
                MacdPoint {
                    line,
                    signal: sig,
                    histogram: line - sig,
                }
            })
            .collect(),
    )
}
