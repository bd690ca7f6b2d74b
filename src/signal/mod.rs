// Signal scoring: weighted factor confluence -> BUY/SELL/HOLD verdict
// with hysteresis and a per-symbol cooldown to stop flip-flopping.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};

use crate::indicators::{
    calculate_atr, calculate_cci, calculate_ema, calculate_macd_series, calculate_rsi,
    calculate_sma,
};
use crate::models::{Candle, Trend, Verdict};

// Frame keys shared between frame building and scoring
pub const RSI: &str = "rsi";
pub const EMA_SHORT: &str = "ema_short";
pub const EMA_LONG: &str = "ema_long";
pub const SMA_LONG: &str = "sma_long";
pub const CCI: &str = "cci";
pub const MACD_DIFF: &str = "macd_diff";
pub const CLOSE: &str = "close";
pub const ATR: &str = "atr";

/// Indicator output resolved once per analysis cycle
#[derive(Debug, Clone, PartialEq)]
pub enum IndicatorValue {
    Scalar(f64),
    /// Short trailing window, oldest first
    Window(Vec<f64>),
    Trend(Trend),
}

/// Mapping from indicator name to its value for one cycle. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct IndicatorFrame {
    values: HashMap<String, IndicatorValue>,
}

impl IndicatorFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: IndicatorValue) {
        self.values.insert(name.into(), value);
    }

    /// Scalar by name; NaN and non-scalar values read as missing
    pub fn scalar(&self, name: &str) -> Option<f64> {
        match self.values.get(name) {
            Some(IndicatorValue::Scalar(v)) if v.is_finite() => Some(*v),
            _ => None,
        }
    }

    pub fn window(&self, name: &str) -> Option<&[f64]> {
        match self.values.get(name) {
            Some(IndicatorValue::Window(w)) => Some(w),
            _ => None,
        }
    }
}

/// Immutable weight profile chosen at startup
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct StrategyProfile {
    pub name: String,
    pub enabled: HashSet<String>,
    pub weights: HashMap<String, f64>,
}

impl StrategyProfile {
    pub fn weight(&self, factor: &str) -> f64 {
        if !self.enabled.contains(factor) {
            return 0.0;
        }
        self.weights.get(factor).copied().unwrap_or(0.0)
    }
}

impl Default for StrategyProfile {
    fn default() -> Self {
        let factors = [
            ("ema_alignment", 0.3),
            ("trend_filter", 0.2),
            ("rsi", 0.25),
            ("cci", 0.15),
            ("macd_cross", 0.3),
            ("orderbook_imbalance", 0.2),
            ("mtf_confluence", 0.25),
        ];
        Self {
            name: "default".to_string(),
            enabled: factors.iter().map(|(n, _)| n.to_string()).collect(),
            weights: factors.iter().map(|(n, w)| (n.to_string(), *w)).collect(),
        }
    }
}

/// Tunables for frame building and verdict derivation
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SignalSettings {
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub ema_short_period: usize,
    pub ema_long_period: usize,
    pub sma_long_period: usize,
    pub cci_period: usize,
    pub cci_band: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub atr_period: usize,
    pub score_threshold: f64,
    pub hysteresis_ratio: f64,
    pub cooldown_secs: i64,
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            ema_short_period: 9,
            ema_long_period: 21,
            sma_long_period: 50,
            cci_period: 20,
            cci_band: 100.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            atr_period: 14,
            score_threshold: 1.0,
            hysteresis_ratio: 0.85,
            cooldown_secs: 60,
        }
    }
}

/// One analysis cycle's outcome
#[derive(Debug, Clone)]
pub struct SignalDecision {
    pub symbol: String,
    pub score: f64,
    pub verdict: Verdict,
    pub contributions: HashMap<String, f64>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct SymbolState {
    verdict: Verdict,
    last_emitted_at: Option<DateTime<Utc>>,
}

/// Combines weighted factors into a stable verdict per symbol.
///
/// Missing or NaN inputs contribute exactly zero. The verdict is a pure
/// function of the score, the hysteresis memory and the cooldown timer.
pub struct ScoringEngine {
    settings: SignalSettings,
    profile: StrategyProfile,
    state: HashMap<String, SymbolState>,
}

impl ScoringEngine {
    pub fn new(settings: SignalSettings, profile: StrategyProfile) -> Self {
        Self {
            settings,
            profile,
            state: HashMap::new(),
        }
    }

    pub fn profile(&self) -> &StrategyProfile {
        &self.profile
    }

    /// Score one cycle and derive the externally visible verdict.
    pub fn score(
        &mut self,
        symbol: &str,
        frame: &IndicatorFrame,
        book_imbalance: Option<f64>,
        mtf_votes: &[Trend],
        now: DateTime<Utc>,
    ) -> SignalDecision {
        let mut contributions = HashMap::new();
        let mut total = 0.0;

        let mut add = |name: &str, value: f64| {
            if value != 0.0 {
                contributions.insert(name.to_string(), value);
            }
            total += value;
        };

        add("ema_alignment", self.ema_alignment(frame));
        add("trend_filter", self.trend_filter(frame));
        add("rsi", self.rsi_band(frame));
        add("cci", self.cci_band(frame));
        add("macd_cross", self.macd_cross(frame));
        add("orderbook_imbalance", self.imbalance_factor(book_imbalance));
        add("mtf_confluence", self.mtf_confluence(mtf_votes));

        let threshold = self.settings.score_threshold;
        let hysteresis_ratio = self.settings.hysteresis_ratio;
        let cooldown_secs = self.settings.cooldown_secs;

        let entry = self.state.entry(symbol.to_string()).or_insert(SymbolState {
            verdict: Verdict::Hold,
            last_emitted_at: None,
        });

        let next = next_verdict(entry.verdict, total, threshold, hysteresis_ratio);
        // Hysteresis memory always advances, even while cooled down
        entry.verdict = next;

        let cooldown = Duration::seconds(cooldown_secs);
        let emitted = if next != Verdict::Hold {
            match entry.last_emitted_at {
                Some(last) if now - last < cooldown => {
                    tracing::info!(
                        symbol,
                        score = total,
                        "Verdict {:?} suppressed by cooldown ({}s window)",
                        next,
                        cooldown_secs
                    );
                    Verdict::Hold
                }
                _ => {
                    entry.last_emitted_at = Some(now);
                    next
                }
            }
        } else {
            Verdict::Hold
        };

        SignalDecision {
            symbol: symbol.to_string(),
            score: total,
            verdict: emitted,
            contributions,
            computed_at: now,
        }
    }

    fn ema_alignment(&self, frame: &IndicatorFrame) -> f64 {
        let w = self.profile.weight("ema_alignment");
        match (frame.scalar(EMA_SHORT), frame.scalar(EMA_LONG)) {
            (Some(short), Some(long)) if short > long => w,
            (Some(short), Some(long)) if short < long => -w,
            _ => 0.0,
        }
    }

    fn trend_filter(&self, frame: &IndicatorFrame) -> f64 {
        let w = self.profile.weight("trend_filter");
        match (frame.scalar(CLOSE), frame.scalar(SMA_LONG)) {
            (Some(close), Some(sma)) if close > sma => w,
            (Some(close), Some(sma)) if close < sma => -w,
            _ => 0.0,
        }
    }

    fn rsi_band(&self, frame: &IndicatorFrame) -> f64 {
        let w = self.profile.weight("rsi");
        match frame.scalar(RSI) {
            Some(rsi) if rsi < self.settings.rsi_oversold => w,
            Some(rsi) if rsi > self.settings.rsi_overbought => -w,
            _ => 0.0,
        }
    }

    fn cci_band(&self, frame: &IndicatorFrame) -> f64 {
        let w = self.profile.weight("cci");
        match frame.scalar(CCI) {
            Some(cci) if cci < -self.settings.cci_band => w,
            Some(cci) if cci > self.settings.cci_band => -w,
            _ => 0.0,
        }
    }

    /// Signal-line crossover against the previous bar; weaker credit for a
    /// histogram that merely keeps its sign.
    fn macd_cross(&self, frame: &IndicatorFrame) -> f64 {
        let w = self.profile.weight("macd_cross");
        let window = match frame.window(MACD_DIFF) {
            Some(win) if win.len() >= 2 => win,
            _ => return 0.0,
        };
        let (prev, cur) = (window[window.len() - 2], window[window.len() - 1]);
        if !prev.is_finite() || !cur.is_finite() {
            return 0.0;
        }
        if prev <= 0.0 && cur > 0.0 {
            w
        } else if prev >= 0.0 && cur < 0.0 {
            -w
        } else if cur > 0.0 {
            w * 0.2
        } else if cur < 0.0 {
            -w * 0.2
        } else {
            0.0
        }
    }

    fn imbalance_factor(&self, imbalance: Option<f64>) -> f64 {
        let w = self.profile.weight("orderbook_imbalance");
        match imbalance {
            Some(i) if i.is_finite() => i.clamp(-1.0, 1.0) * w,
            _ => 0.0,
        }
    }

    /// Normalized balance of higher-timeframe trend votes
    fn mtf_confluence(&self, votes: &[Trend]) -> f64 {
        let w = self.profile.weight("mtf_confluence");
        if votes.is_empty() {
            return 0.0;
        }
        let up = votes.iter().filter(|t| **t == Trend::Up).count() as f64;
        let down = votes.iter().filter(|t| **t == Trend::Down).count() as f64;
        (up - down) / votes.len() as f64 * w
    }
}

/// Verdict state machine.
///
/// From HOLD the score must reach ±threshold. A held BUY survives wobble
/// down to threshold * hysteresis_ratio, drops to HOLD below that, and
/// flips to SELL only when the score crosses -threshold directly.
/// Symmetric for SELL.
fn next_verdict(prev: Verdict, score: f64, threshold: f64, hysteresis_ratio: f64) -> Verdict {
    let keep = threshold * hysteresis_ratio;
    match prev {
        Verdict::Hold => {
            if score >= threshold {
                Verdict::Buy
            } else if score <= -threshold {
                Verdict::Sell
            } else {
                Verdict::Hold
            }
        }
        Verdict::Buy => {
            if score <= -threshold {
                Verdict::Sell
            } else if score >= keep {
                Verdict::Buy
            } else {
                Verdict::Hold
            }
        }
        Verdict::Sell => {
            if score >= threshold {
                Verdict::Buy
            } else if score <= -keep {
                Verdict::Sell
            } else {
                Verdict::Hold
            }
        }
    }
}

/// Which indicator drives a higher-timeframe trend vote
#[derive(Debug, Clone, Copy)]
pub enum TrendIndicator {
    /// Short EMA vs long EMA
    EmaAlignment { short: usize, long: usize },
    /// Last close vs SMA
    SmaFilter { period: usize },
}

/// Pure trend classification of a candle series. No analyzer state, no
/// re-instantiation; safe to call for any timeframe.
pub fn trend_of(candles: &[Candle], kind: TrendIndicator) -> Trend {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    match kind {
        TrendIndicator::EmaAlignment { short, long } => {
            match (
                calculate_ema(&closes, short),
                calculate_ema(&closes, long),
            ) {
                (Some(s), Some(l)) if s > l => Trend::Up,
                (Some(s), Some(l)) if s < l => Trend::Down,
                _ => Trend::Flat,
            }
        }
        TrendIndicator::SmaFilter { period } => {
            match (closes.last(), calculate_sma(&closes, period)) {
                (Some(&close), Some(sma)) if close > sma => Trend::Up,
                (Some(&close), Some(sma)) if close < sma => Trend::Down,
                _ => Trend::Flat,
            }
        }
    }
}

/// Compute the cycle's indicator frame from a candle series.
///
/// Indicators without enough history are simply absent from the frame;
/// scoring treats them as neutral and the cycle carries on.
pub fn build_indicator_frame(candles: &[Candle], settings: &SignalSettings) -> IndicatorFrame {
    let mut frame = IndicatorFrame::new();
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    if let Some(&close) = closes.last() {
        frame.insert(CLOSE, IndicatorValue::Scalar(close));
    }
    if let Some(rsi) = calculate_rsi(&closes, settings.rsi_period) {
        frame.insert(RSI, IndicatorValue::Scalar(rsi));
    } else {
        tracing::warn!("RSI unavailable ({} bars), scoring without it", closes.len());
    }
    if let Some(ema) = calculate_ema(&closes, settings.ema_short_period) {
        frame.insert(EMA_SHORT, IndicatorValue::Scalar(ema));
    }
    if let Some(ema) = calculate_ema(&closes, settings.ema_long_period) {
        frame.insert(EMA_LONG, IndicatorValue::Scalar(ema));
    }
    if let Some(sma) = calculate_sma(&closes, settings.sma_long_period) {
        frame.insert(SMA_LONG, IndicatorValue::Scalar(sma));
    }
    if let Some(cci) = calculate_cci(candles, settings.cci_period) {
        frame.insert(CCI, IndicatorValue::Scalar(cci));
    }
    if let Some(series) = calculate_macd_series(
        &closes,
        settings.macd_fast,
        settings.macd_slow,
        settings.macd_signal,
    ) {
        let diffs: Vec<f64> = series
            .iter()
            .rev()
            .take(2)
            .rev()
            .map(|p| p.histogram)
            .collect();
        frame.insert(MACD_DIFF, IndicatorValue::Window(diffs));
    }
    if let Some(atr) = calculate_atr(candles, settings.atr_period) {
        frame.insert(ATR, IndicatorValue::Scalar(atr));
    }

    frame
}
