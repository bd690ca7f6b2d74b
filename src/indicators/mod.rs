// Technical indicators module
// Pure, stateless functions over candle/price slices. Insufficient data
// yields None, never a panic or a made-up value.

pub mod atr;
pub mod cci;
pub mod macd;
pub mod moving_average;
pub mod rsi;

pub use atr::calculate_atr;
pub use cci::calculate_cci;
pub use macd::{calculate_macd_series, MacdPoint};
pub use moving_average::{calculate_ema, calculate_ema_series, calculate_sma};
pub use rsi::calculate_rsi;
