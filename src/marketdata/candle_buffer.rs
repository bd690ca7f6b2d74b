use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use crate::error::BotError;
use crate::models::Candle;
use crate::Result;

/// Thread-safe rolling window of candles per (symbol, interval)
///
/// Kline stream updates arrive repeatedly for the in-progress bar; an
/// upsert keyed on `open_time` keeps exactly one entry per bar and the
/// series sorted oldest first.
#[derive(Clone)]
pub struct CandleBuffer {
    data: Arc<RwLock<HashMap<(String, String), VecDeque<Candle>>>>,
    max_candles: usize,
}

impl CandleBuffer {
    pub fn new(max_candles: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            max_candles,
        }
    }

    /// Insert or replace the bar with this candle's `open_time`
    pub fn upsert(&self, candle: Candle) -> Result<()> {
        let mut data = self
            .data
            .write()
            .map_err(|_| BotError::Other(anyhow::anyhow!("candle buffer lock poisoned")))?;

        let key = (candle.symbol.clone(), candle.interval.clone());
        let series = data.entry(key).or_default();

        match series.iter().position(|c| c.open_time >= candle.open_time) {
            Some(i) if series[i].open_time == candle.open_time => series[i] = candle,
            Some(i) => series.insert(i, candle),
            None => series.push_back(candle),
        }

        while series.len() > self.max_candles {
            series.pop_front();
        }
        Ok(())
    }

    /// Replace the whole series for one (symbol, interval), e.g. after a
    /// REST backfill. Input may arrive unsorted.
    pub fn replace(&self, symbol: &str, interval: &str, mut candles: Vec<Candle>) -> Result<()> {
        candles.sort_by_key(|c| c.open_time);
        candles.dedup_by_key(|c| c.open_time);
        if candles.len() > self.max_candles {
            candles.drain(..candles.len() - self.max_candles);
        }

        let mut data = self
            .data
            .write()
            .map_err(|_| BotError::Other(anyhow::anyhow!("candle buffer lock poisoned")))?;
        data.insert(
            (symbol.to_string(), interval.to_string()),
            candles.into_iter().collect(),
        );
        Ok(())
    }

    /// All candles for one (symbol, interval), oldest first
    pub fn get(&self, symbol: &str, interval: &str) -> Result<Vec<Candle>> {
        let data = self
            .data
            .read()
            .map_err(|_| BotError::Other(anyhow::anyhow!("candle buffer lock poisoned")))?;
        Ok(data
            .get(&(symbol.to_string(), interval.to_string()))
            .map(|deque| deque.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn len(&self, symbol: &str, interval: &str) -> Result<usize> {
        let data = self
            .data
            .read()
            .map_err(|_| BotError::Other(anyhow::anyhow!("candle buffer lock poisoned")))?;
        Ok(data
            .get(&(symbol.to_string(), interval.to_string()))
            .map(|deque| deque.len())
            .unwrap_or(0))
    }
}
