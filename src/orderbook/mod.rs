use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// One resting price level on a book side
#[derive(Debug, Clone, PartialEq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub qty: Decimal,
    pub last_seen: DateTime<Utc>,
}

/// Book synchronization state
///
/// A book starts Unsynced and becomes Synced on the first snapshot. Any
/// stream disconnect forces it back to Unsynced; deltas arriving while
/// Unsynced are dropped until the next snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookState {
    Unsynced,
    Synced,
}

/// Point-in-time copy of a book, safe to hand to readers
///
/// Bids are sorted descending, asks ascending.
#[derive(Debug, Clone)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub last_update_id: u64,
    pub synced: bool,
}

impl OrderBook {
    pub fn best_bid_ask(&self) -> (Option<Decimal>, Option<Decimal>) {
        (
            self.bids.first().map(|l| l.price),
            self.asks.first().map(|l| l.price),
        )
    }

    /// Bid/ask spread in basis points of the mid price
    pub fn spread_bps(&self) -> Option<f64> {
        let (bid, ask) = self.best_bid_ask();
        let (bid, ask) = (bid?, ask?);
        if bid.is_zero() || ask.is_zero() || bid >= ask {
            return None;
        }
        let mid = (bid + ask) / Decimal::TWO;
        ((ask - bid) / mid * Decimal::from(10_000)).to_f64()
    }
}

/// Maintains one consistent two-sided sorted book per symbol
///
/// Sides are BTreeMaps keyed by price: O(log n) upsert/delete, first/last
/// key for best-of-side. A level with qty 0 is removed, never stored.
pub struct OrderBookEngine {
    symbol: String,
    bids: BTreeMap<Decimal, PriceLevel>,
    asks: BTreeMap<Decimal, PriceLevel>,
    last_update_id: u64,
    state: BookState,
}

impl OrderBookEngine {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            state: BookState::Unsynced,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn state(&self) -> BookState {
        self.state
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    /// Wholesale replace both sides from a snapshot. Always succeeds and
    /// moves the book to Synced.
    pub fn apply_snapshot(
        &mut self,
        bids: &[(Decimal, Decimal)],
        asks: &[(Decimal, Decimal)],
        update_id: u64,
    ) {
        let now = Utc::now();
        self.bids.clear();
        self.asks.clear();
        for &(price, qty) in bids {
            if qty > Decimal::ZERO {
                self.bids.insert(
                    price,
                    PriceLevel {
                        price,
                        qty,
                        last_seen: now,
                    },
                );
            }
        }
        for &(price, qty) in asks {
            if qty > Decimal::ZERO {
                self.asks.insert(
                    price,
                    PriceLevel {
                        price,
                        qty,
                        last_seen: now,
                    },
                );
            }
        }
        self.last_update_id = update_id;
        self.state = BookState::Synced;
        tracing::debug!(
            symbol = %self.symbol,
            update_id,
            bids = self.bids.len(),
            asks = self.asks.len(),
            "Applied order book snapshot"
        );
    }

    /// Apply an incremental update. Returns true if the delta mutated the
    /// book.
    ///
    /// Deltas while Unsynced are dropped with a warning. A delta with
    /// `update_id <= last_update_id` is a silent no-op, so re-delivery is
    /// idempotent. Pairs with qty 0 delete the level, everything else
    /// upserts it.
    pub fn apply_delta(
        &mut self,
        bids: &[(Decimal, Decimal)],
        asks: &[(Decimal, Decimal)],
        update_id: u64,
    ) -> bool {
        if self.state == BookState::Unsynced {
            tracing::warn!(
                symbol = %self.symbol,
                update_id,
                "Dropping delta for unsynced book, waiting for snapshot"
            );
            return false;
        }
        if update_id <= self.last_update_id {
            return false;
        }

        let now = Utc::now();
        for &(price, qty) in bids {
            if qty.is_zero() {
                self.bids.remove(&price);
            } else {
                self.bids.insert(
                    price,
                    PriceLevel {
                        price,
                        qty,
                        last_seen: now,
                    },
                );
            }
        }
        for &(price, qty) in asks {
            if qty.is_zero() {
                self.asks.remove(&price);
            } else {
                self.asks.insert(
                    price,
                    PriceLevel {
                        price,
                        qty,
                        last_seen: now,
                    },
                );
            }
        }
        self.last_update_id = update_id;
        true
    }

    /// Force the book back to Unsynced (stream disconnect). The sides are
    /// cleared so nothing can read a half-stale book.
    pub fn mark_unsynced(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.state = BookState::Unsynced;
        tracing::info!(symbol = %self.symbol, "Order book marked unsynced");
    }

    /// Best bid (highest) and best ask (lowest), O(1) in practice
    pub fn best_bid_ask(&self) -> (Option<Decimal>, Option<Decimal>) {
        (
            self.bids.keys().next_back().copied(),
            self.asks.keys().next().copied(),
        )
    }

    /// Top-n levels of each side, bids descending / asks ascending
    pub fn depth(&self, n: usize) -> (Vec<PriceLevel>, Vec<PriceLevel>) {
        let bids = self.bids.values().rev().take(n).cloned().collect();
        let asks = self.asks.values().take(n).cloned().collect();
        (bids, asks)
    }

    /// `(bidVol - askVol) / (bidVol + askVol)` over the top-n levels.
    /// Returns 0.0 when both sides are empty.
    pub fn imbalance(&self, n: usize) -> f64 {
        let bid_vol: Decimal = self.bids.values().rev().take(n).map(|l| l.qty).sum();
        let ask_vol: Decimal = self.asks.values().take(n).map(|l| l.qty).sum();
        let total = bid_vol + ask_vol;
        if total.is_zero() {
            return 0.0;
        }
        ((bid_vol - ask_vol) / total).to_f64().unwrap_or(0.0)
    }

    /// Point-in-time copy for readers; never a live handle
    pub fn snapshot(&self) -> OrderBook {
        OrderBook {
            symbol: self.symbol.clone(),
            bids: self.bids.values().rev().cloned().collect(),
            asks: self.asks.values().cloned().collect(),
            last_update_id: self.last_update_id,
            synced: self.state == BookState::Synced,
        }
    }
}
