use crate::Symbol;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A single executed trade on the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: Symbol,
    pub price: Decimal,
    pub quantity: Decimal,
    pub timestamp: DateTime<Utc>,
    /// True when the buyer was the maker, i.e. the aggressor sold.
    pub is_buyer_maker: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// The top of the order book as delivered by a depth or book-ticker stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookUpdate {
    pub symbol: Symbol,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub timestamp: DateTime<Utc>,
}

impl OrderBookUpdate {
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids
            .iter()
            .filter(|level| level.quantity > Decimal::ZERO)
            .max_by(|a, b| a.price.cmp(&b.price))
            .copied()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks
            .iter()
            .filter(|level| level.quantity > Decimal::ZERO)
            .min_by(|a, b| a.price.cmp(&b.price))
            .copied()
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        Some((bid.price + ask.price) / Decimal::TWO)
    }
}

/// A data frame that feeds indicator production.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarketFrame {
    Trade(Trade),
    OrderBook(OrderBookUpdate),
}

impl MarketFrame {
    pub fn symbol(&self) -> &Symbol {
        match self {
            Self::Trade(trade) => &trade.symbol,
            Self::OrderBook(book) => &book.symbol,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Trade(trade) => trade.timestamp,
            Self::OrderBook(book) => book.timestamp,
        }
    }
}

/// A computed market metric at one point in time. Never mutated after it is
/// published; a newer snapshot replaces it on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub symbol: Symbol,
    pub indicator: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    /// How much of the indicator's window was backed by data, in `0.0..=1.0`.
    pub confidence: f64,
}

impl IndicatorSnapshot {
    pub fn new(
        symbol: Symbol,
        indicator: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
        confidence: f64,
    ) -> Self {
        Self {
            symbol,
            indicator: indicator.into(),
            value,
            timestamp,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// The latest published snapshot of every indicator for one symbol.
#[derive(Debug, Clone, Default)]
pub struct IndicatorBoard {
    latest: HashMap<String, Arc<IndicatorSnapshot>>,
}

impl IndicatorBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a snapshot, superseding any older one for the same indicator.
    /// Out-of-order snapshots (older than the current one) are ignored.
    pub fn publish(&mut self, snapshot: IndicatorSnapshot) {
        if let Some(current) = self.latest.get(&snapshot.indicator) {
            if current.timestamp > snapshot.timestamp {
                return;
            }
        }
        self.latest
            .insert(snapshot.indicator.clone(), Arc::new(snapshot));
    }

    pub fn latest(&self, indicator: &str) -> Option<Arc<IndicatorSnapshot>> {
        self.latest.get(indicator).cloned()
    }

    pub fn value(&self, indicator: &str) -> Option<f64> {
        self.latest.get(indicator).map(|snapshot| snapshot.value)
    }

    /// Withdraws an indicator that no longer applies, e.g. PnL after a close.
    pub fn remove(&mut self, indicator: &str) -> Option<Arc<IndicatorSnapshot>> {
        self.latest.remove(indicator)
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn board_keeps_newest_snapshot() {
        let symbol = Symbol::new("BTCUSDT");
        let mut board = IndicatorBoard::new();
        board.publish(IndicatorSnapshot::new(symbol.clone(), "price", 10.0, ts(2), 1.0));
        let held = board.latest("price").unwrap();

        board.publish(IndicatorSnapshot::new(symbol.clone(), "price", 9.0, ts(1), 1.0));
        assert_eq!(board.value("price"), Some(10.0));

        board.publish(IndicatorSnapshot::new(symbol, "price", 11.0, ts(3), 1.0));
        assert_eq!(board.value("price"), Some(11.0));
        // Readers holding the old snapshot still see the value they were given.
        assert_eq!(held.value, 10.0);
    }

    #[test]
    fn best_levels_ignore_empty_quantities() {
        let book = OrderBookUpdate {
            symbol: Symbol::new("ETHUSDT"),
            bids: vec![
                PriceLevel { price: dec!(99), quantity: dec!(1) },
                PriceLevel { price: dec!(100), quantity: dec!(0) },
            ],
            asks: vec![
                PriceLevel { price: dec!(102), quantity: dec!(2) },
                PriceLevel { price: dec!(101), quantity: dec!(3) },
            ],
            timestamp: ts(0),
        };
        assert_eq!(book.best_bid().unwrap().price, dec!(99));
        assert_eq!(book.best_ask().unwrap().price, dec!(101));
        assert_eq!(book.mid_price(), Some(dec!(100)));
    }

    #[test]
    fn confidence_is_clamped() {
        let snapshot = IndicatorSnapshot::new(Symbol::new("x"), "price", 1.0, ts(0), 4.0);
        assert_eq!(snapshot.confidence, 1.0);
    }
}
