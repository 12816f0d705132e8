use app_config::IndicatorSettings;
use chrono::{DateTime, Duration, Utc};
use core_types::indicators::{
    BID_ASK_IMBALANCE, PRICE, PRICE_VELOCITY_PCT_S, PUMP_MAGNITUDE_PCT, SPREAD_PCT, TRADE_RATE,
    UNREALIZED_PNL_PCT, VOLUME_SURGE_RATIO,
};
use core_types::{IndicatorBoard, IndicatorSnapshot, MarketFrame, OrderBookUpdate, Side, Symbol, Trade};
use num_traits::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy)]
struct TradePoint {
    at: DateTime<Utc>,
    price: f64,
    quote_volume: f64,
}

/// Turns raw frames for one symbol into indicator snapshots.
///
/// Trade-driven indicators look at a short window (pump, velocity, trade
/// rate) and compare it with a longer baseline (volume surge). Book-driven
/// indicators use the latest depth update only.
#[derive(Debug)]
pub struct IndicatorEngine {
    symbol: Symbol,
    short_window: Duration,
    baseline_window: Duration,
    book_depth: usize,
    trades: VecDeque<TradePoint>,
    last_trade_price: Option<Decimal>,
    last_mid: Option<Decimal>,
    entry: Option<(Side, Decimal)>,
    board: IndicatorBoard,
}

impl IndicatorEngine {
    pub fn new(symbol: Symbol, settings: &IndicatorSettings) -> Self {
        let short = settings.short_window_secs.max(1);
        Self {
            symbol,
            short_window: Duration::seconds(short as i64),
            baseline_window: Duration::seconds(settings.baseline_window_secs.max(short) as i64),
            book_depth: settings.book_depth.max(1),
            trades: VecDeque::new(),
            last_trade_price: None,
            last_mid: None,
            entry: None,
            board: IndicatorBoard::new(),
        }
    }

    pub fn board(&self) -> &IndicatorBoard {
        &self.board
    }

    /// The last trade price, falling back to the book mid.
    pub fn last_price(&self) -> Option<Decimal> {
        self.last_trade_price.or(self.last_mid)
    }

    /// Sets or clears the position that `unrealized_pnl_pct` is measured against.
    pub fn set_entry(&mut self, entry: Option<(Side, Decimal)>) {
        self.entry = entry;
        if entry.is_none() {
            self.board.remove(UNREALIZED_PNL_PCT);
        }
    }

    pub fn on_frame(&mut self, frame: &MarketFrame) -> Vec<IndicatorSnapshot> {
        let mut out = match frame {
            MarketFrame::Trade(trade) => self.on_trade(trade),
            MarketFrame::OrderBook(book) => self.on_book(book),
        };
        if let Some(pnl) = self.unrealized_pnl_pct() {
            out.push(IndicatorSnapshot::new(self.symbol.clone(), UNREALIZED_PNL_PCT, pnl, frame.timestamp(), 1.0));
        }
        for snapshot in &out {
            self.board.publish(snapshot.clone());
        }
        out
    }

    fn on_trade(&mut self, trade: &Trade) -> Vec<IndicatorSnapshot> {
        let (Some(price), Some(quantity)) = (trade.price.to_f64(), trade.quantity.to_f64()) else {
            tracing::warn!(symbol = %self.symbol, price = %trade.price, "Trade price is not representable; skipping.");
            return Vec::new();
        };
        let now = trade.timestamp;
        self.last_trade_price = Some(trade.price);
        self.trades.push_back(TradePoint { at: now, price, quote_volume: price * quantity });

        let baseline_start = now - self.baseline_window;
        while self.trades.front().is_some_and(|t| t.at < baseline_start) {
            self.trades.pop_front();
        }

        let short_start = now - self.short_window;
        let short: Vec<&TradePoint> = self.trades.iter().filter(|t| t.at >= short_start).collect();
        let short_secs = self.short_window.num_milliseconds() as f64 / 1000.0;
        let baseline_secs = self.baseline_window.num_milliseconds() as f64 / 1000.0;

        let covered = self.trades.front().map(|t| seconds_between(t.at, now)).unwrap_or(0.0);
        let short_confidence = covered / short_secs;
        let baseline_confidence = covered / baseline_secs;

        let snapshot = |name: &str, value: f64, confidence: f64| {
            IndicatorSnapshot::new(self.symbol.clone(), name, value, now, confidence)
        };
        let mut out = vec![snapshot(PRICE, price, 1.0)];

        if let Some(first) = short.first() {
            if first.price > 0.0 {
                let pump = (price - first.price) / first.price * 100.0;
                out.push(snapshot(PUMP_MAGNITUDE_PCT, pump, short_confidence));
                let span = seconds_between(first.at, now);
                let velocity = if span > 0.0 { pump / span } else { 0.0 };
                out.push(snapshot(PRICE_VELOCITY_PCT_S, velocity, short_confidence));
            }
        }
        out.push(snapshot(TRADE_RATE, short.len() as f64 / short_secs, short_confidence));

        let short_volume: f64 = short.iter().map(|t| t.quote_volume).sum();
        let baseline_volume: f64 = self.trades.iter().map(|t| t.quote_volume).sum();
        if baseline_volume > 0.0 {
            let ratio = (short_volume / short_secs) / (baseline_volume / baseline_secs);
            out.push(snapshot(VOLUME_SURGE_RATIO, ratio, baseline_confidence));
        }

        out.retain(|s| s.value.is_finite());
        out
    }

    fn on_book(&mut self, book: &OrderBookUpdate) -> Vec<IndicatorSnapshot> {
        let mut out = Vec::new();
        let now = book.timestamp;

        // A zero-priced book carries no usable mid.
        if let Some(mid) = book.mid_price().filter(|mid| *mid > Decimal::ZERO) {
            self.last_mid = Some(mid);
            if let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) {
                let spread = (ask.price - bid.price)
                    .checked_div(mid)
                    .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
                    .and_then(|pct| pct.to_f64());
                if let Some(spread) = spread {
                    out.push(IndicatorSnapshot::new(self.symbol.clone(), SPREAD_PCT, spread, now, 1.0));
                }
            }
        }

        let depth = |levels: &[core_types::PriceLevel]| -> Decimal {
            levels
                .iter()
                .filter(|l| l.quantity > Decimal::ZERO)
                .take(self.book_depth)
                .map(|l| l.quantity)
                .sum()
        };
        let bids = depth(&book.bids);
        let asks = depth(&book.asks);
        let total = bids + asks;
        if total > Decimal::ZERO {
            if let Some(imbalance) = (bids - asks).checked_div(total).and_then(|r| r.to_f64()) {
                out.push(IndicatorSnapshot::new(self.symbol.clone(), BID_ASK_IMBALANCE, imbalance, now, 1.0));
            }
        }
        out
    }

    fn unrealized_pnl_pct(&self) -> Option<f64> {
        let (side, entry) = self.entry?;
        let price = self.last_price()?;
        if entry <= Decimal::ZERO {
            return None;
        }
        let change = (price - entry) / entry * Decimal::ONE_HUNDRED;
        let pnl = match side {
            Side::Long => change,
            Side::Short => -change,
        };
        pnl.to_f64()
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use core_types::PriceLevel;
    use rust_decimal_macros::dec;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn engine() -> IndicatorEngine {
        IndicatorEngine::new(
            Symbol::new("BTCUSDT"),
            &IndicatorSettings { short_window_secs: 60, baseline_window_secs: 600, book_depth: 10 },
        )
    }

    fn trade(secs: i64, price: Decimal, quantity: Decimal) -> MarketFrame {
        MarketFrame::Trade(Trade {
            symbol: Symbol::new("BTCUSDT"),
            price,
            quantity,
            timestamp: at(secs),
            is_buyer_maker: false,
        })
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn pump_velocity_and_rate_over_the_short_window() {
        let mut engine = engine();
        engine.on_frame(&trade(0, dec!(100), dec!(1)));
        engine.on_frame(&trade(10, dec!(105), dec!(1)));

        let board = engine.board();
        assert_eq!(board.value(PRICE), Some(105.0));
        assert!(close(board.value(PUMP_MAGNITUDE_PCT).unwrap(), 5.0));
        assert!(close(board.value(PRICE_VELOCITY_PCT_S).unwrap(), 0.5));
        assert!(close(board.value(TRADE_RATE).unwrap(), 2.0 / 60.0));
        assert_eq!(engine.last_price(), Some(dec!(105)));
    }

    #[test]
    fn old_trades_leave_the_short_window() {
        let mut engine = engine();
        engine.on_frame(&trade(0, dec!(100), dec!(1)));
        engine.on_frame(&trade(120, dec!(110), dec!(1)));
        assert!(close(engine.board().value(PUMP_MAGNITUDE_PCT).unwrap(), 0.0));
        assert!(close(engine.board().value(TRADE_RATE).unwrap(), 1.0 / 60.0));
    }

    #[test]
    fn volume_surge_compares_short_rate_with_baseline_rate() {
        let mut engine = engine();
        engine.on_frame(&trade(0, dec!(100), dec!(1)));
        engine.on_frame(&trade(590, dec!(100), dec!(1)));
        engine.on_frame(&trade(600, dec!(100), dec!(1)));
        // short: 200 quote over 60s; baseline: 300 quote over 600s.
        let expected = (200.0 / 60.0) / (300.0 / 600.0);
        assert!(close(engine.board().value(VOLUME_SURGE_RATIO).unwrap(), expected));
        let snapshot = engine.board().latest(VOLUME_SURGE_RATIO).unwrap();
        assert!(close(snapshot.confidence, 1.0));
    }

    #[test]
    fn book_gives_spread_imbalance_and_a_fallback_price() {
        let mut engine = engine();
        engine.on_frame(&MarketFrame::OrderBook(OrderBookUpdate {
            symbol: Symbol::new("BTCUSDT"),
            bids: vec![PriceLevel { price: dec!(99), quantity: dec!(3) }],
            asks: vec![PriceLevel { price: dec!(101), quantity: dec!(1) }],
            timestamp: at(0),
        }));
        assert!(close(engine.board().value(SPREAD_PCT).unwrap(), 2.0));
        assert!(close(engine.board().value(BID_ASK_IMBALANCE).unwrap(), 0.5));
        assert_eq!(engine.last_price(), Some(dec!(100)));
        assert_eq!(engine.board().value(PRICE), None);
    }

    #[test]
    fn zero_priced_book_is_ignored_for_price_and_spread() {
        let mut engine = engine();
        engine.on_frame(&MarketFrame::OrderBook(OrderBookUpdate {
            symbol: Symbol::new("BTCUSDT"),
            bids: vec![PriceLevel { price: dec!(0), quantity: dec!(1) }],
            asks: vec![PriceLevel { price: dec!(0), quantity: dec!(1) }],
            timestamp: at(0),
        }));
        assert_eq!(engine.board().value(SPREAD_PCT), None);
        assert_eq!(engine.last_price(), None);
        assert!(close(engine.board().value(BID_ASK_IMBALANCE).unwrap(), 0.0));
    }

    #[test]
    fn unrealized_pnl_follows_the_position_side() {
        let mut engine = engine();
        engine.set_entry(Some((Side::Long, dec!(100))));
        engine.on_frame(&trade(0, dec!(110), dec!(1)));
        assert!(close(engine.board().value(UNREALIZED_PNL_PCT).unwrap(), 10.0));

        engine.set_entry(Some((Side::Short, dec!(100))));
        engine.on_frame(&trade(1, dec!(110), dec!(1)));
        assert!(close(engine.board().value(UNREALIZED_PNL_PCT).unwrap(), -10.0));

        engine.set_entry(None);
        assert_eq!(engine.board().value(UNREALIZED_PNL_PCT), None);
    }
}
