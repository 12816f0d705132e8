//! Binance WebSocket payloads, as they arrive on the wire.

use chrono::{DateTime, TimeZone, Utc};
use core_types::{OrderBookUpdate, PriceLevel, Symbol, Trade};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Combined-stream envelope: `{"stream": "btcusdt@aggTrade", "data": {...}}`.
#[derive(Debug, Deserialize, Clone)]
pub struct WsStreamWrapper {
    pub stream: String,
    pub data: serde_json::Value,
}

impl WsStreamWrapper {
    /// The symbol encoded in the stream name, e.g. `btcusdt@depth10` -> `BTCUSDT`.
    pub fn symbol(&self) -> Option<Symbol> {
        self.stream.split('@').next().filter(|s| !s.is_empty()).map(Symbol::new)
    }
}

/// `trade` and `aggTrade` events share every field we need.
#[derive(Debug, Deserialize, Clone)]
pub struct WsTradeEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: Decimal,
    #[serde(rename = "q")]
    pub quantity: Decimal,
    /// Trade time in milliseconds.
    #[serde(rename = "T")]
    pub trade_time: i64,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

impl WsTradeEvent {
    pub fn into_trade(self) -> Trade {
        Trade {
            symbol: Symbol::new(&self.symbol),
            price: self.price,
            quantity: self.quantity,
            timestamp: millis_to_utc(self.trade_time),
            is_buyer_maker: self.is_buyer_maker,
        }
    }
}

/// Diff depth (`depthUpdate`) events. Futures partial-depth streams use the
/// same shape.
#[derive(Debug, Deserialize, Clone)]
pub struct WsDepthEvent {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "b")]
    pub bids: Vec<[Decimal; 2]>,
    #[serde(rename = "a")]
    pub asks: Vec<[Decimal; 2]>,
}

impl WsDepthEvent {
    pub fn into_update(self) -> OrderBookUpdate {
        OrderBookUpdate {
            symbol: Symbol::new(&self.symbol),
            bids: levels(&self.bids),
            asks: levels(&self.asks),
            timestamp: millis_to_utc(self.event_time),
        }
    }
}

/// Spot partial book depth. Carries no symbol; it comes from the stream name.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WsPartialDepth {
    pub last_update_id: u64,
    pub bids: Vec<[Decimal; 2]>,
    pub asks: Vec<[Decimal; 2]>,
}

impl WsPartialDepth {
    pub fn into_update(self, symbol: Symbol, received_at: DateTime<Utc>) -> OrderBookUpdate {
        OrderBookUpdate {
            symbol,
            bids: levels(&self.bids),
            asks: levels(&self.asks),
            timestamp: received_at,
        }
    }
}

/// Best bid/ask ticker. Spot payloads omit `e` and `E`.
#[derive(Debug, Deserialize, Clone)]
pub struct WsBookTicker {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b")]
    pub bid_price: Decimal,
    #[serde(rename = "B")]
    pub bid_qty: Decimal,
    #[serde(rename = "a")]
    pub ask_price: Decimal,
    #[serde(rename = "A")]
    pub ask_qty: Decimal,
    #[serde(rename = "E", default)]
    pub event_time: Option<i64>,
}

impl WsBookTicker {
    pub fn into_update(self, received_at: DateTime<Utc>) -> OrderBookUpdate {
        OrderBookUpdate {
            symbol: Symbol::new(&self.symbol),
            bids: vec![PriceLevel { price: self.bid_price, quantity: self.bid_qty }],
            asks: vec![PriceLevel { price: self.ask_price, quantity: self.ask_qty }],
            timestamp: self.event_time.map(millis_to_utc).unwrap_or(received_at),
        }
    }
}

/// Outgoing `SUBSCRIBE` request, also used as the subscription-refresh probe.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct SubscribeRequest {
    pub method: &'static str,
    pub params: Vec<String>,
    pub id: u64,
}

impl SubscribeRequest {
    pub fn new(params: Vec<String>, id: u64) -> Self {
        Self { method: "SUBSCRIBE", params, id }
    }
}

fn levels(raw: &[[Decimal; 2]]) -> Vec<PriceLevel> {
    raw.iter()
        .map(|[price, quantity]| PriceLevel { price: *price, quantity: *quantity })
        .collect()
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}
