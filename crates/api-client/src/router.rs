use crate::types::{WsBookTicker, WsDepthEvent, WsPartialDepth, WsStreamWrapper, WsTradeEvent};
use chrono::{DateTime, Utc};
use core_types::{OrderBookUpdate, StateEventType, Symbol, Trade};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;

/// Called with the event type and the frame text, unmodified.
pub type StateEventHandler = Arc<dyn Fn(StateEventType, &str) + Send + Sync>;

/// The single category an inbound frame falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Trade,
    OrderBook,
    Control,
    StateEvent,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoutedFrame {
    Trade(Trade),
    OrderBook(OrderBookUpdate),
    /// Must be answered with a pong carrying the same payload.
    Ping(Vec<u8>),
    Pong,
    Close(Option<String>),
    StateEvent { kind: StateEventType, payload: String },
    /// Acks, unknown events and malformed frames.
    Other(String),
}

impl RoutedFrame {
    pub fn class(&self) -> FrameClass {
        match self {
            Self::Trade(_) => FrameClass::Trade,
            Self::OrderBook(_) => FrameClass::OrderBook,
            Self::Ping(_) | Self::Pong | Self::Close(_) => FrameClass::Control,
            Self::StateEvent { .. } => FrameClass::StateEvent,
            Self::Other(_) => FrameClass::Other,
        }
    }
}

/// Classifies inbound frames and forwards state-machine events to the
/// registered handlers.
#[derive(Default, Clone)]
pub struct MessageRouter {
    /// Used for payloads that carry no symbol and arrive outside a combined stream.
    default_symbol: Option<Symbol>,
    handlers: Vec<StateEventHandler>,
}

impl fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRouter")
            .field("default_symbol", &self.default_symbol)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_symbol(symbol: Symbol) -> Self {
        Self { default_symbol: Some(symbol), handlers: Vec::new() }
    }

    pub fn on_event(&mut self, handler: impl Fn(StateEventType, &str) + Send + Sync + 'static) {
        self.handlers.push(Arc::new(handler));
    }

    /// Classifies a frame and dispatches it if it is a state-machine event.
    pub fn route(&self, message: &Message, received_at: DateTime<Utc>) -> RoutedFrame {
        let frame = self.classify(message, received_at);
        self.dispatch(&frame);
        frame
    }

    pub fn route_text(&self, text: &str, received_at: DateTime<Utc>) -> RoutedFrame {
        let frame = self.classify_text(text, received_at);
        self.dispatch(&frame);
        frame
    }

    fn dispatch(&self, frame: &RoutedFrame) {
        match frame {
            RoutedFrame::StateEvent { kind, payload } => {
                for handler in &self.handlers {
                    handler(*kind, payload);
                }
            }
            RoutedFrame::Other(reason) => tracing::debug!(reason = %reason, "Dropping unrouted frame."),
            _ => {}
        }
    }

    pub fn classify(&self, message: &Message, received_at: DateTime<Utc>) -> RoutedFrame {
        match message {
            Message::Text(text) => self.classify_text(text.as_str(), received_at),
            Message::Binary(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => self.classify_text(text, received_at),
                Err(_) => RoutedFrame::Other(format!("binary frame of {} bytes", bytes.len())),
            },
            Message::Ping(payload) => RoutedFrame::Ping(payload.to_vec()),
            Message::Pong(_) => RoutedFrame::Pong,
            Message::Close(frame) => RoutedFrame::Close(frame.as_ref().map(|f| f.reason.as_str().to_string())),
            Message::Frame(_) => RoutedFrame::Other("raw frame".to_string()),
        }
    }

    pub fn classify_text(&self, text: &str, received_at: DateTime<Utc>) -> RoutedFrame {
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case("ping") {
            return RoutedFrame::Ping(Vec::new());
        }
        if trimmed.eq_ignore_ascii_case("pong") {
            return RoutedFrame::Pong;
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => self.classify_value(value, Some(trimmed), None, received_at),
            Err(e) => {
                tracing::warn!(error = %e, len = text.len(), "Malformed frame.");
                RoutedFrame::Other(format!("malformed: {}", e))
            }
        }
    }

    fn classify_value(
        &self,
        value: Value,
        raw: Option<&str>,
        stream_symbol: Option<Symbol>,
        received_at: DateTime<Utc>,
    ) -> RoutedFrame {
        if value.get("stream").is_some() && value.get("data").is_some() {
            return match serde_json::from_value::<WsStreamWrapper>(value) {
                Ok(wrapper) => {
                    let symbol = wrapper.symbol();
                    self.classify_value(wrapper.data, None, symbol, received_at)
                }
                Err(e) => RoutedFrame::Other(format!("bad stream wrapper: {}", e)),
            };
        }

        if let Some(tag) = value.get("type").and_then(Value::as_str) {
            if let Some(kind) = StateEventType::from_tag(tag) {
                let payload = raw.map(str::to_string).unwrap_or_else(|| value.to_string());
                return RoutedFrame::StateEvent { kind, payload };
            }
            match tag {
                "ping" => return RoutedFrame::Ping(Vec::new()),
                "pong" => return RoutedFrame::Pong,
                _ => {}
            }
        }
        if value.get("ping").is_some() {
            return RoutedFrame::Ping(Vec::new());
        }
        if value.get("pong").is_some() {
            return RoutedFrame::Pong;
        }

        let event = value.get("e").and_then(Value::as_str).map(str::to_owned);
        match event.as_deref() {
            Some("trade" | "aggTrade") => parse(value, "trade", |t: WsTradeEvent| RoutedFrame::Trade(t.into_trade())),
            Some("depthUpdate") => parse(value, "depth", |d: WsDepthEvent| RoutedFrame::OrderBook(d.into_update())),
            Some("bookTicker") => parse(value, "book ticker", |b: WsBookTicker| {
                RoutedFrame::OrderBook(b.into_update(received_at))
            }),
            Some(other) => RoutedFrame::Other(format!("unhandled event '{}'", other)),
            None if value.get("lastUpdateId").is_some() && value.get("bids").is_some() => {
                let Some(symbol) = stream_symbol.or_else(|| self.default_symbol.clone()) else {
                    return RoutedFrame::Other("partial depth without a symbol".to_string());
                };
                parse(value, "partial depth", |d: WsPartialDepth| {
                    RoutedFrame::OrderBook(d.into_update(symbol, received_at))
                })
            }
            None if ["s", "b", "B", "a", "A"].iter().all(|k| value.get(k).is_some()) => {
                parse(value, "book ticker", |b: WsBookTicker| RoutedFrame::OrderBook(b.into_update(received_at)))
            }
            None if value.get("result").is_some() && value.get("id").is_some() => {
                RoutedFrame::Other("subscription ack".to_string())
            }
            None => RoutedFrame::Other("unrecognised payload".to_string()),
        }
    }
}

fn parse<T, F>(value: Value, what: &str, build: F) -> RoutedFrame
where
    T: serde::de::DeserializeOwned,
    F: FnOnce(T) -> RoutedFrame,
{
    match serde_json::from_value::<T>(value) {
        Ok(payload) => build(payload),
        Err(e) => {
            tracing::warn!(error = %e, kind = what, "Failed to decode market frame.");
            RoutedFrame::Other(format!("bad {} payload: {}", what, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::sync::Mutex;

    fn router() -> MessageRouter {
        MessageRouter::for_symbol(Symbol::new("BTCUSDT"))
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn agg_trade_inside_combined_stream() {
        let text = r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","E":1700000000100,"s":"BTCUSDT","a":5,"p":"42000.5","q":"0.010","f":1,"l":2,"T":1700000000000,"m":true}}"#;
        match router().route_text(text, Utc::now()) {
            RoutedFrame::Trade(trade) => {
                assert_eq!(trade.symbol, Symbol::new("BTCUSDT"));
                assert_eq!(trade.price, dec("42000.5"));
                assert!(trade.is_buyer_maker);
                assert_eq!(trade.timestamp.timestamp_millis(), 1_700_000_000_000);
            }
            other => panic!("expected trade, got {:?}", other),
        }
    }

    #[test]
    fn depth_update_and_partial_depth() {
        let diff = r#"{"e":"depthUpdate","E":1700000000000,"T":1700000000000,"s":"ETHUSDT","U":1,"u":2,"pu":0,"b":[["2000.1","3"]],"a":[["2000.2","1"]]}"#;
        let frame = router().route_text(diff, Utc::now());
        assert_eq!(frame.class(), FrameClass::OrderBook);

        let partial = r#"{"stream":"solusdt@depth5","data":{"lastUpdateId":7,"bids":[["10.0","1"]],"asks":[["10.1","2"]]}}"#;
        match router().route_text(partial, Utc::now()) {
            RoutedFrame::OrderBook(book) => {
                assert_eq!(book.symbol, Symbol::new("SOLUSDT"));
                assert_eq!(book.best_ask().unwrap().price, dec("10.1"));
            }
            other => panic!("expected order book, got {:?}", other),
        }
    }

    #[test]
    fn spot_book_ticker_without_event_type() {
        let text = r#"{"u":400900217,"s":"BNBUSDT","b":"25.35","B":"31.21","a":"25.36","A":"40.66"}"#;
        match router().route_text(text, Utc::now()) {
            RoutedFrame::OrderBook(book) => {
                assert_eq!(book.mid_price(), Some(dec("25.355")));
            }
            other => panic!("expected order book, got {:?}", other),
        }
    }

    #[test]
    fn control_frames() {
        let r = router();
        let now = Utc::now();
        assert_eq!(r.route(&Message::Ping(vec![1, 2].into()), now), RoutedFrame::Ping(vec![1, 2]));
        assert_eq!(r.route(&Message::Pong(Vec::new().into()), now), RoutedFrame::Pong);
        assert_eq!(r.route_text("ping", now).class(), FrameClass::Control);
        assert_eq!(r.route_text(r#"{"pong":123}"#, now), RoutedFrame::Pong);
    }

    #[test]
    fn state_events_are_forwarded_verbatim() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut r = router();
        r.on_event(move |kind, payload| sink.lock().unwrap().push((kind, payload.to_string())));

        let text = r#"{"type":"state_change","symbol":"BTCUSDT","new_state":"IDLE"}"#;
        assert_eq!(r.route_text(text, Utc::now()).class(), FrameClass::StateEvent);
        // A log frame is not a state-machine event.
        r.route_text(r#"{"type":"log","message":"x"}"#, Utc::now());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (StateEventType::StateChange, text.to_string()));
    }

    #[test]
    fn junk_is_dropped_as_other() {
        let r = router();
        assert!(matches!(r.route_text("{not json", Utc::now()), RoutedFrame::Other(_)));
        assert!(matches!(r.route_text(r#"{"result":null,"id":1}"#, Utc::now()), RoutedFrame::Other(_)));
        assert!(matches!(r.route_text(r#"{"e":"kline"}"#, Utc::now()), RoutedFrame::Other(_)));
        // A trade with a missing price is malformed, not a panic.
        assert!(matches!(r.route_text(r#"{"e":"trade","s":"BTCUSDT","q":"1","T":1,"m":false}"#, Utc::now()), RoutedFrame::Other(_)));
    }
}
