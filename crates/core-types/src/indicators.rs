//! Names of the indicators the engine publishes. Strategy validation uses
//! [`BUILTIN`] as its default allowlist.

/// Last traded price (falls back to the book mid before the first trade).
pub const PRICE: &str = "price";
/// Percent change of price across the short window.
pub const PUMP_MAGNITUDE_PCT: &str = "pump_magnitude_pct";
/// Short-window volume against the average volume of the baseline window.
pub const VOLUME_SURGE_RATIO: &str = "volume_surge_ratio";
/// Percent price change per second across the short window.
pub const PRICE_VELOCITY_PCT_S: &str = "price_velocity_pct_s";
/// Trades per second across the short window.
pub const TRADE_RATE: &str = "trade_rate";
/// Best ask minus best bid, as a percent of the mid.
pub const SPREAD_PCT: &str = "spread_pct";
/// `(bids - asks) / (bids + asks)` over the visible book, `-1.0..=1.0`.
pub const BID_ASK_IMBALANCE: &str = "bid_ask_imbalance";
/// Unrealised PnL of the open simulated position, in percent.
pub const UNREALIZED_PNL_PCT: &str = "unrealized_pnl_pct";

pub const BUILTIN: [&str; 8] = [
    PRICE,
    PUMP_MAGNITUDE_PCT,
    VOLUME_SURGE_RATIO,
    PRICE_VELOCITY_PCT_S,
    TRADE_RATE,
    SPREAD_PCT,
    BID_ASK_IMBALANCE,
    UNREALIZED_PNL_PCT,
];
