//! The shared schema for every layer of the engine.
//!
//! Symbols, market frames, indicator snapshots, strategy states and the
//! state-event vocabulary are defined exactly once here and consumed by the
//! router, the state machine and the outbound event stream alike.

pub mod error;
pub mod indicators;
pub mod market;
pub mod state;
pub mod types;

// Re-export the most important types for easy access from other crates.
pub use error::{Error, Result};
pub use market::{IndicatorBoard, IndicatorSnapshot, MarketFrame, OrderBookUpdate, PriceLevel, Trade};
pub use state::{SectionId, StateEventType, StrategyState, Transition, TransitionTrigger};
pub use types::{SessionId, Side, Symbol, VolumeTier};
