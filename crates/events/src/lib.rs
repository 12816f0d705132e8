// --- Outbound event stream (shared by the engine, the link layer and the web server) ---

use chrono::{DateTime, Utc};
use core_types::{SessionId, Side, StateEventType, StrategyState, Symbol, TransitionTrigger};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Represents a log message event to be sent to the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsLogMessage {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// A state-machine event for one instance: a transition, or the instance
/// appearing or disappearing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub session_id: SessionId,
    pub symbol: Symbol,
    pub strategy_id: String,
    /// `None` for `instance_added`.
    pub previous_state: Option<StrategyState>,
    pub new_state: StrategyState,
    pub timestamp: DateTime<Utc>,
    /// The section id (or internal trigger) that caused the event.
    pub trigger: Option<TransitionTrigger>,
}

/// The simulated position held by an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionView {
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    /// Fee paid on the opening fill.
    pub entry_fee: Decimal,
    pub opened_at: DateTime<Utc>,
}

/// A point-in-time view of one instance, as published by its trading task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceView {
    pub session_id: SessionId,
    pub symbol: Symbol,
    pub strategy_id: String,
    pub state: StrategyState,
    pub entered_at: DateTime<Utc>,
    /// Number of transitions recorded in the instance history.
    pub transitions: usize,
    pub last_price: Option<Decimal>,
    pub position: Option<PositionView>,
    /// Realised PnL of the instance so far, in quote currency.
    pub realized_pnl: Decimal,
}

/// The full, current set of instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullUpdate {
    pub timestamp: DateTime<Utc>,
    pub instances: Vec<InstanceView>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthEventKind {
    PongTimeoutWarning,
    PongTimeoutReconnecting,
    PongRecovered,
    ActivityProbe,
    ActivityTimeout,
    ReconnectScheduled,
    Reconnected,
    ConnectionFailed,
    ConnectionReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A structured diagnostic from a connection's health monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    pub connection_id: String,
    pub symbol: Symbol,
    pub kind: HealthEventKind,
    pub severity: Severity,
    pub consecutive_timeouts: u32,
    pub reconnect_attempt: u32,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A simulated fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub session_id: SessionId,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    /// Present on closing fills.
    pub realized_pnl: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

/// The top-level WebSocket message enum.
/// Internally tagged, so every frame is a flat JSON object with a `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    StateChange(StateEvent),
    InstanceAdded(StateEvent),
    InstanceRemoved(StateEvent),
    FullUpdate(FullUpdate),
    ConnectionHealth(HealthEvent),
    TradeExecuted(TradeEvent),
    Log(WsLogMessage),
}

impl WsMessage {
    /// The state-machine event type of this message, if it is one.
    pub fn state_event_type(&self) -> Option<StateEventType> {
        match self {
            Self::StateChange(_) => Some(StateEventType::StateChange),
            Self::InstanceAdded(_) => Some(StateEventType::InstanceAdded),
            Self::InstanceRemoved(_) => Some(StateEventType::InstanceRemoved),
            Self::FullUpdate(_) => Some(StateEventType::FullUpdate),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::SectionId;

    fn state_event() -> StateEvent {
        StateEvent {
            session_id: SessionId("s-1".into()),
            symbol: Symbol::new("BTCUSDT"),
            strategy_id: "pump".into(),
            previous_state: Some(StrategyState::Idle),
            new_state: StrategyState::SignalDetected,
            timestamp: Utc::now(),
            trigger: Some(TransitionTrigger::Section(SectionId::S1)),
        }
    }

    #[test]
    fn state_change_is_a_flat_typed_frame() {
        let json = serde_json::to_value(WsMessage::StateChange(state_event())).unwrap();
        assert_eq!(json["type"], "state_change");
        assert_eq!(json["symbol"], "BTCUSDT");
        assert_eq!(json["previous_state"], "IDLE");
        assert_eq!(json["new_state"], "SIGNAL_DETECTED");
        assert_eq!(json["trigger"], "S1");
    }

    #[test]
    fn type_tag_agrees_with_shared_schema() {
        let messages = [
            WsMessage::StateChange(state_event()),
            WsMessage::InstanceAdded(state_event()),
            WsMessage::InstanceRemoved(state_event()),
            WsMessage::FullUpdate(FullUpdate { timestamp: Utc::now(), instances: vec![] }),
        ];
        for message in messages {
            let json = serde_json::to_value(&message).unwrap();
            let tag = json["type"].as_str().unwrap();
            assert_eq!(StateEventType::from_tag(tag), message.state_event_type());
        }
    }

    #[test]
    fn health_event_kinds_are_snake_case() {
        let json = serde_json::to_value(HealthEventKind::PongTimeoutReconnecting).unwrap();
        assert_eq!(json, "pong_timeout_reconnecting");
        assert!(Severity::Critical > Severity::Warning);
    }
}
