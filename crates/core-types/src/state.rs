use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The lifecycle state of a single strategy instance on one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyState {
    Idle,
    SignalDetected,
    Entering,
    PositionOpen,
    PositionMonitoring,
    Exiting,
    ExitedProfit,
    ExitedLoss,
    /// Forced terminal marker after a manual or emergency stop.
    Stopped,
}

impl StrategyState {
    pub const ALL: [StrategyState; 9] = [
        Self::Idle,
        Self::SignalDetected,
        Self::Entering,
        Self::PositionOpen,
        Self::PositionMonitoring,
        Self::Exiting,
        Self::ExitedProfit,
        Self::ExitedLoss,
        Self::Stopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::SignalDetected => "SIGNAL_DETECTED",
            Self::Entering => "ENTERING",
            Self::PositionOpen => "POSITION_OPEN",
            Self::PositionMonitoring => "POSITION_MONITORING",
            Self::Exiting => "EXITING",
            Self::ExitedProfit => "EXITED_PROFIT",
            Self::ExitedLoss => "EXITED_LOSS",
            Self::Stopped => "STOPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ExitedProfit | Self::ExitedLoss | Self::Stopped)
    }

    /// Whether a simulated position is held while in this state.
    pub fn holds_position(&self) -> bool {
        matches!(self, Self::PositionOpen | Self::PositionMonitoring | Self::Exiting)
    }

    /// The sections that are evaluated while the instance sits in this state.
    pub fn watched_sections(&self) -> &'static [SectionId] {
        match self {
            Self::Idle => &[SectionId::S1],
            Self::SignalDetected => &[SectionId::O1, SectionId::Z1],
            Self::PositionMonitoring => &[SectionId::E1, SectionId::Ze1],
            _ => &[],
        }
    }
}

impl fmt::Display for StrategyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::UnknownState(s.to_string()))
    }
}

/// One phase of the trading decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SectionId {
    /// Signal detection.
    #[serde(rename = "S1")]
    S1,
    /// Signal cancellation.
    #[serde(rename = "O1")]
    O1,
    /// Entry confirmation.
    #[serde(rename = "Z1")]
    Z1,
    /// Profit exit.
    #[serde(rename = "ZE1")]
    Ze1,
    /// Emergency exit.
    #[serde(rename = "E1")]
    E1,
}

impl SectionId {
    pub const ALL: [SectionId; 5] = [Self::S1, Self::O1, Self::Z1, Self::Ze1, Self::E1];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S1 => "S1",
            Self::O1 => "O1",
            Self::Z1 => "Z1",
            Self::Ze1 => "ZE1",
            Self::E1 => "E1",
        }
    }

    /// The field name of this section in the strategy wire schema.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::S1 => "s1_signal",
            Self::O1 => "o1_cancel",
            Self::Z1 => "z1_entry",
            Self::Ze1 => "ze1_close",
            Self::E1 => "emergency_exit",
        }
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SectionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|id| id.as_str().eq_ignore_ascii_case(s) || id.wire_name() == s)
            .ok_or_else(|| Error::UnknownSection(s.to_string()))
    }
}

/// What caused a transition. Section triggers carry the section id; the rest
/// are internal steps of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TransitionTrigger {
    Section(SectionId),
    EntryFill,
    /// The entry order could not be filled; the instance falls back to idle.
    EntryRejected,
    ExitFill,
    MonitorTick,
    ManualStop,
}

impl TransitionTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Section(id) => id.as_str(),
            Self::EntryFill => "entry_fill",
            Self::EntryRejected => "entry_rejected",
            Self::ExitFill => "exit_fill",
            Self::MonitorTick => "monitor_tick",
            Self::ManualStop => "manual_stop",
        }
    }
}

impl From<SectionId> for TransitionTrigger {
    fn from(id: SectionId) -> Self {
        Self::Section(id)
    }
}

impl From<TransitionTrigger> for String {
    fn from(trigger: TransitionTrigger) -> Self {
        trigger.as_str().to_string()
    }
}

impl TryFrom<String> for TransitionTrigger {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "entry_fill" => Ok(Self::EntryFill),
            "entry_rejected" => Ok(Self::EntryRejected),
            "exit_fill" => Ok(Self::ExitFill),
            "monitor_tick" => Ok(Self::MonitorTick),
            "manual_stop" => Ok(Self::ManualStop),
            other => other.parse().map(Self::Section),
        }
    }
}

impl fmt::Display for TransitionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry in an instance's append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: StrategyState,
    pub to: StrategyState,
    pub trigger: TransitionTrigger,
    pub at: DateTime<Utc>,
}

/// The kinds of state-machine frames on the outbound event stream.
///
/// Used both to tag outgoing events and to recognise them on inbound links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateEventType {
    StateChange,
    InstanceAdded,
    InstanceRemoved,
    FullUpdate,
}

impl StateEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateChange => "state_change",
            Self::InstanceAdded => "instance_added",
            Self::InstanceRemoved => "instance_removed",
            Self::FullUpdate => "full_update",
        }
    }

    /// Matches the `type` tag of a frame against the known event types.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "state_change" => Some(Self::StateChange),
            "instance_added" => Some(Self::InstanceAdded),
            "instance_removed" => Some(Self::InstanceRemoved),
            "full_update" => Some(Self::FullUpdate),
            _ => None,
        }
    }
}
