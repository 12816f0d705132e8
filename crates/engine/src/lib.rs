//! The trading core: indicator production, the per-instance state machine,
//! the per-symbol trading task and the controller that owns all sessions.

pub mod error;
pub mod indicators;
pub mod machine;
pub mod session;
pub mod task;

pub use error::{Error, Result};
pub use indicators::IndicatorEngine;
pub use machine::{ExitKind, MachineAction, StateMachineInstance, TickOutcome};
pub use session::SessionController;
pub use task::TradingTask;
